//! repro CLI: train one trial from YAML, or submit a benchmark sweep.

mod commands;
mod submit;

use clap::Parser;
use repro_core::Update;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Experiment harness for image classifiers
#[derive(Parser, Debug)]
#[command(name = "repro", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a model from a trial configuration
    Train(TrainArgs),
    /// Format (and run) the benchmark job command lines
    Submit(SubmitArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Path to the YAML configuration of the trial
    #[arg(long)]
    config: PathBuf,

    /// Seed for the model's initialization
    #[arg(long)]
    model_seed: Option<u64>,

    /// Seed for the data sampling order
    #[arg(long)]
    sampler_seed: Option<u64>,

    /// Values to update in the configuration file
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE", value_parser = parse_update)]
    updates: Vec<Update>,

    /// Checkpoint task identity (defaults to a hash of the merged configuration)
    #[arg(long)]
    task_id: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SubmitArgs {
    /// Root folder for configs
    #[arg(long, default_value = "configs")]
    configs: PathBuf,

    /// Version of the execution
    #[arg(long)]
    version: String,

    /// Datasets to submit executions for (all when omitted)
    #[arg(long, num_args = 0..)]
    datasets: Vec<String>,

    /// Models to submit executions for (all when omitted)
    #[arg(long, num_args = 0..)]
    models: Vec<String>,

    /// Experiment tag
    #[arg(long, default_value = "benchmark")]
    experiment: String,

    /// Config subdirectory holding `<dataset>/<model>.yaml`
    #[arg(long, default_value = "0.benchmark")]
    subdir: String,

    /// Training epochs per execution
    #[arg(long, default_value_t = 300)]
    epochs: u64,

    /// Print executions but do not execute
    #[arg(long)]
    print_only: bool,
}

fn parse_update(argument: &str) -> Result<Update, String> {
    argument.parse().map_err(|e: repro_core::ConfigError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "repro", "repro")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "repro.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_args() {
        let cli = Cli::try_parse_from([
            "repro",
            "-v",
            "train",
            "--config=trial.yaml",
            "--model-seed",
            "1",
            "--updates",
            "max_epochs=3",
            "optimizer.lr=0.5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.config, PathBuf::from("trial.yaml"));
        assert_eq!(args.model_seed, Some(1));
        assert_eq!(args.sampler_seed, None);
        assert_eq!(args.updates.len(), 2);
        assert_eq!(args.updates[1].key, "optimizer.lr");
    }

    #[test]
    fn test_bad_update_is_a_usage_error() {
        let result = Cli::try_parse_from(["repro", "train", "--config", "t.yaml", "--updates", "lr"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_submit_defaults() {
        let cli = Cli::try_parse_from(["repro", "submit", "--version", "v1", "--print-only"]).unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.configs, PathBuf::from("configs"));
        assert_eq!(args.experiment, "benchmark");
        assert_eq!(args.subdir, "0.benchmark");
        assert_eq!(args.epochs, 300);
        assert!(args.datasets.is_empty());
        assert!(args.print_only);
    }
}
