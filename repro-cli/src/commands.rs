//! CLI subcommand handlers.

use crate::Commands;
use crate::SubmitArgs;
use crate::TrainArgs;
use anyhow::Context;
use repro_core::load_config;
use repro_ml::ExperimentConfig;
use repro_ml::training::{FileCheckpointStore, build_experiment};
use serde::Serialize;
use tracing::info;

/// Environment fallback for the checkpoint task identity.
const TASK_ID_ENV: &str = "REPRO_TASK_ID";

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args).await,
        Commands::Submit(args) => handle_submit(args).await,
    }
}

/// Seeds given on the command line; absent ones leave the file's values alone.
#[derive(Debug, Serialize)]
struct SeedOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    model_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampler_seed: Option<u64>,
}

/// `--task-id`, else `checkpoint.task_id`, else the environment, else the config fingerprint.
fn resolve_task_id(
    cli: Option<String>,
    config: &ExperimentConfig,
    env: Option<String>,
) -> anyhow::Result<String> {
    if let Some(id) = cli.or_else(|| config.checkpoint.task_id.clone()) {
        return Ok(id);
    }
    if let Some(id) = env.filter(|id| !id.is_empty()) {
        return Ok(id);
    }
    Ok(config.fingerprint()?)
}

async fn handle_train(args: TrainArgs) -> anyhow::Result<()> {
    let overrides = SeedOverrides {
        model_seed: args.model_seed,
        sampler_seed: args.sampler_seed,
    };
    let config: ExperimentConfig = load_config(&args.config, &args.updates, &overrides)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let task_id = resolve_task_id(args.task_id, &config, std::env::var(TASK_ID_ENV).ok())?;
    info!(task_id = %task_id, dir = %config.checkpoint.dir.display(), "Checkpoint store");
    let store = FileCheckpointStore::new(&config.checkpoint.dir, &task_id)?;

    let experiment = build_experiment(&config).await?;
    let mut trainer = experiment.into_trainer(&config, Box::new(store));
    let report = tokio::task::spawn_blocking(move || trainer.run())
        .await
        .context("Training task panicked")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_submit(args: SubmitArgs) -> anyhow::Result<()> {
    let root = args.configs.join(&args.subdir);
    let instances = crate::submit::discover_instances(&root, &args.datasets, &args.models)?;
    if instances.is_empty() {
        println!("No configurations found under {}", root.display());
        return Ok(());
    }

    let lines: Vec<String> = instances
        .iter()
        .map(|instance| {
            crate::submit::format_command_line(instance, &args.experiment, &args.version, args.epochs)
        })
        .collect();
    crate::submit::execute_all(&lines, args.print_only).await
}
