//! Benchmark job submission: one hyper-parameter search per `<dataset>/<model>.yaml`.

use anyhow::Context;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const SCHEDULER_TEMPLATE: &str =
    "orion hunt -n '{tag}' --config /configs/orion.core/orion_config.yaml";

const TRACKING_TEMPLATE: &str =
    "kleio run --allow-host-changes --config /config/kleio.core/kleio_config.yaml --tags '{tag}'";

const SCRIPT_TEMPLATE: &str = "repro train --config={file_path} --model-seed 1 --sampler-seed 1 --updates max_epochs={epochs}";

/// A trial configuration found under the config root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub dataset: String,
    pub model: String,
    pub file_path: PathBuf,
}

/// Every `<root>/<dataset>/<model>.yaml`, sorted, filtered by the optional name lists.
pub fn discover_instances(
    root: &Path,
    datasets: &[String],
    models: &[String],
) -> anyhow::Result<Vec<Instance>> {
    if !root.is_dir() {
        anyhow::bail!("Config directory not found: {}", root.display());
    }

    let mut instances = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "yaml") {
            continue;
        }
        let (Some(model), Some(dataset)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        if !datasets.is_empty() && !datasets.iter().any(|d| d == dataset) {
            continue;
        }
        if !models.is_empty() && !models.iter().any(|m| m == model) {
            continue;
        }
        instances.push(Instance {
            dataset: dataset.to_string(),
            model: model.to_string(),
            file_path: path.to_path_buf(),
        });
    }
    Ok(instances)
}

/// `"{scheduler} {tracking} {script}"` for one instance.
pub fn format_command_line(instance: &Instance, experiment: &str, version: &str, epochs: u64) -> String {
    let tag = format!(
        "{experiment};{};{};{version}",
        instance.dataset, instance.model
    );
    let scheduler = SCHEDULER_TEMPLATE.replace("{tag}", &tag);
    let tracking = TRACKING_TEMPLATE.replace("{tag}", &tag);
    let script = SCRIPT_TEMPLATE
        .replace("{file_path}", &instance.file_path.display().to_string())
        .replace("{epochs}", &epochs.to_string());
    format!("{scheduler} {tracking} {script}")
}

/// Print `line` and, unless `print_only`, run it through `sh -c`. Returns whether it succeeded.
pub async fn execute(line: &str, print_only: bool) -> anyhow::Result<bool> {
    println!("{line}");
    if print_only {
        return Ok(true);
    }
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(line)
        .status()
        .await
        .with_context(|| format!("Failed to spawn: {line}"))?;
    if status.success() {
        info!(%status, "Execution finished");
    } else {
        error!(%status, command = line, "Execution failed");
    }
    Ok(status.success())
}

/// Run every line concurrently; fails if any of them failed.
pub async fn execute_all(lines: &[String], print_only: bool) -> anyhow::Result<()> {
    let results = join_all(lines.iter().map(|line| execute(line, print_only))).await;
    let mut failed = 0;
    for result in results {
        if !result? {
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} executions failed", lines.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn stage(root: &Path) {
        for (dataset, file) in [
            ("tinyimagenet", "resnet18.yaml"),
            ("tinyimagenet", "linear.yaml"),
            ("tinyimagenet", "notes.txt"),
            ("cifar10", "vgg11.yaml"),
        ] {
            let dir = root.join(dataset);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(file), "model: {}\n").unwrap();
        }
        std::fs::write(root.join("stray.yaml"), "").unwrap();
    }

    fn names(instances: &[Instance]) -> Vec<(String, String)> {
        instances
            .iter()
            .map(|i| (i.dataset.clone(), i.model.clone()))
            .collect()
    }

    #[test]
    fn test_discovers_sorted_yaml_instances() {
        let dir = TempDir::new().unwrap();
        stage(dir.path());
        let all = discover_instances(dir.path(), &[], &[]).unwrap();
        assert_eq!(
            names(&all),
            vec![
                ("cifar10".to_string(), "vgg11".to_string()),
                ("tinyimagenet".to_string(), "linear".to_string()),
                ("tinyimagenet".to_string(), "resnet18".to_string()),
            ]
        );
        assert_eq!(all[1].file_path, dir.path().join("tinyimagenet/linear.yaml"));
    }

    #[test]
    fn test_filters() {
        let dir = TempDir::new().unwrap();
        stage(dir.path());
        let some = discover_instances(
            dir.path(),
            &["tinyimagenet".to_string()],
            &["resnet18".to_string(), "vgg11".to_string()],
        )
        .unwrap();
        assert_eq!(
            names(&some),
            vec![("tinyimagenet".to_string(), "resnet18".to_string())]
        );
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(discover_instances(&dir.path().join("nope"), &[], &[]).is_err());
    }

    #[test]
    fn test_command_line_format() {
        let instance = Instance {
            dataset: "tinyimagenet".into(),
            model: "resnet18".into(),
            file_path: PathBuf::from("configs/0.benchmark/tinyimagenet/resnet18.yaml"),
        };
        assert_eq!(
            format_command_line(&instance, "benchmark", "v1", 300),
            "orion hunt -n 'benchmark;tinyimagenet;resnet18;v1' \
             --config /configs/orion.core/orion_config.yaml \
             kleio run --allow-host-changes --config /config/kleio.core/kleio_config.yaml \
             --tags 'benchmark;tinyimagenet;resnet18;v1' \
             repro train --config=configs/0.benchmark/tinyimagenet/resnet18.yaml \
             --model-seed 1 --sampler-seed 1 --updates max_epochs=300"
        );
    }

    #[tokio::test]
    async fn test_print_only_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let line = format!("touch {}; exit 3", marker.display());
        assert!(execute(&line, true).await.unwrap());
        execute_all(&[line], true).await.unwrap();
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failures_are_reported() {
        let lines = vec!["true".to_string(), "exit 3".to_string()];
        let err = execute_all(&lines, false).await.unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 executions failed");
        execute_all(&lines[..1], false).await.unwrap();
    }
}
