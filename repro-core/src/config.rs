//! Configuration loading.
//!
//! Uses `figment` for layered configuration: YAML file -> environment ->
//! dotted `KEY=VALUE` updates -> explicit CLI overrides. Nested mappings are
//! merged key by key; scalars and lists from a later layer replace earlier ones.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;

/// Prefix for environment overrides (`REPRO_DATA__BATCH_SIZE=64`).
pub const ENV_PREFIX: &str = "REPRO_";

/// A single dotted-path override such as `optimizer.lr=0.01`.
///
/// The value is parsed as a YAML literal, so `0.01` is a float, `[60, 120]` a
/// list, `true` a boolean and anything unparseable as a scalar stays a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub key: String,
    pub value: serde_yaml::Value,
}

impl FromStr for Update {
    type Err = ConfigError;

    fn from_str(argument: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::InvalidUpdate {
            argument: argument.to_string(),
            message: message.to_string(),
        };

        let (key, raw) = argument
            .split_once('=')
            .ok_or_else(|| invalid("expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(invalid("key must be a non-empty dotted path"));
        }
        if raw.trim().is_empty() {
            return Err(invalid("value is empty"));
        }

        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            key: key.to_string(),
            value,
        })
    }
}

/// Build the merged configuration tree without extracting it.
pub fn build_figment<O: Serialize>(
    path: &Path,
    updates: &[Update],
    overrides: &O,
) -> Result<Figment, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut figment = Figment::from(Yaml::file(path));

    // Environment variables (REPRO_MAX_EPOCHS, REPRO_CHECKPOINT__TASK_ID, etc.)
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    for update in updates {
        tracing::debug!(key = %update.key, "Applying configuration update");
        figment = figment.merge(Serialized::default(&update.key, &update.value));
    }

    figment = figment.merge(Serialized::defaults(overrides));

    Ok(figment)
}

/// Load a typed configuration from a YAML file plus overrides.
pub fn load_config<T, O>(path: &Path, updates: &[Update], overrides: &O) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    O: Serialize,
{
    let figment = build_figment(path, updates, overrides)?;
    figment.extract().map_err(|e| ConfigError::Figment(Box::new(e)))
}
