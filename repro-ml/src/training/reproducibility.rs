//! Device selection and the environment snapshot logged with every run.

use crate::config::DeviceConfig;
use crate::error::MlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the training computation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Gpu,
}

const GPU_PROBES: [&str; 2] = ["/proc/driver/nvidia/version", "/dev/nvidia0"];

/// Whether an NVIDIA driver is visible to this process.
pub fn detect_gpu() -> bool {
    if std::env::var("CUDA_VISIBLE_DEVICES").is_ok_and(|v| v.trim().is_empty() || v == "-1") {
        return false;
    }
    GPU_PROBES.iter().any(|p| Path::new(p).exists())
}

/// Pick the device for this run, failing when a GPU is required but absent.
pub fn ensure_device(config: &DeviceConfig, gpu_available: bool) -> Result<Device, MlError> {
    match (config.require_gpu, gpu_available) {
        (true, false) => Err(MlError::Device(
            "a GPU is required (device.require_gpu) but none was detected".into(),
        )),
        // The built-in models compute on the CPU either way.
        (_, true) => Ok(Device::Gpu),
        (false, false) => Ok(Device::Cpu),
    }
}

/// Host facts recorded at the start of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub platform: String,
    pub arch: String,
    pub device: Device,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentSnapshot {
    pub fn capture(device: Device) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            device,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_gpu_missing_fails() {
        let config = DeviceConfig { require_gpu: true };
        let err = ensure_device(&config, false).unwrap_err();
        assert!(err.to_string().contains("GPU is required"));
        assert_eq!(ensure_device(&config, true).unwrap(), Device::Gpu);
    }

    #[test]
    fn test_optional_gpu() {
        let config = DeviceConfig::default();
        assert_eq!(ensure_device(&config, false).unwrap(), Device::Cpu);
        assert_eq!(ensure_device(&config, true).unwrap(), Device::Gpu);
    }

    #[test]
    fn test_snapshot() {
        let snapshot = EnvironmentSnapshot::capture(Device::Cpu);
        assert_eq!(snapshot.platform, std::env::consts::OS);
        assert!(!snapshot.version.is_empty());
    }
}
