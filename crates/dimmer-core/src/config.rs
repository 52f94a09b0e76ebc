//! Dimmer configuration schema and YAML I/O
//!
//! Configuration is stored as YAML.
//! Default location: `~/.config/dimmer/dimmer.yaml`

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root dimmer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimmerConfig {
    /// How and where the device worker runs
    pub worker: WorkerConfig,
    /// Fade scheduler timing
    pub fade: FadeConfig,
    /// Per-backend settings
    pub devices: DevicesConfig,
}

/// Where the device worker lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Dedicated OS thread in the host process, talking over byte pipes
    #[default]
    Thread,
    /// Separate `dimmer-worker` process, talking over its stdin/stdout
    Process,
}

/// Device worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    /// Worker executable for process mode
    pub program: PathBuf,
    /// Extra arguments passed to the worker executable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Upper bound on how long the worker waits for a request before
    /// refreshing the hardware (DMX refresh period)
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Thread,
            program: PathBuf::from("dimmer-worker"),
            args: Vec::new(),
            // ~44 Hz, the usual full-universe DMX refresh rate
            poll_interval_ms: 23,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Fade scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeConfig {
    /// Longest the scheduler sleeps when no fade is due
    pub idle_interval_ms: u64,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 20,
        }
    }
}

impl FadeConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.max(1))
    }
}

/// Backend settings, one section per built-in backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub daddymax: DaddyMaxConfig,
    pub testdev: TestDevConfig,
}

/// DaddyMax DMX512 dongle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaddyMaxConfig {
    /// Character device exposed by the dongle's kernel driver
    pub device_path: PathBuf,
}

impl Default for DaddyMaxConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/daddymax"),
        }
    }
}

/// Terminal test device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestDevConfig {
    /// Terminal height; determines the channel count
    pub rows: u16,
    /// Terminal width; determines the bar length
    pub columns: u16,
    /// Draw bars to stderr
    pub render: bool,
}

impl Default for TestDevConfig {
    fn default() -> Self {
        Self {
            rows: 25,
            columns: 80,
            render: false,
        }
    }
}

/// Get the default config file path
///
/// Returns: `<config dir>/dimmer/dimmer.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dimmer")
        .join("dimmer.yaml")
}

/// Read a YAML config, falling back to `T::default()`
///
/// A missing file yields the defaults. So does an unreadable or malformed
/// one, with a warning.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::debug!("[config] Reading {:?}", path);

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("[config] No config at {:?}, using defaults", path);
            return T::default();
        }
        Err(e) => {
            log::warn!("[config] Cannot read {:?} ({}), using defaults", path, e);
            return T::default();
        }
    };

    serde_yaml::from_str(&contents).unwrap_or_else(|e| {
        log::warn!("[config] Invalid YAML in {:?} ({}), using defaults", path, e);
        T::default()
    })
}

/// Write a config as YAML, creating missing parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config directory {:?}", parent))?;
    }
    let yaml = serde_yaml::to_string(config).context("serialize config")?;
    std::fs::write(path, yaml).with_context(|| format!("write config {:?}", path))?;

    log::info!("[config] Saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimmerConfig::default();
        assert_eq!(config.worker.mode, WorkerMode::Thread);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(23));
        assert_eq!(config.devices.testdev.rows, 25);
        assert_eq!(config.devices.daddymax.device_path, PathBuf::from("/dev/daddymax"));
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: DimmerConfig = load_config(Path::new("/nonexistent/path/dimmer.yaml"));
        assert_eq!(config, DimmerConfig::default());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
worker:
  mode: process
  program: /usr/libexec/dimmer-worker
devices:
  testdev:
    rows: 50
"#;
        let config: DimmerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.worker.mode, WorkerMode::Process);
        assert_eq!(config.worker.program, PathBuf::from("/usr/libexec/dimmer-worker"));
        assert_eq!(config.worker.poll_interval_ms, 23);
        assert_eq!(config.devices.testdev.rows, 50);
        assert_eq!(config.devices.testdev.columns, 80);
        assert_eq!(config.fade, FadeConfig::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dimmer.yaml");

        let mut config = DimmerConfig::default();
        config.fade.idle_interval_ms = 5;
        config.devices.testdev.render = true;

        save_config(&config, &path).unwrap();
        let loaded: DimmerConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_yaml_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dimmer.yaml");
        std::fs::write(&path, "worker: [not, a, map").unwrap();

        let config: DimmerConfig = load_config(&path);
        assert_eq!(config, DimmerConfig::default());
    }

    #[test]
    fn test_unreadable_path_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config: DimmerConfig = load_config(dir.path());
        assert_eq!(config, DimmerConfig::default());
    }

    #[test]
    fn test_default_path_ends_with_filename() {
        assert!(default_config_path().ends_with("dimmer/dimmer.yaml"));
    }
}
