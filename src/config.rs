//! Runtime configuration
//!
//! Settings are read from an optional TOML file (by default
//! `~/.kubepulse/config.toml`); command-line flags override individual values.

use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::broadcaster::BroadcastPeriods;
use kubepulse_logs::MultiplexerConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address viewers connect to
    pub listen: SocketAddr,
    /// Kubeconfig file; the default locations are searched when unset
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the current context when unset
    pub context: Option<String>,
    pub namespace: String,
    /// Applied to pod and deployment lists. Empty means no filtering.
    pub label_selector: String,
    /// Container whose logs are followed in multi-container pods
    pub log_container: Option<String>,
    pub tail_lines: i64,
    pub pods_interval_ms: u64,
    pub deployments_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    /// Minimum spacing between log batches on one topic
    pub log_emit_interval_ms: u64,
    /// Frames buffered per viewer before new ones are dropped
    pub viewer_queue_capacity: usize,
    pub gpu: GpuConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuConfig {
    pub enabled: bool,
    /// Path or name of the `nvidia-smi` binary
    pub command: String,
    /// A query still running after this long is killed
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            kubeconfig: None,
            context: None,
            namespace: "default".to_string(),
            label_selector: "portfolio=true".to_string(),
            log_container: None,
            tail_lines: 100,
            pods_interval_ms: 5000,
            deployments_interval_ms: 5000,
            metrics_interval_ms: 2000,
            reconcile_interval_ms: 2000,
            log_emit_interval_ms: 500,
            viewer_queue_capacity: 64,
            gpu: GpuConfig::default(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "nvidia-smi".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl Config {
    /// `~/.kubepulse/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".kubepulse").join("config.toml"))
    }

    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// and a malformed file are errors.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound && !explicit => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).context(format!("Failed to read config file {}", path.display()));
            }
        };

        toml::from_str(&content).context(format!("Invalid config file {}", path.display()))
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("pods_interval_ms", self.pods_interval_ms),
            ("deployments_interval_ms", self.deployments_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("reconcile_interval_ms", self.reconcile_interval_ms),
            ("log_emit_interval_ms", self.log_emit_interval_ms),
            ("gpu.timeout_ms", self.gpu.timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            bail!("{name} must be greater than zero");
        }
        if self.viewer_queue_capacity == 0 {
            bail!("viewer_queue_capacity must be greater than zero");
        }
        if self.tail_lines < 0 {
            bail!("tail_lines must not be negative");
        }
        if self.namespace.is_empty() {
            bail!("namespace must not be empty");
        }
        Ok(())
    }

    pub fn label_selector(&self) -> Option<String> {
        Some(self.label_selector.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn broadcast_periods(&self) -> BroadcastPeriods {
        BroadcastPeriods {
            pods: Duration::from_millis(self.pods_interval_ms),
            deployments: Duration::from_millis(self.deployments_interval_ms),
            metrics: Duration::from_millis(self.metrics_interval_ms),
        }
    }

    pub fn gpu_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu.timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            namespace: self.namespace.clone(),
            container: self.log_container.clone(),
            tail_lines: self.tail_lines,
            min_emit_interval: Duration::from_millis(self.log_emit_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.label_selector(), Some("portfolio=true".to_string()));
        assert_eq!(config.tail_lines, 100);
        assert_eq!(config.broadcast_periods().metrics, Duration::from_secs(2));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(2));
        assert_eq!(
            config.multiplexer_config().min_emit_interval,
            Duration::from_millis(500)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
listen = "127.0.0.1:9000"
namespace = "apps"
label_selector = ""
log_container = "app"

[gpu]
enabled = false
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.namespace, "apps");
        assert_eq!(config.label_selector(), None);
        assert_eq!(config.multiplexer_config().container.as_deref(), Some("app"));
        assert!(!config.gpu.enabled);
        assert_eq!(config.gpu.command, "nvidia-smi");
        assert_eq!(config.gpu_timeout(), Duration::from_secs(2));
        assert_eq!(config.pods_interval_ms, 5000);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let file = write_config("namespace = [1, 2]");
        assert!(Config::load(Some(file.path())).is_err());

        let file = write_config("refresh = 10");
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn test_validate() {
        let config = Config {
            metrics_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metrics_interval_ms"));

        let config = Config {
            viewer_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            tail_lines: -1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            gpu: GpuConfig {
                timeout_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gpu.timeout_ms"));
    }
}
