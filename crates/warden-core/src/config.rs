use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "localhost";

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub plugins: Plugins,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Plugins {
    /// Directory scanned by `load_directory`.
    pub dir: String,
    /// Host the runtime dials; plugins always bind all interfaces.
    pub host: String,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            dir: "plugins".into(),
            host: DEFAULT_HOST.into(),
        }
    }
}

/// Timeouts bounding every wait the runtime performs on a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub ready_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 5_000,
            probe_interval_ms: 25,
            connect_timeout_ms: 1_000,
            call_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.plugins.host.trim().is_empty() {
            bail!("plugins.host must not be empty");
        }
        if self.plugins.dir.trim().is_empty() {
            bail!("plugins.dir must not be empty");
        }
        self.runtime.validate()
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("ready_timeout_ms", self.ready_timeout_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ] {
            if value == 0 {
                bail!("runtime.{field} must be greater than zero");
            }
        }
        if self.probe_interval_ms >= self.ready_timeout_ms {
            bail!(
                "runtime.probe_interval_ms ({}) must be shorter than runtime.ready_timeout_ms ({})",
                self.probe_interval_ms,
                self.ready_timeout_ms
            );
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
        assert_eq!(Config::default().plugins.host, "localhost");
    }

    #[test]
    fn partial_runtime_section_keeps_other_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "runtime": { "call_timeout_ms": 250 }
        }))
        .unwrap();
        assert_eq!(cfg.runtime.call_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.runtime.ready_timeout_ms, 5_000);
        assert_eq!(cfg.plugins.dir, "plugins");
    }

    #[test]
    fn probe_interval_must_fit_inside_ready_timeout() {
        let mut cfg = Config::default();
        cfg.runtime.probe_interval_ms = cfg.runtime.ready_timeout_ms;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("probe_interval_ms"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut cfg = Config::default();
        cfg.runtime.call_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
