//! TOML configuration file for `intercomd`.
//!
//! Every field is optional; missing values fall back to the protocol
//! defaults. Command-line flags override the file.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use intercom_broker::BrokerConfig;
use serde::Deserialize;

/// Root of the config file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `[broker]` section.
    #[serde(default)]
    pub broker: BrokerSection,
}

/// Broker tuning, `[broker]` in the file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    /// Listen address.
    pub bind: Option<IpAddr>,
    /// Listen port.
    pub port: Option<u16>,
    /// Ring timeout in seconds.
    pub call_timeout_secs: Option<u64>,
    /// Keepalive cadence in seconds.
    pub ping_interval_secs: Option<u64>,
    /// Idle eviction threshold in seconds.
    pub idle_timeout_secs: Option<u64>,
    /// Audio queue depth per device, in frames.
    pub audio_queue_frames: Option<usize>,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Fold the file's `[broker]` section over the defaults.
    pub fn broker_config(&self) -> BrokerConfig {
        let mut cfg = BrokerConfig::default();
        let section = &self.broker;
        if let Some(bind) = section.bind {
            cfg.bind_addr.set_ip(bind);
        }
        if let Some(port) = section.port {
            cfg.bind_addr.set_port(port);
        }
        if let Some(secs) = section.call_timeout_secs {
            cfg.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = section.ping_interval_secs {
            cfg.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = section.idle_timeout_secs {
            cfg.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(frames) = section.audio_queue_frames {
            cfg.audio_queue_frames = frames;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = Config::default().broker_config();
        let defaults = BrokerConfig::default();
        assert_eq!(cfg.bind_addr, defaults.bind_addr);
        assert_eq!(cfg.call_timeout, defaults.call_timeout);
    }

    #[test]
    fn test_load_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nport = 7000\ncall_timeout_secs = 15\naudio_queue_frames = 4"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        let cfg = config.broker_config();
        assert_eq!(cfg.bind_addr.port(), 7000);
        assert_eq!(cfg.call_timeout, Duration::from_secs(15));
        assert_eq!(cfg.audio_queue_frames, 4);
        // untouched fields keep their defaults
        assert_eq!(cfg.ping_interval, BrokerConfig::default().ping_interval);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nbogus = 1").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
