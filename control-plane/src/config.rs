use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{EngineError, Result};

/// Root configuration for the control plane engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub platform: PlatformConfig,
    pub store: StoreConfig,
    pub nginx: NginxConfig,
    pub acme: AcmeConfig,
    pub waf: WafIngestConfig,
    pub ban: BanConfig,
    pub broadcaster: BroadcasterConfig,
    pub scheduler: SchedulerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub environment: String,
    pub data_root: String,
}

/// Where the embedded relational store keeps its file. `:memory:` is legal
/// and used by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NginxMode {
    Direct,
    SignalFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxConfig {
    pub mode: NginxMode,
    pub binary_path: String,
    pub conf_dir: String,
    pub ssl_dir: String,
    pub test_timeout_seconds: u64,
    pub reload_timeout_seconds: u64,
    /// Signal-file mode only: directory the marker/result files live in.
    pub signal_dir: Option<String>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    pub cli_path: String,
    pub challenge_webroot: String,
    pub letsencrypt_dir: String,
    pub credentials_dir: String,
    pub command_timeout_seconds: u64,
    pub renewal_threshold_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafIngestConfig {
    pub audit_log_paths: Vec<String>,
    pub dedup_capacity: usize,
    pub backfill_window_minutes: i64,
    pub backfill_fallback_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    pub flush_interval_seconds: u64,
    pub inter_op_spacing_ms: u64,
    pub max_retries: u32,
    pub sync_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    pub subscriber_queue_capacity: usize,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Settings-key or env-var name holding the long-term secret PBKDF2
    /// derives credential keys from.
    pub secret_source: String,
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONTROL_PLANE").separator("__"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.nginx.test_timeout_seconds)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.nginx.reload_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.db_path.is_empty() {
            return Err(EngineError::Internal("store.db_path cannot be empty".into()));
        }
        if self.nginx.mode == NginxMode::SignalFile && self.nginx.signal_dir.is_none() {
            return Err(EngineError::Internal(
                "nginx.signal_dir is required when nginx.mode = signal_file".into(),
            ));
        }
        if self.ban.flush_interval_seconds < 5 {
            return Err(EngineError::Internal(
                "ban.flush_interval_seconds must be >= 5 per the rate-limit invariant".into(),
            ));
        }
        if self.ban.max_retries == 0 {
            return Err(EngineError::Internal("ban.max_retries must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig {
                environment: "development".into(),
                data_root: "./data".into(),
            },
            store: StoreConfig {
                db_path: "./data/control-plane.sqlite3".into(),
            },
            nginx: NginxConfig {
                mode: NginxMode::Direct,
                binary_path: "nginx".into(),
                conf_dir: "./data/conf".into(),
                ssl_dir: "./data/ssl".into(),
                test_timeout_seconds: 5,
                reload_timeout_seconds: 5,
                signal_dir: None,
                poll_interval_ms: 100,
            },
            acme: AcmeConfig {
                cli_path: "certbot".into(),
                challenge_webroot: "./data/acme-challenge".into(),
                letsencrypt_dir: "./data/letsencrypt".into(),
                credentials_dir: "./data/certbot-credentials".into(),
                command_timeout_seconds: 300,
                renewal_threshold_days: 30,
            },
            waf: WafIngestConfig {
                audit_log_paths: vec!["/var/log/modsecurity/audit.json".into()],
                dedup_capacity: 100_000,
                backfill_window_minutes: 5,
                backfill_fallback_minutes: 10,
            },
            ban: BanConfig {
                flush_interval_seconds: 5,
                inter_op_spacing_ms: 100,
                max_retries: 3,
                sync_interval_seconds: 300,
            },
            broadcaster: BroadcasterConfig {
                subscriber_queue_capacity: 256,
                heartbeat_interval_seconds: 30,
            },
            scheduler: SchedulerConfig {
                tick_interval_seconds: 30,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9091".into(),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
            },
            crypto: CryptoConfig {
                secret_source: "jwt_secret".into(),
            },
        }
    }
}

/// Reads `path`, falling back to the built-in default (with a logged
/// warning) if no file is present.
pub fn load_or_default(path: &str) -> EngineConfig {
    match EngineConfig::from_file(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            info!(%err, path, "no usable config file, falling back to defaults");
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn signal_file_mode_requires_signal_dir() {
        let mut cfg = EngineConfig::default();
        cfg.nginx.mode = NginxMode::SignalFile;
        cfg.nginx.signal_dir = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ban_flush_interval_floor_is_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.ban.flush_interval_seconds = 1;
        assert!(cfg.validate().is_err());
    }
}
