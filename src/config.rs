//! Application constants and layered configuration.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`REDFLAG_*` prefix, `__` separates sections)
//! 2. `./redflag.toml`
//! 3. `~/.config/redflag/config.toml`
//! 4. Built-in defaults
//!
//! `REDFLAG_DELIVERY__MAX_ATTEMPTS=5` maps to `delivery.max_attempts`.

use std::net::SocketAddr;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::intelligence::detection::NEGATED_CONFIDENCE_CEILING;
use crate::intelligence::policy::PolicyConfig;

/// Application-level constants
pub const APP_NAME: &str = "Redflag";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound for the claim lease and the retry backoff ceiling (one day).
pub const MAX_DELAY_SECS: u64 = 86_400;
/// Upper bound for the acknowledgment SLA (thirty days).
pub const MAX_SLA_MINUTES: i64 = 43_200;

/// Get the application data directory
/// ~/Redflag/ on all platforms; falls back to the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default `tracing` filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "redflag_lib=info,redflag=info,tower_http=warn"
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

// ═══════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8088)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: app_data_dir().join("redflag.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// JSON corpus replacing the bundled one. `None` uses the bundled corpus.
    pub corpus_path: Option<PathBuf>,
    /// Preceding tokens scanned for negation markers.
    pub negation_window: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            negation_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Kill switch. When false, rows stay `pending` and the worker idles.
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub workers: usize,
    pub poll_interval_secs: u64,
    /// A claim older than this is considered abandoned by a crashed worker.
    pub claim_lease_secs: u64,
    pub sender_name: String,
    pub sender_email: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 900,
            workers: 4,
            poll_interval_secs: 5,
            claim_lease_secs: 120,
            sender_name: "Redflag Critical Findings".into(),
            sender_email: "alerts@redflag.local".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP endpoint of the transactional email service. Empty = unconfigured.
    pub endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub sla_minutes: i64,
    pub sweep_interval_secs: u64,
    /// Recorded on escalated rows for the out-of-band follow-up.
    pub escalate_to: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sla_minutes: 60,
            sweep_interval_secs: 60,
            escalate_to: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// AppConfig
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl AppConfig {
    /// Load and validate configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// Same as [`AppConfig::load`], reading a `.env` file first if present.
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::load()
    }

    /// Extract and validate from an arbitrary provider chain.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                figment = figment.merge(Toml::file(global_path));
            }
        }

        let local_path = PathBuf::from("redflag.toml");
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed("REDFLAG_").split("__"))
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("redflag").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: String| ConfigError::InvalidValue {
            field: field.into(),
            reason,
        };

        let threshold = self.policy.min_confidence;
        if !(threshold > NEGATED_CONFIDENCE_CEILING && threshold <= 1.0) {
            return Err(invalid(
                "policy.min_confidence",
                format!("must be in ({NEGATED_CONFIDENCE_CEILING}, 1.0], got {threshold}"),
            ));
        }
        if self.detection.negation_window == 0 {
            return Err(invalid("detection.negation_window", "must be at least 1".into()));
        }
        if self.delivery.max_attempts == 0 {
            return Err(invalid("delivery.max_attempts", "must be at least 1".into()));
        }
        if self.delivery.workers == 0 {
            return Err(invalid("delivery.workers", "must be at least 1".into()));
        }
        if self.delivery.backoff_base_secs == 0
            || self.delivery.backoff_max_secs < self.delivery.backoff_base_secs
        {
            return Err(invalid(
                "delivery.backoff_max_secs",
                "base must be positive and not exceed max".into(),
            ));
        }
        if self.delivery.backoff_max_secs > MAX_DELAY_SECS {
            return Err(invalid(
                "delivery.backoff_max_secs",
                format!("must not exceed {MAX_DELAY_SECS}"),
            ));
        }
        if self.delivery.poll_interval_secs == 0 {
            return Err(invalid("delivery.poll_interval_secs", "must be positive".into()));
        }
        if !(1..=MAX_DELAY_SECS).contains(&self.delivery.claim_lease_secs) {
            return Err(invalid(
                "delivery.claim_lease_secs",
                format!("must be in [1, {MAX_DELAY_SECS}]"),
            ));
        }
        if !(1..=MAX_SLA_MINUTES).contains(&self.escalation.sla_minutes) {
            return Err(invalid(
                "escalation.sla_minutes",
                format!("must be in [1, {MAX_SLA_MINUTES}]"),
            ));
        }
        if self.escalation.sweep_interval_secs == 0 {
            return Err(invalid("escalation.sweep_interval_secs", "must be positive".into()));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(invalid("gateway.timeout_secs", "must be positive".into()));
        }
        Ok(())
    }
}
