//! Environment-based Configuration for the Federation Signer
//!
//! # Environment Variables
//!
//! ## Service
//! - `FEDSIGN_BIND` - Listen address (default: "127.0.0.1:8090")
//! - `FEDSIGN_DATABASE` - SQLite path, or ":memory:" (default: "data/sessions.db")
//! - `FEDSIGN_REGISTRY` - Guardian registry TOML file (default: "config/registry.toml")
//! - `FEDSIGN_FEDERATION_ID` - Federation this node signs for (required)
//! - `FEDSIGN_PUBLISHER_URL` - Event publisher endpoint (optional; events are only logged without it)
//!
//! ## Session Lifetimes (seconds)
//! - `FEDSIGN_FROST_TTL_SECS` - FROST session TTL (default: 600)
//! - `FEDSIGN_SSS_EMERGENCY_TTL_SECS` - Emergency recovery TTL (default: 300)
//! - `FEDSIGN_SSS_ROTATION_TTL_SECS` - Key rotation TTL (default: 900)
//! - `FEDSIGN_SSS_ROUTINE_TTL_SECS` - Routine reconstruction TTL (default: 1800)
//! - `FEDSIGN_SWEEP_INTERVAL_SECS` - Expiry sweep interval (default: 30)
//!
//! ## Logging
//! - `FEDSIGN_LOG_LEVEL` - trace, debug, info, warn, error (default: info)
//! - `FEDSIGN_LOG_JSON` - Set to "1" for JSON output

use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::types::ReconstructionReason;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Per-reason TTLs of SSS reconstruction sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SssTtls {
    pub emergency_recovery: Duration,
    pub key_rotation: Duration,
    pub routine: Duration,
}

impl SssTtls {
    pub fn for_reason(&self, reason: ReconstructionReason) -> Duration {
        match reason {
            ReconstructionReason::EmergencyRecovery => self.emergency_recovery,
            ReconstructionReason::KeyRotation => self.key_rotation,
            ReconstructionReason::Routine => self.routine,
        }
    }
}

impl Default for SssTtls {
    fn default() -> Self {
        Self {
            emergency_recovery: Duration::from_secs(300),
            key_rotation: Duration::from_secs(900),
            routine: Duration::from_secs(1800),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct SignerConfig {
    /// HTTP listen address
    pub bind: String,

    /// SQLite database path (":memory:" for a transient store)
    pub database: String,

    /// Guardian registry file
    pub registry_path: String,

    /// Federation signed for
    pub federation_id: String,

    /// Event publisher endpoint
    pub publisher_url: Option<String>,

    /// FROST session TTL
    pub frost_ttl: Duration,

    /// SSS session TTLs
    pub sss_ttls: SssTtls,

    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,

    /// Log level
    pub log_level: String,

    /// Emit JSON logs
    pub log_json: bool,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
            database: "data/sessions.db".to_string(),
            registry_path: "config/registry.toml".to_string(),
            federation_id: String::new(),
            publisher_url: None,
            frost_ttl: Duration::from_secs(600),
            sss_ttls: SssTtls::default(),
            sweep_interval: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl SignerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let federation_id = lookup("FEDSIGN_FEDERATION_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("FEDSIGN_FEDERATION_ID".to_string()))?;

        let sss_ttls = SssTtls {
            emergency_recovery: secs(
                &lookup,
                "FEDSIGN_SSS_EMERGENCY_TTL_SECS",
                defaults.sss_ttls.emergency_recovery,
            )?,
            key_rotation: secs(
                &lookup,
                "FEDSIGN_SSS_ROTATION_TTL_SECS",
                defaults.sss_ttls.key_rotation,
            )?,
            routine: secs(&lookup, "FEDSIGN_SSS_ROUTINE_TTL_SECS", defaults.sss_ttls.routine)?,
        };

        let log_level = lookup("FEDSIGN_LOG_LEVEL").unwrap_or(defaults.log_level);
        if !matches!(
            log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            return Err(ConfigError::InvalidValue(
                "FEDSIGN_LOG_LEVEL".to_string(),
                format!("unknown level: {}", log_level),
            ));
        }

        Ok(Self {
            bind: lookup("FEDSIGN_BIND").unwrap_or(defaults.bind),
            database: lookup("FEDSIGN_DATABASE").unwrap_or(defaults.database),
            registry_path: lookup("FEDSIGN_REGISTRY").unwrap_or(defaults.registry_path),
            federation_id,
            publisher_url: lookup("FEDSIGN_PUBLISHER_URL").filter(|v| !v.is_empty()),
            frost_ttl: secs(&lookup, "FEDSIGN_FROST_TTL_SECS", defaults.frost_ttl)?,
            sss_ttls,
            sweep_interval: secs(&lookup, "FEDSIGN_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            log_level,
            log_json: lookup("FEDSIGN_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("=== Federation Signer Configuration ===");
        println!("Federation: {}", self.federation_id);
        println!("Bind: {}", self.bind);
        println!("Database: {}", self.database);
        println!("Registry: {}", self.registry_path);
        println!(
            "Publisher: {}",
            self.publisher_url.as_deref().unwrap_or("(log only)")
        );
        println!("FROST TTL: {}s", self.frost_ttl.as_secs());
        println!(
            "SSS TTLs: emergency {}s, rotation {}s, routine {}s",
            self.sss_ttls.emergency_recovery.as_secs(),
            self.sss_ttls.key_rotation.as_secs(),
            self.sss_ttls.routine.as_secs()
        );
        println!("Sweep Interval: {}s", self.sweep_interval.as_secs());
        println!("Log Level: {}", self.log_level);
        println!("========================================");
    }
}

/// Positive number of seconds, or the default when unset
fn secs<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue(
                name.to_string(),
                "must be a positive number of seconds".to_string(),
            )),
            Ok(n) => Ok(Duration::from_secs(n)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SignerConfig::from_lookup(lookup(&[("FEDSIGN_FEDERATION_ID", "family")])).unwrap();
        assert_eq!(config.federation_id, "family");
        assert_eq!(config.frost_ttl, Duration::from_secs(600));
        assert_eq!(
            config.sss_ttls.for_reason(ReconstructionReason::EmergencyRecovery),
            Duration::from_secs(300)
        );
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert!(config.publisher_url.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_federation_required() {
        let result = SignerConfig::from_lookup(lookup(&[]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_overrides() {
        let config = SignerConfig::from_lookup(lookup(&[
            ("FEDSIGN_FEDERATION_ID", "family"),
            ("FEDSIGN_FROST_TTL_SECS", "120"),
            ("FEDSIGN_SSS_ROUTINE_TTL_SECS", "60"),
            ("FEDSIGN_DATABASE", ":memory:"),
            ("FEDSIGN_LOG_JSON", "1"),
        ]))
        .unwrap();
        assert_eq!(config.frost_ttl, Duration::from_secs(120));
        assert_eq!(config.sss_ttls.routine, Duration::from_secs(60));
        assert_eq!(config.database, ":memory:");
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_ttl() {
        for bad in ["0", "-5", "ten"] {
            let result = SignerConfig::from_lookup(lookup(&[
                ("FEDSIGN_FEDERATION_ID", "family"),
                ("FEDSIGN_FROST_TTL_SECS", bad),
            ]));
            assert!(matches!(result, Err(ConfigError::InvalidValue(_, _))));
        }
    }

    #[test]
    fn test_invalid_log_level() {
        let result = SignerConfig::from_lookup(lookup(&[
            ("FEDSIGN_FEDERATION_ID", "family"),
            ("FEDSIGN_LOG_LEVEL", "loud"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_, _))));
    }
}
