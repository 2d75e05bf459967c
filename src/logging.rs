//! Structured Logging for the Federation Signer
//!
//! Provides structured logging with:
//! - JSON output for log aggregation services
//! - Session lifecycle events keyed by session id
//! - Security event logging
//!
//! Secret material (shares, nonces, reconstructed keys) is never passed to
//! any of these helpers.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

use crate::error::SigningError;
use crate::types::{ContributionRound, SessionStatus, SigningMethod};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Session lifecycle (creation, transitions, completion)
    Session,
    /// Guardian contributions
    Contribution,
    /// Security events (rejected submissions, key reconstruction)
    Security,
    /// Publisher delivery
    Publish,
    /// System events (startup, shutdown, sweeps)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Session the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error code, for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            session_id: None,
            data: None,
            error_code: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({"error": "failed to serialize log", "message": self.message})
                .to_string()
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log a session state change
pub fn log_session_event(
    session_id: Uuid,
    method: SigningMethod,
    status: SessionStatus,
    message: &str,
) {
    let level = match status {
        SessionStatus::Failed => LogLevel::Warn,
        _ => LogLevel::Info,
    };
    let event = LogEvent::new(level, EventCategory::Session, message)
        .with_session(session_id)
        .with_data(serde_json::json!({
            "method": method,
            "state": status,
        }));

    match level {
        LogLevel::Warn => tracing::warn!(target: "fedsign::session", "{}", event.to_json()),
        _ => tracing::info!(target: "fedsign::session", "{}", event.to_json()),
    }
}

/// Log a security-related event
pub fn log_security_event(
    event_type: &str,
    success: bool,
    session_id: Option<Uuid>,
    details: serde_json::Value,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );
    if let Some(id) = session_id {
        event = event.with_session(id);
    }

    if success {
        tracing::info!(target: "fedsign::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "fedsign::security", "{}", event.to_json());
    }
}

/// Log an accepted guardian contribution
pub fn log_contribution_event(
    session_id: Uuid,
    guardian_id: &str,
    round: ContributionRound,
    status: SessionStatus,
) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Contribution, "Contribution accepted")
        .with_session(session_id)
        .with_data(serde_json::json!({
            "guardian_id": guardian_id,
            "round": round,
            "state": status,
        }));
    tracing::info!(target: "fedsign::contribution", "{}", event.to_json());
}

/// Log the outcome of handing a signed event to the publisher
pub fn log_publish_event(session_id: Uuid, outcome: Result<&str, &SigningError>) {
    match outcome {
        Ok(event_id) => {
            let event = LogEvent::new(LogLevel::Info, EventCategory::Publish, "Published signed event")
                .with_session(session_id)
                .with_data(serde_json::json!({"event_id": event_id}));
            tracing::info!(target: "fedsign::publish", "{}", event.to_json());
        }
        Err(err) => {
            let event = LogEvent::new(LogLevel::Warn, EventCategory::Publish, err.to_string())
                .with_session(session_id)
                .with_error_code(err.error_code());
            tracing::warn!(target: "fedsign::publish", "{}", event.to_json());
        }
    }
}

/// Log a process-level event (startup, shutdown, sweeps)
pub fn log_system_event(message: &str, data: serde_json::Value) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::System, message).with_data(data);
    tracing::info!(target: "fedsign::system", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_filter();
        EnvFilter::new(format!(
            "federation_signer={level},fedsign={level},tower_http={level},axum={level}"
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from SignerConfig
pub fn init_from_config(config: &crate::config::SignerConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}
