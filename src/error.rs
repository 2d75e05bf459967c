//! Error taxonomy of the signing engine
//!
//! Every engine operation returns `Result<T, SigningError>`. Messages carry
//! guardian and session identifiers but never shares, nonces or keys.

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::types::{ContributionRound, SessionStatus, SigningMethod};

/// Root error type for the signing engine
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid threshold {threshold} for {participants} participants")]
    InvalidThreshold { threshold: u16, participants: usize },

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("invalid message hash: {0}")]
    InvalidMessageHash(String),

    #[error("invalid use case: {0}")]
    InvalidUseCase(String),

    #[error("guardian {guardian_id} is not a participant of session {session_id}")]
    NotAParticipant { session_id: Uuid, guardian_id: String },

    #[error("malformed contribution from guardian {guardian_id}: {reason}")]
    InvalidContribution { guardian_id: String, reason: String },

    #[error("guardian {guardian_id} has no nonce commitment in session {session_id}")]
    MissingNonceCommitment { session_id: Uuid, guardian_id: String },

    #[error("guardian {guardian_id} already submitted a {round} contribution")]
    DuplicateContribution {
        guardian_id: String,
        round: ContributionRound,
    },

    #[error("nonce commitment from guardian {guardian_id} was already used in another session")]
    NonceReuse { guardian_id: String },

    #[error("guardian {guardian_id} is not part of the signing set")]
    NotInSigningSet { guardian_id: String },

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session expired: {0}")]
    SessionExpired(Uuid),

    #[error("session {session_id} is {status}, cannot {operation}")]
    InvalidState {
        session_id: Uuid,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("session {session_id} uses {actual}, not {expected}")]
    MethodMismatch {
        session_id: Uuid,
        expected: SigningMethod,
        actual: SigningMethod,
    },

    #[error("insufficient contributions: have {have}, need {need}")]
    InsufficientContributions { have: usize, need: usize },

    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("interpolation failed: {0}")]
    InterpolationError(String),

    #[error("aggregation failed: {reason}")]
    AggregationError {
        guardian_id: Option<String>,
        reason: String,
    },

    #[error("session {0} has no signature yet")]
    NotCompleted(Uuid),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("guardian registry error: {0}")]
    Registry(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SigningError {
    pub fn aggregation(guardian_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::AggregationError {
            guardian_id: guardian_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient conditions that resolve as more guardians respond or the
    /// collaborator recovers
    pub fn is_retryable(&self) -> bool {
        match self {
            SigningError::InsufficientContributions { .. }
            | SigningError::InsufficientShares { .. }
            | SigningError::Publish(_)
            | SigningError::Registry(_) => true,
            SigningError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Guardian responsible for the failure, when attributable
    pub fn guardian(&self) -> Option<&str> {
        match self {
            SigningError::NotAParticipant { guardian_id, .. }
            | SigningError::InvalidContribution { guardian_id, .. }
            | SigningError::MissingNonceCommitment { guardian_id, .. }
            | SigningError::DuplicateContribution { guardian_id, .. }
            | SigningError::NonceReuse { guardian_id }
            | SigningError::NotInSigningSet { guardian_id } => Some(guardian_id),
            SigningError::AggregationError { guardian_id, .. } => guardian_id.as_deref(),
            _ => None,
        }
    }

    /// Error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            SigningError::InvalidThreshold { .. } => "INVALID_THRESHOLD",
            SigningError::InvalidParticipants(_) => "INVALID_PARTICIPANTS",
            SigningError::InvalidMessageHash(_) => "INVALID_MESSAGE_HASH",
            SigningError::InvalidUseCase(_) => "INVALID_USE_CASE",
            SigningError::NotAParticipant { .. } => "NOT_A_PARTICIPANT",
            SigningError::InvalidContribution { .. } => "INVALID_CONTRIBUTION",
            SigningError::MissingNonceCommitment { .. } => "MISSING_NONCE_COMMITMENT",
            SigningError::DuplicateContribution { .. } => "DUPLICATE_CONTRIBUTION",
            SigningError::NonceReuse { .. } => "NONCE_REUSE",
            SigningError::NotInSigningSet { .. } => "NOT_IN_SIGNING_SET",
            SigningError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SigningError::SessionExpired(_) => "SESSION_EXPIRED",
            SigningError::InvalidState { .. } => "INVALID_STATE",
            SigningError::MethodMismatch { .. } => "METHOD_MISMATCH",
            SigningError::InsufficientContributions { .. } => "INSUFFICIENT_CONTRIBUTIONS",
            SigningError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            SigningError::InterpolationError(_) => "INTERPOLATION_ERROR",
            SigningError::AggregationError { .. } => "AGGREGATION_ERROR",
            SigningError::NotCompleted(_) => "NOT_COMPLETED",
            SigningError::Publish(_) => "PUBLISH_FAILED",
            SigningError::Registry(_) => "REGISTRY_ERROR",
            SigningError::Storage(_) => "STORAGE_ERROR",
            SigningError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias using SigningError
pub type Result<T> = std::result::Result<T, SigningError>;
