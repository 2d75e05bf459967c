//! Storage Trait Definitions
//!
//! The session store is the only shared mutable resource of the engine.
//! Guardians are independent processes, so mutual exclusion comes from
//! uniqueness constraints on contributions and compare-and-set on session
//! status, never from in-process locks held across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    ContributionRound, GuardianContribution, SchnorrSignature, SessionStatus, SigningSession,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Nonce commitment already recorded: {0}")]
    NonceReuse(String),

    #[error("Session is {0}")]
    StateConflict(SessionStatus),

    #[error("Session expired")]
    Expired,

    #[error("Missing prerequisite contribution: {0}")]
    MissingPrerequisite(ContributionRound),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Compare-and-set status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// A contribution insert together with the checks and transition that must
/// happen atomically with it
#[derive(Debug, Clone, Copy)]
pub struct ContributionInsert<'a> {
    pub contribution: &'a GuardianContribution,
    /// Session must currently be in one of these statuses
    pub accepted: &'a [SessionStatus],
    /// Round the same guardian must already have recorded
    pub requires: Option<ContributionRound>,
    /// Applied only if the session is still in `from` after the insert
    pub advance: Option<StateTransition>,
    /// Sessions with `expires_at <= now` reject the insert
    pub now: DateTime<Utc>,
}

/// Session store interface
///
/// Implementations:
/// - `SqliteSessionStore` - Production storage with SQLite
/// - `MemorySessionStore` - In-memory storage for tests (never evicts)
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session
    async fn insert_session(&self, session: &SigningSession) -> StorageResult<()>;

    /// Get a session by ID
    async fn get_session(&self, id: Uuid) -> StorageResult<Option<SigningSession>>;

    /// Move the session to `to` if its status is one of `from`.
    /// Returns whether this call performed the transition.
    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StorageResult<bool>;

    /// Set `completed` and the signature if the status is one of `from`
    async fn complete_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        signature: &SchnorrSignature,
    ) -> StorageResult<bool>;

    /// Set `failed` with a reason if the status is one of `from`
    async fn fail_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        reason: &str,
    ) -> StorageResult<bool>;

    /// Record the publisher's event id on a completed session
    async fn set_published_event_id(&self, id: Uuid, event_id: &str) -> StorageResult<()>;

    /// Insert a contribution atomically with its checks and status advance.
    /// Returns the session status after the write.
    async fn insert_contribution(&self, insert: ContributionInsert<'_>)
        -> StorageResult<SessionStatus>;

    /// All contributions of a session, in submission order
    async fn get_contributions(&self, session_id: Uuid) -> StorageResult<Vec<GuardianContribution>>;

    /// Move every non-terminal session with `expires_at <= now` to `expired`
    async fn expire_sessions(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    /// Sessions that are not yet terminal
    async fn get_active(&self) -> StorageResult<Vec<SigningSession>>;
}
