//! Session, contribution and request/response types for the signing engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strategy used to produce a session's signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    /// Two-round FROST; the private key is never reconstructed
    Frost,
    /// Shamir guardian reconstruction; the key briefly exists in memory
    Sss,
}

impl std::fmt::Display for SigningMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Frost => "frost",
            Self::Sss => "sss",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SigningMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "frost" => Ok(Self::Frost),
            "sss" => Ok(Self::Sss),
            _ => Err(format!("unknown signing method: {}", s)),
        }
    }
}

/// Status of a signing session
///
/// FROST: pending → nonce_collection → signing → aggregating → completed
/// SSS:   pending → collecting_shares → reconstructing → completed
///
/// `failed` and `expired` are absorbing and reachable from any active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    NonceCollection,
    Signing,
    Aggregating,
    CollectingShares,
    Reconstructing,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Active statuses a session of `method` can pass through
    pub fn active_for(method: SigningMethod) -> &'static [SessionStatus] {
        match method {
            SigningMethod::Frost => &[
                Self::Pending,
                Self::NonceCollection,
                Self::Signing,
                Self::Aggregating,
            ],
            SigningMethod::Sss => &[
                Self::Pending,
                Self::CollectingShares,
                Self::Reconstructing,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NonceCollection => "nonce_collection",
            Self::Signing => "signing",
            Self::Aggregating => "aggregating",
            Self::CollectingShares => "collecting_shares",
            Self::Reconstructing => "reconstructing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "nonce_collection" => Ok(Self::NonceCollection),
            "signing" => Ok(Self::Signing),
            "aggregating" => Ok(Self::Aggregating),
            "collecting_shares" => Ok(Self::CollectingShares),
            "reconstructing" => Ok(Self::Reconstructing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Round a guardian contribution belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionRound {
    /// FROST round 1
    Nonce,
    /// FROST round 2
    Signature,
    /// SSS share submission (marker only, the share value is never stored)
    Share,
}

impl std::fmt::Display for ContributionRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Nonce => "nonce",
            Self::Signature => "signature",
            Self::Share => "share",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ContributionRound {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nonce" => Ok(Self::Nonce),
            "signature" => Ok(Self::Signature),
            "share" => Ok(Self::Share),
            _ => Err(format!("unknown round: {}", s)),
        }
    }
}

/// Why an SSS reconstruction was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionReason {
    EmergencyRecovery,
    KeyRotation,
    Routine,
}

impl std::fmt::Display for ReconstructionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EmergencyRecovery => "emergency_recovery",
            Self::KeyRotation => "key_rotation",
            Self::Routine => "routine",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ReconstructionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emergency_recovery" => Ok(Self::EmergencyRecovery),
            "key_rotation" => Ok(Self::KeyRotation),
            "routine" => Ok(Self::Routine),
            _ => Err(format!("unknown reconstruction reason: {}", s)),
        }
    }
}

/// Caller-facing use case driving method selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    DailyOperations,
    HighValueTransaction,
    FedimintIntegration,
    EmergencyRecovery,
    KeyRotation,
    PerformanceCritical,
    OfflineGuardians,
}

impl UseCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyOperations => "daily_operations",
            Self::HighValueTransaction => "high_value_transaction",
            Self::FedimintIntegration => "fedimint_integration",
            Self::EmergencyRecovery => "emergency_recovery",
            Self::KeyRotation => "key_rotation",
            Self::PerformanceCritical => "performance_critical",
            Self::OfflineGuardians => "offline_guardians",
        }
    }
}

impl std::fmt::Display for UseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UseCase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_operations" => Ok(Self::DailyOperations),
            "high_value_transaction" => Ok(Self::HighValueTransaction),
            "fedimint_integration" => Ok(Self::FedimintIntegration),
            "emergency_recovery" => Ok(Self::EmergencyRecovery),
            "key_rotation" => Ok(Self::KeyRotation),
            "performance_critical" => Ok(Self::PerformanceCritical),
            "offline_guardians" => Ok(Self::OfflineGuardians),
            _ => Err(format!("unknown use case: {}", s)),
        }
    }
}

/// Final `(R, s)` signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    /// Aggregate nonce point (hex-encoded compressed point, 66 chars)
    pub r: String,
    /// Aggregate scalar (hex-encoded, 64 chars)
    pub s: String,
}

/// One attempt to produce one signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningSession {
    /// Unique session identifier
    pub id: Uuid,
    /// Strategy producing the signature
    pub method: SigningMethod,
    /// Current status
    pub status: SessionStatus,
    /// Guardians required to cooperate
    pub threshold: u16,
    /// Number of invited guardians
    pub total_participants: u16,
    /// Digest being signed (hex-encoded 32 bytes)
    pub message_hash: String,
    /// Invited guardian identifiers, in invitation order
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once aggregation or reconstruction succeeded
    pub result_signature: Option<SchnorrSignature>,
    /// Reference returned by the event publisher
    pub published_event_id: Option<String>,
    /// Why the session failed (never contains secret material)
    pub failure_reason: Option<String>,
    /// Event to publish alongside the signature
    pub event_payload: Option<serde_json::Value>,
    /// Reconstruction reason (SSS only)
    pub reason: Option<ReconstructionReason>,
}

impl SigningSession {
    /// Create a pending session
    pub fn new(
        method: SigningMethod,
        threshold: u16,
        participants: Vec<String>,
        message_hash: String,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            status: SessionStatus::Pending,
            threshold,
            total_participants: participants.len() as u16,
            message_hash,
            participants,
            created_at,
            expires_at: created_at + ttl,
            result_signature: None,
            published_event_id: None,
            failure_reason: None,
            event_payload: None,
            reason: None,
        }
    }

    pub fn is_participant(&self, guardian_id: &str) -> bool {
        self.participants.iter().any(|p| p == guardian_id)
    }

    /// Past its deadline while still active
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.expires_at
    }
}

/// Per-guardian, per-round contribution to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianContribution {
    pub session_id: Uuid,
    pub guardian_id: String,
    pub round: ContributionRound,
    /// Compressed nonce point (hex), round 1
    pub nonce_commitment: Option<String>,
    /// Partial signature scalar (hex), round 2
    pub partial_signature: Option<String>,
    /// Share index of an SSS submission
    pub share_index: Option<u16>,
    pub submitted_at: DateTime<Utc>,
}

impl GuardianContribution {
    pub fn nonce(
        session_id: Uuid,
        guardian_id: impl Into<String>,
        commitment: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            guardian_id: guardian_id.into(),
            round: ContributionRound::Nonce,
            nonce_commitment: Some(commitment.into()),
            partial_signature: None,
            share_index: None,
            submitted_at,
        }
    }

    pub fn signature(
        session_id: Uuid,
        guardian_id: impl Into<String>,
        partial_signature: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            guardian_id: guardian_id.into(),
            round: ContributionRound::Signature,
            nonce_commitment: None,
            partial_signature: Some(partial_signature.into()),
            share_index: None,
            submitted_at,
        }
    }

    pub fn share(
        session_id: Uuid,
        guardian_id: impl Into<String>,
        share_index: u16,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            guardian_id: guardian_id.into(),
            round: ContributionRound::Share,
            nonce_commitment: None,
            partial_signature: None,
            share_index: Some(share_index),
            submitted_at,
        }
    }
}

/// A guardian taking part in round 2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningParticipant {
    pub guardian_id: String,
    /// Share index (x-coordinate of the guardian's key share)
    pub share_index: u16,
    /// Round 1 nonce commitment (hex-encoded compressed point)
    pub commitment: String,
}

/// Everything a guardian needs to compute its partial signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPackage {
    pub session_id: Uuid,
    /// Digest being signed (hex-encoded 32 bytes)
    pub message_hash: String,
    /// Frozen signing set, ordered by share index
    pub signers: Vec<SigningParticipant>,
    /// Sum of all commitments (hex-encoded compressed point)
    pub aggregate_nonce: String,
    /// BIP-340 challenge scalar (hex)
    pub challenge: String,
}

/// Outcome of independent signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
}

/// Advisory output of `recommend_method`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodRecommendation {
    pub method: SigningMethod,
    pub reason: String,
    pub expected_latency: String,
    pub security_notes: Vec<String>,
}

/// Input to `request_signature`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// Use case driving method selection (FROST when absent)
    #[serde(default)]
    pub use_case: Option<UseCase>,
    /// Explicit method, overrides the use case table
    #[serde(default)]
    pub method: Option<SigningMethod>,
    /// Digest to sign (hex-encoded 32 bytes)
    pub message_hash: String,
    /// Threshold; defaults to the federation threshold
    #[serde(default)]
    pub threshold: Option<u16>,
    /// Invited guardians; defaults to every registered guardian
    #[serde(default)]
    pub participants: Option<Vec<String>>,
    /// Event published together with the signature
    #[serde(default)]
    pub event: Option<serde_json::Value>,
    /// SSS reconstruction reason; derived from the use case when absent
    #[serde(default)]
    pub reason: Option<ReconstructionReason>,
}

/// Round 1 submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceCommitmentRequest {
    pub guardian_id: String,
    /// Compressed nonce point (hex-encoded 33 bytes)
    pub commitment: String,
}

/// Round 2 submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignatureRequest {
    pub guardian_id: String,
    /// Partial signature scalar (hex-encoded 32 bytes)
    pub partial_signature: String,
}

/// SSS share submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSubmissionRequest {
    pub guardian_id: String,
    pub share_index: u16,
    /// Decrypted share value (hex-encoded 32 bytes)
    pub share_value: String,
}

/// Accepted contribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionResponse {
    pub session_id: Uuid,
    pub guardian_id: String,
    /// Session status after the contribution
    pub status: SessionStatus,
}

/// Finalized session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub session_id: Uuid,
    pub method: SigningMethod,
    pub signature: SchnorrSignature,
}

/// Publisher confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub session_id: Uuid,
    pub published_event_id: String,
}

/// Expiry sweep result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireResponse {
    pub expired: u64,
}

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Responsible guardian, when attributable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            guardian_id: None,
        }
    }

    pub fn with_guardian(mut self, guardian_id: impl Into<String>) -> Self {
        self.guardian_id = Some(guardian_id.into());
        self
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub federation_id: String,
    pub guardians: usize,
    pub threshold: u16,
}
