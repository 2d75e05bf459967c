//! FROST session manager
//!
//! Drives one threshold-signing attempt through
//! `pending → nonce_collection → signing → aggregating → completed`.
//! The private key is never reconstructed: guardians commit to a nonce,
//! sign with their key share against the aggregate nonce, and the partial
//! signatures sum into a BIP-340 signature under the federation key.
//!
//! The signing set is frozen when the session leaves `nonce_collection`
//! (explicitly through [`FrostSessionManager::request_signatures`] or by the
//! first partial signature). From then on no commitment is accepted, so every
//! member's Lagrange coefficient is fixed.

use k256::AffinePoint;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::{self, ChallengeContext};
use crate::error::{Result, SigningError};
use crate::lifecycle;
use crate::logging;
use crate::registry::{Federation, GuardianRegistry};
use crate::storage::{ContributionInsert, SessionStore, StateTransition};
use crate::types::{
    ContributionRound, GuardianContribution, SchnorrSignature, SessionStatus, SigningMethod,
    SigningPackage, SigningParticipant, SigningSession, VerificationResult,
};

const NONCE_STATES: &[SessionStatus] = &[SessionStatus::Pending, SessionStatus::NonceCollection];
const SIGNATURE_STATES: &[SessionStatus] = &[SessionStatus::NonceCollection, SessionStatus::Signing];

/// A frozen signing set with its shared challenge
struct SigningSet {
    members: Vec<SetMember>,
    context: ChallengeContext,
}

struct SetMember {
    guardian_id: String,
    share_index: u16,
    commitment: AffinePoint,
    commitment_hex: String,
    public_share: AffinePoint,
    lambda: k256::Scalar,
}

impl SigningSet {
    fn package(&self, session: &SigningSession) -> Result<SigningPackage> {
        let aggregate_nonce = crypto::point_to_hex(&self.context.aggregate_nonce.into())
            .map_err(|e| SigningError::aggregation(None, e.to_string()))?;
        Ok(SigningPackage {
            session_id: session.id,
            message_hash: session.message_hash.clone(),
            signers: self
                .members
                .iter()
                .map(|m| SigningParticipant {
                    guardian_id: m.guardian_id.clone(),
                    share_index: m.share_index,
                    commitment: m.commitment_hex.clone(),
                })
                .collect(),
            aggregate_nonce,
            challenge: crypto::scalar_to_hex(&self.context.challenge),
        })
    }
}

/// FROST session manager
pub struct FrostSessionManager {
    store: Arc<dyn SessionStore>,
    registry: Arc<dyn GuardianRegistry>,
    clock: Arc<dyn Clock>,
    federation_id: String,
    ttl: Duration,
}

impl FrostSessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<dyn GuardianRegistry>,
        clock: Arc<dyn Clock>,
        federation_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            federation_id: federation_id.into(),
            ttl,
        }
    }

    pub fn federation_id(&self) -> &str {
        &self.federation_id
    }

    async fn federation(&self) -> Result<Federation> {
        Federation::load(self.registry.as_ref(), &self.federation_id)
            .await
            .map_err(|e| SigningError::Registry(e.to_string()))
    }

    /// Create a pending session for `threshold` of `participants`
    pub async fn create_session(
        &self,
        threshold: u16,
        participants: Vec<String>,
        message_hash: &str,
    ) -> Result<SigningSession> {
        self.create_session_with_event(threshold, participants, message_hash, None)
            .await
    }

    /// Create a session carrying the event to publish once signed
    pub async fn create_session_with_event(
        &self,
        threshold: u16,
        participants: Vec<String>,
        message_hash: &str,
        event: Option<serde_json::Value>,
    ) -> Result<SigningSession> {
        let federation = self.federation().await?;
        let message_hash = validate_request(&federation, threshold, &participants, message_hash)?;

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| SigningError::internal(format!("session TTL out of range: {}", e)))?;
        let mut session = SigningSession::new(
            SigningMethod::Frost,
            threshold,
            participants,
            message_hash,
            self.clock.now(),
            ttl,
        );
        session.event_payload = event;
        self.store.insert_session(&session).await?;

        tracing::info!(
            session_id = %session.id,
            threshold,
            participants = session.total_participants,
            "Created FROST session"
        );
        logging::log_session_event(session.id, session.method, session.status, "Session created");
        Ok(session)
    }

    /// Current session, with lazy expiry applied
    pub async fn get_session(&self, session_id: Uuid) -> Result<SigningSession> {
        lifecycle::load_session(self.store.as_ref(), self.clock.as_ref(), session_id).await
    }

    /// Round 1: record a guardian's nonce commitment (compressed point hex)
    pub async fn submit_nonce_commitment(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        commitment: &str,
    ) -> Result<SessionStatus> {
        let session = self.load_active(session_id).await?;
        ensure_participant(&session, guardian_id)?;

        let point = crypto::parse_point(commitment).map_err(|e| SigningError::InvalidContribution {
            guardian_id: guardian_id.to_string(),
            reason: format!("nonce commitment: {}", e),
        })?;
        // Canonical encoding so that reuse detection cannot be bypassed by hex case
        let canonical = crypto::point_to_hex(&point.into()).map_err(|e| {
            SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: format!("nonce commitment: {}", e),
            }
        })?;

        let now = self.clock.now();
        let contribution = GuardianContribution::nonce(session_id, guardian_id, canonical, now);
        let status = self
            .store
            .insert_contribution(ContributionInsert {
                contribution: &contribution,
                accepted: NONCE_STATES,
                requires: None,
                advance: Some(StateTransition {
                    from: SessionStatus::Pending,
                    to: SessionStatus::NonceCollection,
                }),
                now,
            })
            .await;
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Err(lifecycle::contribution_error(
                    self.store.as_ref(),
                    &session,
                    guardian_id,
                    ContributionRound::Nonce,
                    "accept nonce commitments",
                    e,
                )
                .await)
            }
        };

        logging::log_contribution_event(session_id, guardian_id, ContributionRound::Nonce, status);
        if session.status != status {
            logging::log_session_event(session_id, session.method, status, "Nonce collection started");
        }
        Ok(status)
    }

    /// Freeze the signing set and return the package guardians sign against.
    ///
    /// Requires commitments from at least `threshold` guardians. Repeated
    /// calls return the same package.
    pub async fn request_signatures(&self, session_id: Uuid) -> Result<SigningPackage> {
        let mut session = self.load_active(session_id).await?;

        if NONCE_STATES.contains(&session.status) {
            let commitments = self.commitments(session_id).await?;
            if commitments.len() < session.threshold as usize {
                return Err(SigningError::InsufficientContributions {
                    have: commitments.len(),
                    need: session.threshold as usize,
                });
            }
            if self
                .store
                .transition(session_id, &[SessionStatus::NonceCollection], SessionStatus::Signing)
                .await?
            {
                logging::log_session_event(
                    session_id,
                    session.method,
                    SessionStatus::Signing,
                    "Signing set frozen",
                );
            }
            session = self.load_active(session_id).await?;
        }

        match session.status {
            SessionStatus::Signing | SessionStatus::Aggregating | SessionStatus::Completed => {}
            status => {
                return Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "request signatures",
                })
            }
        }

        let federation = self.federation().await?;
        let contributions = self.store.get_contributions(session_id).await?;
        let set = match self.signing_set(&session, &federation, &contributions) {
            Ok(set) => set,
            Err(e) => return Err(self.fail(&session, &[SessionStatus::Signing], e).await),
        };
        set.package(&session)
    }

    /// Round 2: record a guardian's partial signature (scalar hex)
    ///
    /// Validity against the guardian's key share is checked at aggregation.
    pub async fn submit_partial_signature(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        partial_signature: &str,
    ) -> Result<SessionStatus> {
        let session = self.load_active(session_id).await?;
        ensure_participant(&session, guardian_id)?;

        let bytes = hex::decode(partial_signature.trim()).map_err(|e| {
            SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: format!("partial signature: {}", e),
            }
        })?;
        if bytes.len() != 32 {
            return Err(SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: format!("partial signature must be 32 bytes, got {}", bytes.len()),
            });
        }

        // A partial arriving before the explicit advance freezes the set itself
        if session.status == SessionStatus::NonceCollection {
            let commitments = self.commitments(session_id).await?;
            if commitments.len() < session.threshold as usize {
                return Err(SigningError::InsufficientContributions {
                    have: commitments.len(),
                    need: session.threshold as usize,
                });
            }
        }

        let now = self.clock.now();
        let contribution =
            GuardianContribution::signature(session_id, guardian_id, hex::encode(bytes), now);
        let status = self
            .store
            .insert_contribution(ContributionInsert {
                contribution: &contribution,
                accepted: SIGNATURE_STATES,
                requires: Some(ContributionRound::Nonce),
                advance: Some(StateTransition {
                    from: SessionStatus::NonceCollection,
                    to: SessionStatus::Signing,
                }),
                now,
            })
            .await;
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Err(lifecycle::contribution_error(
                    self.store.as_ref(),
                    &session,
                    guardian_id,
                    ContributionRound::Signature,
                    "accept partial signatures",
                    e,
                )
                .await)
            }
        };

        logging::log_contribution_event(session_id, guardian_id, ContributionRound::Signature, status);
        Ok(status)
    }

    /// Combine the partial signatures into `(R, s)`.
    ///
    /// Idempotent: a completed session returns its stored signature. Any
    /// invalid partial fails the session and names the guardian.
    pub async fn aggregate_signatures(&self, session_id: Uuid) -> Result<SchnorrSignature> {
        let session = self.load_active(session_id).await?;

        match session.status {
            SessionStatus::Completed => return stored_signature(&session),
            SessionStatus::Signing => {}
            SessionStatus::Pending | SessionStatus::NonceCollection => {
                // No partial exists before the signing set is frozen
                let have = self.commitments(session_id).await?.len();
                return Err(SigningError::InsufficientContributions {
                    have,
                    need: session.threshold as usize,
                });
            }
            status => {
                return Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "aggregate",
                })
            }
        }

        let contributions = self.store.get_contributions(session_id).await?;
        let committed = count_round(&contributions, ContributionRound::Nonce);
        let signed = count_round(&contributions, ContributionRound::Signature);
        let need = committed.max(session.threshold as usize);
        if signed < need {
            return Err(SigningError::InsufficientContributions { have: signed, need });
        }

        let federation = self.federation().await?;

        if !self
            .store
            .transition(session_id, &[SessionStatus::Signing], SessionStatus::Aggregating)
            .await?
        {
            // Another caller got there first
            let current = self.get_session(session_id).await?;
            return match current.status {
                SessionStatus::Completed => stored_signature(&current),
                SessionStatus::Expired => Err(SigningError::SessionExpired(session_id)),
                status => Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "aggregate",
                }),
            };
        }
        logging::log_session_event(session_id, session.method, SessionStatus::Aggregating, "Aggregating");

        let signature = match self.combine(&session, &federation, &contributions) {
            Ok(signature) => signature,
            Err(e) => return Err(self.fail(&session, &[SessionStatus::Aggregating], e).await),
        };

        let completed = match self
            .store
            .complete_session(session_id, &[SessionStatus::Aggregating], &signature)
            .await
        {
            Ok(completed) => completed,
            Err(e) => return Err(self.release_aggregation(&session, e.into()).await),
        };
        if !completed {
            let current = self.get_session(session_id).await?;
            return match current.status {
                SessionStatus::Completed => stored_signature(&current),
                SessionStatus::Expired => Err(SigningError::SessionExpired(session_id)),
                status => Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "complete",
                }),
            };
        }

        tracing::info!(session_id = %session_id, signers = signed, "Aggregated FROST signature");
        logging::log_session_event(session_id, session.method, SessionStatus::Completed, "Signature aggregated");
        Ok(signature)
    }

    /// Re-verify the stored signature against the federation key and `message_hash`
    pub async fn verify_aggregated_signature(
        &self,
        session_id: Uuid,
        message_hash: &str,
    ) -> Result<VerificationResult> {
        let session = self.get_session(session_id).await?;
        let signature = session
            .result_signature
            .as_ref()
            .ok_or(SigningError::NotCompleted(session_id))?;
        let message = crypto::parse_message_hash(message_hash)
            .map_err(|e| SigningError::InvalidMessageHash(e.to_string()))?;
        let federation = self.federation().await?;

        let valid = match crypto::verify_signature(&federation.group_key, &message, signature) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Stored signature is malformed");
                false
            }
        };
        tracing::debug!(session_id = %session_id, valid, "Verified aggregated signature");
        Ok(VerificationResult { valid })
    }

    /// Move every overdue active session to `expired`
    pub async fn expire_old_sessions(&self) -> Result<u64> {
        let count = self.store.expire_sessions(self.clock.now()).await?;
        if count > 0 {
            tracing::info!(count, "Expired overdue sessions");
        }
        Ok(count)
    }

    async fn load_active(&self, session_id: Uuid) -> Result<SigningSession> {
        lifecycle::load_active(
            self.store.as_ref(),
            self.clock.as_ref(),
            session_id,
            SigningMethod::Frost,
        )
        .await
    }

    async fn commitments(&self, session_id: Uuid) -> Result<Vec<GuardianContribution>> {
        Ok(self
            .store
            .get_contributions(session_id)
            .await?
            .into_iter()
            .filter(|c| c.round == ContributionRound::Nonce)
            .collect())
    }

    /// Record the failure and hand the error back
    async fn fail(
        &self,
        session: &SigningSession,
        from: &[SessionStatus],
        err: SigningError,
    ) -> SigningError {
        let reason = match err.guardian() {
            Some(guardian_id) => format!("{} (guardian {})", err, guardian_id),
            None => err.to_string(),
        };
        match self.store.fail_session(session.id, from, &reason).await {
            Ok(true) => {
                logging::log_session_event(session.id, session.method, SessionStatus::Failed, &reason);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Failed to record session failure");
            }
        }
        err
    }

    /// Hand an aggregating session back to `signing` after a store error so
    /// aggregation can run again from the stored partials
    async fn release_aggregation(&self, session: &SigningSession, err: SigningError) -> SigningError {
        match self
            .store
            .transition(session.id, &[SessionStatus::Aggregating], SessionStatus::Signing)
            .await
        {
            Ok(_) => {
                tracing::warn!(session_id = %session.id, error = %err, "Aggregation not recorded, session back to signing");
                err
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Failed to release aggregating session");
                self.fail(session, &[SessionStatus::Aggregating], err).await
            }
        }
    }

    fn signing_set(
        &self,
        session: &SigningSession,
        federation: &Federation,
        contributions: &[GuardianContribution],
    ) -> Result<SigningSet> {
        let message = crypto::parse_message_hash(&session.message_hash)
            .map_err(|e| SigningError::InvalidMessageHash(e.to_string()))?;

        let mut members = Vec::new();
        for contribution in contributions
            .iter()
            .filter(|c| c.round == ContributionRound::Nonce)
        {
            let guardian_id = contribution.guardian_id.as_str();
            let key = federation.guardian(guardian_id).ok_or_else(|| {
                SigningError::aggregation(Some(guardian_id), "guardian is no longer registered")
            })?;
            let commitment_hex = contribution.nonce_commitment.clone().ok_or_else(|| {
                SigningError::aggregation(Some(guardian_id), "nonce commitment missing")
            })?;
            let commitment = crypto::parse_point(&commitment_hex).map_err(|e| {
                SigningError::aggregation(Some(guardian_id), format!("nonce commitment: {}", e))
            })?;
            members.push(SetMember {
                guardian_id: guardian_id.to_string(),
                share_index: key.share_index,
                commitment,
                commitment_hex,
                public_share: key.public_share,
                lambda: k256::Scalar::ONE,
            });
        }
        members.sort_by_key(|m| m.share_index);

        let indices: Vec<u16> = members.iter().map(|m| m.share_index).collect();
        for member in &mut members {
            member.lambda = crypto::lagrange_coefficient(member.share_index, &indices).map_err(|e| {
                SigningError::aggregation(Some(&member.guardian_id), e.to_string())
            })?;
        }

        let commitments: Vec<AffinePoint> = members.iter().map(|m| m.commitment).collect();
        let aggregate_nonce = crypto::aggregate_points(&commitments)
            .map_err(|e| SigningError::aggregation(None, format!("aggregate nonce: {}", e)))?
            .to_affine();

        Ok(SigningSet {
            members,
            context: ChallengeContext::new(aggregate_nonce, federation.group_key, &message),
        })
    }

    fn combine(
        &self,
        session: &SigningSession,
        federation: &Federation,
        contributions: &[GuardianContribution],
    ) -> Result<SchnorrSignature> {
        let set = self.signing_set(session, federation, contributions)?;

        let partials: HashMap<&str, &str> = contributions
            .iter()
            .filter(|c| c.round == ContributionRound::Signature)
            .filter_map(|c| {
                c.partial_signature
                    .as_deref()
                    .map(|p| (c.guardian_id.as_str(), p))
            })
            .collect();

        let mut scalars = Vec::with_capacity(set.members.len());
        for member in &set.members {
            let guardian_id = member.guardian_id.as_str();
            let partial_hex = partials.get(guardian_id).ok_or_else(|| {
                SigningError::aggregation(Some(guardian_id), "partial signature missing")
            })?;
            let partial = crypto::parse_scalar(partial_hex).map_err(|e| {
                SigningError::aggregation(Some(guardian_id), format!("partial signature: {}", e))
            })?;
            if !set
                .context
                .verify_partial(&partial, &member.commitment, &member.lambda, &member.public_share)
            {
                return Err(SigningError::aggregation(
                    Some(guardian_id),
                    "partial signature does not verify against the guardian key share",
                ));
            }
            scalars.push(partial);
        }

        let s = crypto::aggregate_scalars(&scalars);
        let signature = SchnorrSignature {
            r: crypto::point_to_hex(&set.context.aggregate_nonce.into())
                .map_err(|e| SigningError::aggregation(None, e.to_string()))?,
            s: crypto::scalar_to_hex(&s),
        };

        let message = crypto::parse_message_hash(&session.message_hash)
            .map_err(|e| SigningError::InvalidMessageHash(e.to_string()))?;
        match crypto::verify_signature(&federation.group_key, &message, &signature) {
            Ok(true) => Ok(signature),
            Ok(false) => Err(SigningError::aggregation(
                None,
                "aggregate signature does not verify under the federation key",
            )),
            Err(e) => Err(SigningError::aggregation(None, e.to_string())),
        }
    }
}

/// Shared setup validation of both strategies; returns the normalized digest
pub(crate) fn validate_request(
    federation: &Federation,
    threshold: u16,
    participants: &[String],
    message_hash: &str,
) -> Result<String> {
    let digest = crypto::parse_message_hash(message_hash.trim())
        .map_err(|e| SigningError::InvalidMessageHash(e.to_string()))?;

    if threshold < 2 || threshold as usize > participants.len() {
        return Err(SigningError::InvalidThreshold {
            threshold,
            participants: participants.len(),
        });
    }
    if threshold < federation.threshold {
        return Err(SigningError::InvalidThreshold {
            threshold,
            participants: participants.len(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for guardian_id in participants {
        if !seen.insert(guardian_id.as_str()) {
            return Err(SigningError::InvalidParticipants(format!(
                "duplicate guardian {}",
                guardian_id
            )));
        }
        if federation.guardian(guardian_id).is_none() {
            return Err(SigningError::InvalidParticipants(format!(
                "{} is not a guardian of federation {}",
                guardian_id, federation.federation_id
            )));
        }
    }

    Ok(hex::encode(digest))
}

pub(crate) fn ensure_participant(session: &SigningSession, guardian_id: &str) -> Result<()> {
    if !session.is_participant(guardian_id) {
        logging::log_security_event(
            "non_participant_submission",
            false,
            Some(session.id),
            serde_json::json!({"guardian_id": guardian_id}),
        );
        return Err(SigningError::NotAParticipant {
            session_id: session.id,
            guardian_id: guardian_id.to_string(),
        });
    }
    Ok(())
}

fn stored_signature(session: &SigningSession) -> Result<SchnorrSignature> {
    session
        .result_signature
        .clone()
        .ok_or_else(|| SigningError::internal(format!("completed session {} has no signature", session.id)))
}

fn count_round(contributions: &[GuardianContribution], round: ContributionRound) -> usize {
    contributions.iter().filter(|c| c.round == round).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::guardian::GuardianSigner;
    use crate::dealer::TestFederation;
    use crate::storage::{MemorySessionStore, StorageError, StorageResult};

    struct Harness {
        federation: TestFederation,
        clock: ManualClock,
        manager: FrostSessionManager,
    }

    fn harness(threshold: u16, total: u16) -> Harness {
        let federation = TestFederation::generate("family", threshold, total).unwrap();
        let clock = ManualClock::default();
        let manager = FrostSessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(federation.registry()),
            Arc::new(clock.clone()),
            "family",
            Duration::from_secs(600),
        );
        Harness {
            federation,
            clock,
            manager,
        }
    }

    async fn commit_all(h: &Harness, session_id: Uuid, signers: &[&GuardianSigner]) {
        for signer in signers {
            let commitment = signer.commit(session_id).unwrap();
            h.manager
                .submit_nonce_commitment(session_id, signer.guardian_id(), &commitment)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_session_validation() {
        let h = harness(2, 3);
        let hash = "11".repeat(32);

        let result = h.manager.create_session(1, h.federation.guardian_ids(), &hash).await;
        assert!(matches!(result, Err(SigningError::InvalidThreshold { .. })));

        let result = h.manager.create_session(4, h.federation.guardian_ids(), &hash).await;
        assert!(matches!(result, Err(SigningError::InvalidThreshold { .. })));

        let result = h
            .manager
            .create_session(2, vec!["g1".into(), "g1".into(), "g2".into()], &hash)
            .await;
        assert!(matches!(result, Err(SigningError::InvalidParticipants(_))));

        let result = h
            .manager
            .create_session(2, vec!["g1".into(), "mallory".into()], &hash)
            .await;
        assert!(matches!(result, Err(SigningError::InvalidParticipants(_))));

        let result = h.manager.create_session(2, h.federation.guardian_ids(), "abcd").await;
        assert!(matches!(result, Err(SigningError::InvalidMessageHash(_))));

        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &hash)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.expires_at - session.created_at, chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        let h = harness(2, 3);
        let hash = "22".repeat(32);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &hash)
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let g3 = h.federation.signer("g3").unwrap();

        commit_all(&h, session.id, &[&g1, &g3]).await;
        let package = h.manager.request_signatures(session.id).await.unwrap();
        assert_eq!(package.signers.len(), 2);
        assert_eq!(h.manager.request_signatures(session.id).await.unwrap(), package);

        for signer in [&g1, &g3] {
            let partial = signer.sign(session.id, &package).unwrap();
            h.manager
                .submit_partial_signature(session.id, signer.guardian_id(), &partial)
                .await
                .unwrap();
        }

        let signature = h.manager.aggregate_signatures(session.id).await.unwrap();
        assert_eq!(signature.r.len(), 66);
        assert_eq!(signature.s.len(), 64);
        let verified = h
            .manager
            .verify_aggregated_signature(session.id, &hash)
            .await
            .unwrap();
        assert!(verified.valid);

        let other = h
            .manager
            .verify_aggregated_signature(session.id, &"33".repeat(32))
            .await
            .unwrap();
        assert!(!other.valid);
    }

    #[tokio::test]
    async fn test_request_signatures_below_threshold() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"44".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        commit_all(&h, session.id, &[&g1]).await;

        let result = h.manager.request_signatures(session.id).await;
        assert!(matches!(
            result,
            Err(SigningError::InsufficientContributions { have: 1, need: 2 })
        ));

        let result = h.manager.aggregate_signatures(session.id).await;
        assert!(matches!(
            result,
            Err(SigningError::InsufficientContributions { have: 1, need: 2 })
        ));
    }

    #[tokio::test]
    async fn test_nonce_commitment_must_be_compressed() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"45".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let commitment = g1.commit(session.id).unwrap();

        let compact = format!("05{}", &commitment[2..]);
        let result = h.manager.submit_nonce_commitment(session.id, "g1", &compact).await;
        assert!(matches!(
            result,
            Err(SigningError::InvalidContribution { ref guardian_id, .. }) if guardian_id == "g1"
        ));
        assert_eq!(
            h.manager.get_session(session.id).await.unwrap().status,
            SessionStatus::Pending
        );

        let status = h
            .manager
            .submit_nonce_commitment(session.id, "g1", &commitment)
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::NonceCollection);
    }

    /// Memory store whose next `complete_session` fails with a connection error
    struct FlakyCompletionStore {
        inner: MemorySessionStore,
        fail_next_completion: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SessionStore for FlakyCompletionStore {
        async fn insert_session(&self, session: &SigningSession) -> StorageResult<()> {
            self.inner.insert_session(session).await
        }

        async fn get_session(&self, id: Uuid) -> StorageResult<Option<SigningSession>> {
            self.inner.get_session(id).await
        }

        async fn transition(
            &self,
            id: Uuid,
            from: &[SessionStatus],
            to: SessionStatus,
        ) -> StorageResult<bool> {
            self.inner.transition(id, from, to).await
        }

        async fn complete_session(
            &self,
            id: Uuid,
            from: &[SessionStatus],
            signature: &SchnorrSignature,
        ) -> StorageResult<bool> {
            if self
                .fail_next_completion
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(StorageError::Connection("pool timed out".to_string()));
            }
            self.inner.complete_session(id, from, signature).await
        }

        async fn fail_session(
            &self,
            id: Uuid,
            from: &[SessionStatus],
            reason: &str,
        ) -> StorageResult<bool> {
            self.inner.fail_session(id, from, reason).await
        }

        async fn set_published_event_id(&self, id: Uuid, event_id: &str) -> StorageResult<()> {
            self.inner.set_published_event_id(id, event_id).await
        }

        async fn insert_contribution(
            &self,
            insert: ContributionInsert<'_>,
        ) -> StorageResult<SessionStatus> {
            self.inner.insert_contribution(insert).await
        }

        async fn get_contributions(&self, session_id: Uuid) -> StorageResult<Vec<GuardianContribution>> {
            self.inner.get_contributions(session_id).await
        }

        async fn expire_sessions(&self, now: chrono::DateTime<chrono::Utc>) -> StorageResult<u64> {
            self.inner.expire_sessions(now).await
        }

        async fn get_active(&self) -> StorageResult<Vec<SigningSession>> {
            self.inner.get_active().await
        }
    }

    #[tokio::test]
    async fn test_store_error_on_completion_allows_retry() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let manager = FrostSessionManager::new(
            Arc::new(FlakyCompletionStore {
                inner: MemorySessionStore::new(),
                fail_next_completion: std::sync::atomic::AtomicBool::new(true),
            }),
            Arc::new(federation.registry()),
            Arc::new(ManualClock::default()),
            "family",
            Duration::from_secs(600),
        );
        let hash = "46".repeat(32);
        let session = manager
            .create_session(2, federation.guardian_ids(), &hash)
            .await
            .unwrap();
        let signers = [federation.signer("g1").unwrap(), federation.signer("g2").unwrap()];
        for signer in &signers {
            let commitment = signer.commit(session.id).unwrap();
            manager
                .submit_nonce_commitment(session.id, signer.guardian_id(), &commitment)
                .await
                .unwrap();
        }
        let package = manager.request_signatures(session.id).await.unwrap();
        for signer in &signers {
            let partial = signer.sign(session.id, &package).unwrap();
            manager
                .submit_partial_signature(session.id, signer.guardian_id(), &partial)
                .await
                .unwrap();
        }

        let err = manager.aggregate_signatures(session.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            manager.get_session(session.id).await.unwrap().status,
            SessionStatus::Signing
        );

        let signature = manager.aggregate_signatures(session.id).await.unwrap();
        let message = crypto::parse_message_hash(&hash).unwrap();
        assert!(crypto::verify_signature(&federation.group_key(), &message, &signature).unwrap());
        assert_eq!(
            manager.get_session(session.id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_partial_without_commitment() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"55".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let g2 = h.federation.signer("g2").unwrap();
        commit_all(&h, session.id, &[&g1, &g2]).await;
        h.manager.request_signatures(session.id).await.unwrap();

        let result = h
            .manager
            .submit_partial_signature(session.id, "g3", &"01".repeat(32))
            .await;
        assert!(matches!(result, Err(SigningError::MissingNonceCommitment { .. })));
    }

    #[tokio::test]
    async fn test_commitment_after_freeze_rejected() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"66".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let g2 = h.federation.signer("g2").unwrap();
        let g3 = h.federation.signer("g3").unwrap();
        commit_all(&h, session.id, &[&g1, &g2]).await;
        h.manager.request_signatures(session.id).await.unwrap();

        let late = g3.commit(session.id).unwrap();
        let result = h.manager.submit_nonce_commitment(session.id, "g3", &late).await;
        assert!(matches!(
            result,
            Err(SigningError::InvalidState {
                status: SessionStatus::Signing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bad_partial_fails_session_with_attribution() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"77".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let g2 = h.federation.signer("g2").unwrap();
        commit_all(&h, session.id, &[&g1, &g2]).await;
        let package = h.manager.request_signatures(session.id).await.unwrap();

        let good = g1.sign(session.id, &package).unwrap();
        h.manager
            .submit_partial_signature(session.id, "g1", &good)
            .await
            .unwrap();
        h.manager
            .submit_partial_signature(session.id, "g2", &"42".repeat(32))
            .await
            .unwrap();

        let err = h.manager.aggregate_signatures(session.id).await.unwrap_err();
        assert_eq!(err.error_code(), "AGGREGATION_ERROR");
        assert_eq!(err.guardian(), Some("g2"));

        let failed = h.manager.get_session(session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("g2"));
    }

    #[tokio::test]
    async fn test_out_of_range_partial_is_attributed() {
        let h = harness(2, 2);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"88".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        let g2 = h.federation.signer("g2").unwrap();
        commit_all(&h, session.id, &[&g1, &g2]).await;
        let package = h.manager.request_signatures(session.id).await.unwrap();

        let good = g1.sign(session.id, &package).unwrap();
        h.manager
            .submit_partial_signature(session.id, "g1", &good)
            .await
            .unwrap();
        h.manager
            .submit_partial_signature(session.id, "g2", &"ff".repeat(32))
            .await
            .unwrap();

        let err = h.manager.aggregate_signatures(session.id).await.unwrap_err();
        assert_eq!(err.guardian(), Some("g2"));
    }

    #[tokio::test]
    async fn test_malformed_commitment_rejected() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"99".repeat(32))
            .await
            .unwrap();

        let result = h
            .manager
            .submit_nonce_commitment(session.id, "g1", &format!("05{}", "00".repeat(32)))
            .await;
        assert!(matches!(result, Err(SigningError::InvalidContribution { .. })));

        let result = h
            .manager
            .submit_nonce_commitment(session.id, "stranger", &"02".repeat(33))
            .await;
        assert!(matches!(result, Err(SigningError::NotAParticipant { .. })));
    }

    #[tokio::test]
    async fn test_expired_session_rejects_submissions() {
        let h = harness(2, 3);
        let session = h
            .manager
            .create_session(2, h.federation.guardian_ids(), &"aa".repeat(32))
            .await
            .unwrap();
        let g1 = h.federation.signer("g1").unwrap();
        commit_all(&h, session.id, &[&g1]).await;

        h.clock.advance(chrono::Duration::minutes(10));
        let g2 = h.federation.signer("g2").unwrap();
        let commitment = g2.commit(session.id).unwrap();
        let result = h
            .manager
            .submit_nonce_commitment(session.id, "g2", &commitment)
            .await;
        assert!(matches!(result, Err(SigningError::SessionExpired(_))));
        assert_eq!(
            h.manager.get_session(session.id).await.unwrap().status,
            SessionStatus::Expired
        );
        assert_eq!(h.manager.expire_old_sessions().await.unwrap(), 0);
    }
}
