//! SSS guardian reconstruction
//!
//! Guardians hand over their opened Shamir shares; once `threshold` are in,
//! the federation key is interpolated, used for exactly one BIP-340 signature
//! and wiped. Plaintext shares live only in [`SharePool`] (never in the
//! store) and are dropped, which zeroizes them, as soon as they are consumed.
//!
//! `pending → collecting_shares → reconstructing → completed`

use k256::AffinePoint;
use k256::Scalar;
use secp256k1::{Keypair, Message, SECP256K1};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::clock::Clock;
use crate::config::SssTtls;
use crate::crypto::{self, CryptoError};
use crate::error::{Result, SigningError};
use crate::frost::{ensure_participant, validate_request};
use crate::lifecycle;
use crate::logging;
use crate::registry::{Federation, GuardianRegistry};
use crate::shamir::{self, SecretShare, ShamirError};
use crate::storage::{ContributionInsert, SessionStore, StateTransition};
use crate::types::{
    ContributionRound, GuardianContribution, ReconstructionReason, SchnorrSignature,
    SessionStatus, SigningMethod, SigningSession,
};

const SHARE_STATES: &[SessionStatus] = &[SessionStatus::Pending, SessionStatus::CollectingShares];

/// Plaintext shares of in-flight sessions, keyed by session then guardian
#[derive(Default, Clone)]
pub struct SharePool {
    inner: Arc<Mutex<HashMap<Uuid, BTreeMap<String, SecretShare>>>>,
}

impl SharePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session_id: Uuid, guardian_id: &str, share: SecretShare) {
        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pool.entry(session_id)
            .or_default()
            .insert(guardian_id.to_string(), share);
    }

    fn count(&self, session_id: Uuid) -> usize {
        let pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pool.get(&session_id).map_or(0, BTreeMap::len)
    }

    /// Remove and return every share of a session
    fn take(&self, session_id: Uuid) -> Vec<SecretShare> {
        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pool.remove(&session_id)
            .map(|shares| shares.into_values().collect())
            .unwrap_or_default()
    }

    /// Drop the shares of sessions that are no longer collecting
    pub fn retain_sessions(&self, keep: impl Fn(&Uuid) -> bool) -> usize {
        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = pool.len();
        pool.retain(|id, _| keep(id));
        before - pool.len()
    }

    pub fn sessions(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The federation private key, wiped on drop
pub struct ReconstructedKey {
    session_id: Uuid,
    secret: Zeroizing<Scalar>,
}

impl ReconstructedKey {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Public key of the reconstructed secret
    pub fn public_key(&self) -> AffinePoint {
        crypto::public_point(&self.secret).to_affine()
    }

    /// BIP-340 signature over a 32-byte digest
    pub fn sign(&self, message: &[u8; 32]) -> std::result::Result<SchnorrSignature, CryptoError> {
        let secret_bytes = Zeroizing::new(crypto::scalar_to_bytes(&self.secret));
        let mut keypair = Keypair::from_seckey_slice(SECP256K1, secret_bytes.as_ref())
            .map_err(|_| CryptoError::ScalarOutOfRange)?;
        let msg = Message::from_digest(*message);
        let sig = SECP256K1.sign_schnorr(&msg, &keypair);
        keypair.non_secure_erase();
        Ok(crypto::from_bip340_bytes(&sig.serialize()))
    }

    /// Overwrite the key now instead of at end of scope
    pub fn wipe(mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for ReconstructedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconstructedKey")
            .field("session_id", &self.session_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parameters of a reconstruction request
#[derive(Debug, Clone)]
pub struct ReconstructionParams {
    pub threshold: u16,
    pub reason: ReconstructionReason,
    /// Digest signed with the reconstructed key
    pub message_hash: String,
    /// Invited guardians; every registered guardian when absent
    pub participants: Option<Vec<String>>,
    /// Overrides the per-reason TTL
    pub ttl: Option<Duration>,
    pub event: Option<serde_json::Value>,
}

/// SSS reconstruction manager
pub struct SssReconstructionManager {
    store: Arc<dyn SessionStore>,
    registry: Arc<dyn GuardianRegistry>,
    clock: Arc<dyn Clock>,
    federation_id: String,
    ttls: SssTtls,
    pool: SharePool,
}

impl SssReconstructionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<dyn GuardianRegistry>,
        clock: Arc<dyn Clock>,
        federation_id: impl Into<String>,
        ttls: SssTtls,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            federation_id: federation_id.into(),
            ttls,
            pool: SharePool::new(),
        }
    }

    pub fn share_pool(&self) -> &SharePool {
        &self.pool
    }

    async fn federation(&self) -> Result<Federation> {
        Federation::load(self.registry.as_ref(), &self.federation_id)
            .await
            .map_err(|e| SigningError::Registry(e.to_string()))
    }

    /// Open a reconstruction session inviting every registered guardian
    pub async fn create_reconstruction_request(
        &self,
        threshold: u16,
        reason: ReconstructionReason,
        ttl: Option<Duration>,
        message_hash: &str,
    ) -> Result<SigningSession> {
        self.create_reconstruction_request_with(ReconstructionParams {
            threshold,
            reason,
            message_hash: message_hash.to_string(),
            participants: None,
            ttl,
            event: None,
        })
        .await
    }

    pub async fn create_reconstruction_request_with(
        &self,
        params: ReconstructionParams,
    ) -> Result<SigningSession> {
        let federation = self.federation().await?;
        let participants = params
            .participants
            .unwrap_or_else(|| federation.guardian_ids());
        let message_hash =
            validate_request(&federation, params.threshold, &participants, &params.message_hash)?;

        let ttl = params.ttl.unwrap_or_else(|| self.ttls.for_reason(params.reason));
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SigningError::internal(format!("session TTL out of range: {}", e)))?;
        let mut session = SigningSession::new(
            SigningMethod::Sss,
            params.threshold,
            participants,
            message_hash,
            self.clock.now(),
            ttl,
        );
        session.reason = Some(params.reason);
        session.event_payload = params.event;
        self.store.insert_session(&session).await?;

        tracing::info!(
            session_id = %session.id,
            threshold = session.threshold,
            reason = %params.reason,
            expires_at = %session.expires_at,
            "Created SSS reconstruction request"
        );
        logging::log_security_event(
            "reconstruction_requested",
            true,
            Some(session.id),
            serde_json::json!({
                "reason": params.reason,
                "threshold": session.threshold,
                "participants": session.participants,
            }),
        );
        Ok(session)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SigningSession> {
        lifecycle::load_session(self.store.as_ref(), self.clock.as_ref(), session_id).await
    }

    /// Accept one opened share per guardian
    ///
    /// The share must sit at the guardian's registered index and match its
    /// registered public key share.
    pub async fn submit_share(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        share_index: u16,
        share_value: &str,
    ) -> Result<SessionStatus> {
        let session = self.load_active(session_id).await?;
        ensure_participant(&session, guardian_id)?;

        let federation = self.federation().await?;
        let key = federation.guardian(guardian_id).ok_or_else(|| {
            SigningError::InvalidParticipants(format!("{} is no longer registered", guardian_id))
        })?;
        if key.share_index != share_index {
            return Err(SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: format!(
                    "share index {} does not match registered index {}",
                    share_index, key.share_index
                ),
            });
        }
        let share = SecretShare::from_hex(share_index, share_value.trim()).map_err(|e| {
            SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: format!("share value: {}", e),
            }
        })?;
        let matches_key = share
            .scalar()
            .map(|s| crypto::public_point(&Zeroizing::new(s)).to_affine() == key.public_share)
            .unwrap_or(false);
        if !matches_key {
            logging::log_security_event(
                "share_mismatch",
                false,
                Some(session_id),
                serde_json::json!({"guardian_id": guardian_id, "share_index": share_index}),
            );
            return Err(SigningError::InvalidContribution {
                guardian_id: guardian_id.to_string(),
                reason: "share does not match the registered public key share".to_string(),
            });
        }

        let now = self.clock.now();
        let marker = GuardianContribution::share(session_id, guardian_id, share_index, now);
        let status = self
            .store
            .insert_contribution(ContributionInsert {
                contribution: &marker,
                accepted: SHARE_STATES,
                requires: None,
                advance: Some(StateTransition {
                    from: SessionStatus::Pending,
                    to: SessionStatus::CollectingShares,
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
                    ContributionRound::Share,
                    "accept shares",
                    e,
                )
                .await)
            }
        };
        self.pool.insert(session_id, guardian_id, share);

        logging::log_contribution_event(session_id, guardian_id, ContributionRound::Share, status);
        tracing::debug!(session_id = %session_id, shares = self.pool.count(session_id), "Share pooled");
        if session.status != status {
            logging::log_session_event(session_id, session.method, status, "Share collection started");
        }
        Ok(status)
    }

    /// Interpolate the federation key from the collected shares.
    ///
    /// Consumes the pooled shares and leaves the session `reconstructing`;
    /// [`Self::reconstruct_and_sign`] is the normal entry point.
    pub async fn reconstruct(&self, session_id: Uuid) -> Result<ReconstructedKey> {
        let (key, _) = self.reconstruct_key(session_id).await?;
        Ok(key)
    }

    /// Reconstructed key together with the group key it was checked against
    async fn reconstruct_key(&self, session_id: Uuid) -> Result<(ReconstructedKey, AffinePoint)> {
        let session = self.load_active(session_id).await?;
        match session.status {
            SessionStatus::Pending | SessionStatus::CollectingShares => {}
            status => {
                return Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "reconstruct",
                })
            }
        }

        let have = self.pool.count(session_id);
        let need = session.threshold as usize;
        if have < need {
            return Err(SigningError::InsufficientShares { have, need });
        }
        let federation = self.federation().await?;

        if !self
            .store
            .transition(
                session_id,
                &[SessionStatus::CollectingShares],
                SessionStatus::Reconstructing,
            )
            .await?
        {
            let current = self.get_session(session_id).await?;
            return Err(match current.status {
                SessionStatus::Expired => SigningError::SessionExpired(session_id),
                status => SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "reconstruct",
                },
            });
        }
        logging::log_session_event(session_id, session.method, SessionStatus::Reconstructing, "Reconstructing");

        let shares = self.pool.take(session_id);
        let secret = match shamir::interpolate(&shares, session.threshold) {
            Ok(secret) => secret,
            Err(e) => {
                drop(shares);
                let err = match e {
                    ShamirError::InsufficientShares { have, need } => {
                        SigningError::InsufficientShares { have, need }
                    }
                    other => SigningError::InterpolationError(other.to_string()),
                };
                return Err(self.fail(&session, err).await);
            }
        };
        drop(shares);

        let key = ReconstructedKey { session_id, secret };
        if key.public_key() != federation.group_key {
            key.wipe();
            return Err(self
                .fail(
                    &session,
                    SigningError::InterpolationError(
                        "reconstructed key does not match the federation public key".to_string(),
                    ),
                )
                .await);
        }

        logging::log_security_event(
            "key_reconstructed",
            true,
            Some(session_id),
            serde_json::json!({"shares": have, "reason": session.reason}),
        );
        Ok((key, federation.group_key))
    }

    /// Reconstruct, sign `message_hash`, wipe the key and complete the session.
    ///
    /// Idempotent on a completed session.
    pub async fn reconstruct_and_sign(&self, session_id: Uuid) -> Result<SchnorrSignature> {
        let session = self.load_active(session_id).await?;
        if session.status == SessionStatus::Completed {
            return session.result_signature.clone().ok_or_else(|| {
                SigningError::internal(format!("completed session {} has no signature", session_id))
            });
        }
        let message = crypto::parse_message_hash(&session.message_hash)
            .map_err(|e| SigningError::InvalidMessageHash(e.to_string()))?;

        // Nothing below may leave the session in `reconstructing`: the shares are consumed
        let (key, group_key) = self.reconstruct_key(session_id).await?;
        let signed = key.sign(&message);
        key.wipe();
        let signature = match signed {
            Ok(signature) => signature,
            Err(e) => {
                return Err(self
                    .fail(&session, SigningError::InterpolationError(e.to_string()))
                    .await)
            }
        };

        if !crypto::verify_signature(&group_key, &message, &signature).unwrap_or(false) {
            return Err(self
                .fail(
                    &session,
                    SigningError::internal("signature does not verify under the federation key"),
                )
                .await);
        }

        let completed = match self
            .store
            .complete_session(session_id, &[SessionStatus::Reconstructing], &signature)
            .await
        {
            Ok(completed) => completed,
            Err(e) => return Err(self.fail(&session, e.into()).await),
        };
        if !completed {
            let current = self.get_session(session_id).await?;
            return match (current.status, current.result_signature) {
                (SessionStatus::Completed, Some(stored)) => Ok(stored),
                (SessionStatus::Expired, _) => Err(SigningError::SessionExpired(session_id)),
                (status, _) => Err(SigningError::InvalidState {
                    session_id,
                    status,
                    operation: "complete",
                }),
            };
        }

        tracing::info!(session_id = %session_id, "Signed with reconstructed key");
        logging::log_session_event(session_id, session.method, SessionStatus::Completed, "Signed and wiped");
        Ok(signature)
    }

    /// Expire overdue sessions and drop shares nobody can use any more
    pub async fn expire_old_sessions(&self) -> Result<u64> {
        let count = self.store.expire_sessions(self.clock.now()).await?;
        self.purge_stale_shares().await?;
        Ok(count)
    }

    async fn purge_stale_shares(&self) -> Result<()> {
        let active: std::collections::HashSet<Uuid> = self
            .store
            .get_active()
            .await?
            .into_iter()
            .filter(|s| s.method == SigningMethod::Sss)
            .map(|s| s.id)
            .collect();
        let dropped = self.pool.retain_sessions(|id| active.contains(id));
        if dropped > 0 {
            tracing::info!(sessions = dropped, "Wiped shares of inactive sessions");
        }
        Ok(())
    }

    async fn load_active(&self, session_id: Uuid) -> Result<SigningSession> {
        let session = lifecycle::load_active(
            self.store.as_ref(),
            self.clock.as_ref(),
            session_id,
            SigningMethod::Sss,
        )
        .await;
        if let Err(SigningError::SessionExpired(_)) = session {
            drop(self.pool.take(session_id));
        }
        session
    }

    async fn fail(&self, session: &SigningSession, err: SigningError) -> SigningError {
        drop(self.pool.take(session.id));
        let reason = match err.guardian() {
            Some(guardian_id) => format!("{} (guardian {})", err, guardian_id),
            None => err.to_string(),
        };
        let active = SessionStatus::active_for(SigningMethod::Sss);
        match self.store.fail_session(session.id, active, &reason).await {
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
}
