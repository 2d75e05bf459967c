//! Guardian-side FROST participant
//!
//! Each guardian runs one `GuardianSigner` holding its key share. Round 1
//! hands out a fresh nonce commitment per session; round 2 consumes that
//! nonce exactly once. A nonce is never reusable, even after a failed sign.

use k256::elliptic_curve::Field;
use k256::{AffinePoint, Scalar};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, ChallengeContext, CryptoError};
use crate::shamir::SecretShare;
use crate::shares::{GuardianShare, ShareError};
use crate::types::SigningPackage;

/// Guardian errors
#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("nonce for session {0} was already committed")]
    NonceAlreadyCommitted(Uuid),
    #[error("nonce for session {0} was already used")]
    NonceAlreadyUsed(Uuid),
    #[error("no nonce committed for session {0}")]
    NoNonce(Uuid),
    #[error("guardian {0} is not part of the signing set")]
    NotInSigningSet(String),
    #[error("signing package rejected: {0}")]
    InvalidPackage(String),
    #[error("share error: {0}")]
    Share(#[from] ShareError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Default)]
struct NonceBook {
    pending: HashMap<Uuid, Zeroizing<Scalar>>,
    used: HashSet<Uuid>,
}

/// FROST participant holding one key share
pub struct GuardianSigner {
    guardian_id: String,
    share_index: u16,
    signing_share: Zeroizing<Scalar>,
    group_key: AffinePoint,
    nonces: RwLock<NonceBook>,
}

impl GuardianSigner {
    pub fn new(
        guardian_id: impl Into<String>,
        share: &SecretShare,
        group_key: AffinePoint,
    ) -> Result<Self, GuardianError> {
        Ok(Self {
            guardian_id: guardian_id.into(),
            share_index: share.index,
            signing_share: Zeroizing::new(share.scalar()?),
            group_key,
            nonces: RwLock::new(NonceBook::default()),
        })
    }

    /// Open a sealed share with the guardian's secret
    pub fn from_sealed(
        sealed: &GuardianShare,
        guardian_secret: &str,
        group_key_hex: &str,
    ) -> Result<Self, GuardianError> {
        let share = sealed.open(guardian_secret)?;
        let group_key = crypto::parse_point(group_key_hex)?;
        Self::new(sealed.guardian_id.clone(), &share, group_key)
    }

    pub fn guardian_id(&self) -> &str {
        &self.guardian_id
    }

    pub fn share_index(&self) -> u16 {
        self.share_index
    }

    /// Public key share `x_i·G` (hex)
    pub fn public_key_share(&self) -> Result<String, GuardianError> {
        Ok(crypto::point_to_hex(&crypto::public_point(&self.signing_share))?)
    }

    /// Round 1: fresh nonce commitment for `session_id`
    pub fn commit(&self, session_id: Uuid) -> Result<String, GuardianError> {
        let mut book = self.nonces.write().unwrap_or_else(|e| e.into_inner());
        if book.used.contains(&session_id) {
            return Err(GuardianError::NonceAlreadyUsed(session_id));
        }
        if book.pending.contains_key(&session_id) {
            return Err(GuardianError::NonceAlreadyCommitted(session_id));
        }

        let nonce = Zeroizing::new(Scalar::random(&mut rand::thread_rng()));
        let commitment = crypto::point_to_hex(&crypto::public_point(&nonce))?;
        book.pending.insert(session_id, nonce);

        tracing::debug!(
            guardian_id = %self.guardian_id,
            session_id = %session_id,
            "Generated nonce commitment"
        );
        Ok(commitment)
    }

    /// Round 2: partial signature over the package, consuming the nonce
    pub fn sign(&self, session_id: Uuid, package: &SigningPackage) -> Result<String, GuardianError> {
        let nonce = {
            let mut book = self.nonces.write().unwrap_or_else(|e| e.into_inner());
            if book.used.contains(&session_id) {
                return Err(GuardianError::NonceAlreadyUsed(session_id));
            }
            let nonce = book
                .pending
                .remove(&session_id)
                .ok_or(GuardianError::NoNonce(session_id))?;
            book.used.insert(session_id);
            nonce
        };

        if package.session_id != session_id {
            return Err(GuardianError::InvalidPackage("session mismatch".to_string()));
        }
        let me = package
            .signers
            .iter()
            .find(|s| s.guardian_id == self.guardian_id)
            .ok_or_else(|| GuardianError::NotInSigningSet(self.guardian_id.clone()))?;
        if me.share_index != self.share_index {
            return Err(GuardianError::InvalidPackage("share index mismatch".to_string()));
        }
        let own_commitment = crypto::public_point(&nonce);
        if crypto::parse_point(&me.commitment)? != own_commitment.to_affine() {
            return Err(GuardianError::InvalidPackage(
                "commitment does not match this guardian's nonce".to_string(),
            ));
        }

        // Recompute everything the coordinator claims
        let message = crypto::parse_message_hash(&package.message_hash)?;
        let commitments = package
            .signers
            .iter()
            .map(|s| crypto::parse_point(&s.commitment))
            .collect::<Result<Vec<_>, _>>()?;
        let aggregate_nonce = crypto::aggregate_points(&commitments)?.to_affine();
        if crypto::parse_point(&package.aggregate_nonce)? != aggregate_nonce {
            return Err(GuardianError::InvalidPackage("aggregate nonce mismatch".to_string()));
        }
        let context = ChallengeContext::new(aggregate_nonce, self.group_key, &message);
        if crypto::scalar_to_hex(&context.challenge) != package.challenge.to_lowercase() {
            return Err(GuardianError::InvalidPackage("challenge mismatch".to_string()));
        }

        let indices: Vec<u16> = package.signers.iter().map(|s| s.share_index).collect();
        let lambda = crypto::lagrange_coefficient(self.share_index, &indices)?;
        let partial = Zeroizing::new(context.partial_signature(&nonce, &lambda, &self.signing_share));

        tracing::debug!(
            guardian_id = %self.guardian_id,
            session_id = %session_id,
            signers = package.signers.len(),
            "Generated partial signature"
        );
        Ok(crypto::scalar_to_hex(&partial))
    }

    /// Sessions with an outstanding nonce
    pub fn pending_sessions(&self) -> usize {
        self.nonces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}
