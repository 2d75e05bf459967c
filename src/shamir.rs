//! Shamir secret sharing over the secp256k1 scalar field
//!
//! Share `i` is `f(i)` for a random polynomial `f` of degree `t - 1` with
//! `f(0)` the secret. Any `t` shares recover `f(0)` by Lagrange interpolation.

use k256::elliptic_curve::Field;
use k256::Scalar;
use rand::{CryptoRng, RngCore};
use std::collections::BTreeSet;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, CryptoError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShamirError {
    #[error("threshold {threshold} invalid for {total} shares")]
    InvalidThreshold { threshold: u16, total: u16 },
    #[error("need {need} shares, have {have}")]
    InsufficientShares { have: usize, need: usize },
    #[error("conflicting share index {0}")]
    ConflictingIndex(u16),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One plaintext share, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretShare {
    pub index: u16,
    value: [u8; 32],
}

impl SecretShare {
    pub fn new(index: u16, value: [u8; 32]) -> Self {
        Self { index, value }
    }

    pub fn from_hex(index: u16, value_hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new(
            hex::decode(value_hex).map_err(|_| CryptoError::InvalidHex("share value".into()))?,
        );
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut value = [0u8; 32];
        value.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { index, value })
    }

    pub fn value(&self) -> &[u8; 32] {
        &self.value
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.value))
    }

    pub(crate) fn scalar(&self) -> Result<Scalar, CryptoError> {
        crypto::scalar_from_bytes(&self.value)
    }
}

impl std::fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretShare")
            .field("index", &self.index)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Split `secret` into `total` shares, any `threshold` of which recover it
pub fn split_secret<R: RngCore + CryptoRng>(
    secret: &Scalar,
    threshold: u16,
    total: u16,
    rng: &mut R,
) -> Result<Vec<SecretShare>, ShamirError> {
    if threshold < 2 || threshold > total {
        return Err(ShamirError::InvalidThreshold { threshold, total });
    }

    let mut coefficients: Vec<Scalar> = Vec::with_capacity(threshold as usize);
    coefficients.push(*secret);
    for _ in 1..threshold {
        coefficients.push(Scalar::random(&mut *rng));
    }

    let shares = (1..=total)
        .map(|index| {
            let x = Scalar::from(u64::from(index));
            // Horner evaluation
            let y = coefficients
                .iter()
                .rev()
                .fold(Scalar::ZERO, |acc, c| acc * x + c);
            SecretShare::new(index, crypto::scalar_to_bytes(&y))
        })
        .collect();

    coefficients.zeroize();
    Ok(shares)
}

/// Recover `f(0)` from exactly the given shares
pub fn interpolate(shares: &[SecretShare], threshold: u16) -> Result<Zeroizing<Scalar>, ShamirError> {
    if shares.len() < threshold as usize {
        return Err(ShamirError::InsufficientShares {
            have: shares.len(),
            need: threshold as usize,
        });
    }

    let mut seen = BTreeSet::new();
    for share in shares {
        if share.index == 0 || !seen.insert(share.index) {
            return Err(ShamirError::ConflictingIndex(share.index));
        }
    }

    let indices: Vec<u16> = shares.iter().map(|s| s.index).collect();
    let mut secret = Zeroizing::new(Scalar::ZERO);
    for share in shares {
        let lambda = crypto::lagrange_coefficient(share.index, &indices)?;
        let y = Zeroizing::new(share.scalar()?);
        *secret += *y * lambda;
    }

    if *secret == Scalar::ZERO {
        return Err(ShamirError::Crypto(CryptoError::ScalarOutOfRange));
    }
    Ok(secret)
}
