//! secp256k1 arithmetic behind aggregation and verification
//!
//! Scalars travel as 32-byte big-endian hex, points as 33-byte compressed hex.
//! Challenges follow BIP-340 (`tagged_hash("BIP0340/challenge", x(R) || x(P) || m)`),
//! so an aggregate `(R, s)` is a plain BIP-340 signature once `R` is reduced to
//! its x-coordinate.

use k256::elliptic_curve::group::GroupEncoding;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, CompressedPoint, FieldBytes, ProjectivePoint, Scalar, U256};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::SchnorrSignature;

const CHALLENGE_TAG: &[u8] = b"BIP0340/challenge";

/// Curve-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("scalar outside [1, n-1]")]
    ScalarOutOfRange,
    #[error("invalid point encoding")]
    InvalidPoint,
    #[error("point at infinity")]
    PointAtInfinity,
    #[error("duplicate or zero share index {0}")]
    InvalidIndex(u16),
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    if bytes.len() != N {
        return Err(CryptoError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Decode a 32-byte message digest
pub fn parse_message_hash(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    decode_fixed::<32>(hex_str)
}

/// Parse a non-zero scalar strictly below the curve order
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    let scalar = Option::<Scalar>::from(Scalar::from_repr((*bytes).into()))
        .ok_or(CryptoError::ScalarOutOfRange)?;
    if scalar == Scalar::ZERO {
        return Err(CryptoError::ScalarOutOfRange);
    }
    Ok(scalar)
}

pub fn parse_scalar(hex_str: &str) -> Result<Scalar, CryptoError> {
    scalar_from_bytes(&decode_fixed::<32>(hex_str)?)
}

pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_repr().into()
}

pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar_to_bytes(scalar))
}

/// Parse a compressed SEC1 point
pub fn parse_point(hex_str: &str) -> Result<AffinePoint, CryptoError> {
    let bytes = decode_fixed::<33>(hex_str)?;
    if !matches!(bytes[0], 0x02 | 0x03) {
        return Err(CryptoError::InvalidPoint);
    }
    let encoded = CompressedPoint::clone_from_slice(&bytes);
    Option::<AffinePoint>::from(AffinePoint::from_bytes(&encoded)).ok_or(CryptoError::InvalidPoint)
}

pub fn point_to_bytes(point: &ProjectivePoint) -> Result<[u8; 33], CryptoError> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(CryptoError::PointAtInfinity);
    }
    let encoded = point.to_affine().to_bytes();
    let mut out = [0u8; 33];
    out.copy_from_slice(&encoded);
    Ok(out)
}

pub fn point_to_hex(point: &ProjectivePoint) -> Result<String, CryptoError> {
    Ok(hex::encode(point_to_bytes(point)?))
}

/// Public point of a secret scalar
pub fn public_point(secret: &Scalar) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * secret
}

pub fn has_odd_y(point: &AffinePoint) -> bool {
    bool::from(point.y_is_odd())
}

/// +1 for an even y-coordinate, -1 for an odd one
pub fn parity_factor(point: &AffinePoint) -> Scalar {
    if has_odd_y(point) {
        -Scalar::ONE
    } else {
        Scalar::ONE
    }
}

fn tagged_hash(tag: &[u8], chunks: &[&[u8]]) -> FieldBytes {
    let tag_hash = Sha256::digest(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// BIP-340 challenge `e = H(x(R) || x(P) || m) mod n`
pub fn challenge(nonce: &AffinePoint, group_key: &AffinePoint, message: &[u8; 32]) -> Scalar {
    let digest = tagged_hash(
        CHALLENGE_TAG,
        &[nonce.x().as_slice(), group_key.x().as_slice(), message.as_slice()],
    );
    <Scalar as Reduce<U256>>::reduce_bytes(&digest)
}

/// Lagrange coefficient at zero for `index` within `indices`
pub fn lagrange_coefficient(index: u16, indices: &[u16]) -> Result<Scalar, CryptoError> {
    if index == 0 {
        return Err(CryptoError::InvalidIndex(index));
    }
    let x_i = Scalar::from(u64::from(index));
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &other in indices {
        if other == index {
            continue;
        }
        if other == 0 {
            return Err(CryptoError::InvalidIndex(other));
        }
        let x_j = Scalar::from(u64::from(other));
        numerator *= x_j;
        denominator *= x_j - x_i;
    }

    let inverse = Option::<Scalar>::from(denominator.invert())
        .ok_or(CryptoError::InvalidIndex(index))?;
    Ok(numerator * inverse)
}

/// Sum nonce commitments into the aggregate nonce `R`
pub fn aggregate_points(points: &[AffinePoint]) -> Result<ProjectivePoint, CryptoError> {
    let sum = points
        .iter()
        .fold(ProjectivePoint::IDENTITY, |acc, p| acc + ProjectivePoint::from(*p));
    if sum == ProjectivePoint::IDENTITY {
        return Err(CryptoError::PointAtInfinity);
    }
    Ok(sum)
}

/// Sum partial signatures mod n into `s`
pub fn aggregate_scalars(scalars: &[Scalar]) -> Scalar {
    scalars.iter().fold(Scalar::ZERO, |acc, s| acc + s)
}

/// Context shared by every partial signature of one signing set
#[derive(Debug, Clone, Copy)]
pub struct ChallengeContext {
    pub aggregate_nonce: AffinePoint,
    pub group_key: AffinePoint,
    pub challenge: Scalar,
}

impl ChallengeContext {
    pub fn new(aggregate_nonce: AffinePoint, group_key: AffinePoint, message: &[u8; 32]) -> Self {
        Self {
            aggregate_nonce,
            group_key,
            challenge: challenge(&aggregate_nonce, &group_key, message),
        }
    }

    /// `z_i = ε_R·k_i + e·λ_i·ε_P·x_i`
    pub fn partial_signature(&self, nonce: &Scalar, lambda: &Scalar, share: &Scalar) -> Scalar {
        parity_factor(&self.aggregate_nonce) * nonce
            + self.challenge * lambda * parity_factor(&self.group_key) * share
    }

    /// Check `z_i·G = ε_R·R_i + e·λ_i·ε_P·Y_i`
    pub fn verify_partial(
        &self,
        partial: &Scalar,
        commitment: &AffinePoint,
        lambda: &Scalar,
        public_share: &AffinePoint,
    ) -> bool {
        let lhs = ProjectivePoint::GENERATOR * partial;
        let rhs = ProjectivePoint::from(*commitment) * parity_factor(&self.aggregate_nonce)
            + ProjectivePoint::from(*public_share)
                * (self.challenge * lambda * parity_factor(&self.group_key));
        lhs == rhs
    }
}

/// Standard Schnorr check `s·G = R + e·P` over the even-y lifts of `R` and `P`
pub fn verify_signature(
    group_key: &AffinePoint,
    message: &[u8; 32],
    signature: &SchnorrSignature,
) -> Result<bool, CryptoError> {
    let nonce = parse_point(&signature.r)?;
    let s = parse_scalar(&signature.s)?;
    let e = challenge(&nonce, group_key, message);

    let lhs = ProjectivePoint::GENERATOR * s;
    let rhs = ProjectivePoint::from(even_lift(&nonce)) + ProjectivePoint::from(even_lift(group_key)) * e;
    Ok(lhs == rhs)
}

fn even_lift(point: &AffinePoint) -> AffinePoint {
    if has_odd_y(point) {
        -*point
    } else {
        *point
    }
}

/// 64-byte BIP-340 encoding `x(R) || s`
pub fn to_bip340_bytes(signature: &SchnorrSignature) -> Result<[u8; 64], CryptoError> {
    let r = decode_fixed::<33>(&signature.r)?;
    let s = decode_fixed::<32>(&signature.s)?;
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&r[1..33]);
    out[32..].copy_from_slice(&s);
    Ok(out)
}

/// Inverse of [`to_bip340_bytes`]; BIP-340 nonces always have even y
pub fn from_bip340_bytes(bytes: &[u8; 64]) -> SchnorrSignature {
    let mut r = [0u8; 33];
    r[0] = 0x02;
    r[1..].copy_from_slice(&bytes[..32]);
    SchnorrSignature {
        r: hex::encode(r),
        s: hex::encode(&bytes[32..]),
    }
}
