//! Trusted-dealer federation setup
//!
//! Generates a federation key, splits it into guardian shares and derives the
//! registry record. The dealer sees the whole key, so this is for development
//! and tests only. Production federations run a proper key ceremony.

use k256::elliptic_curve::Field;
use k256::{AffinePoint, Scalar};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use crate::crypto;
use crate::guardian::GuardianSigner;
use crate::registry::{FederationRecord, GuardianInfo, StaticGuardianRegistry};
use crate::shamir::{self, SecretShare, ShamirError};
use crate::shares::{self, GuardianShare, ShareError};

/// A dealt federation: registry record plus every guardian's plaintext share
pub struct TestFederation {
    record: FederationRecord,
    group_key: AffinePoint,
    shares: BTreeMap<String, SecretShare>,
}

impl TestFederation {
    /// Deal `total` shares with threshold `threshold` to guardians `g1..gN`
    pub fn generate(federation_id: &str, threshold: u16, total: u16) -> Result<Self, ShamirError> {
        let secret = Zeroizing::new(Scalar::random(&mut OsRng));
        let shares = shamir::split_secret(&secret, threshold, total, &mut OsRng)?;
        let group_key = crypto::public_point(&secret);

        let mut guardians = Vec::with_capacity(shares.len());
        let mut by_guardian = BTreeMap::new();
        for share in shares {
            let guardian_id = format!("g{}", share.index);
            let public_share = crypto::public_point(&share.scalar()?);
            guardians.push(GuardianInfo {
                guardian_id: guardian_id.clone(),
                share_index: share.index,
                public_key_share: crypto::point_to_hex(&public_share)?,
            });
            by_guardian.insert(guardian_id, share);
        }

        tracing::warn!(
            federation_id,
            threshold,
            total,
            "Generated federation with trusted dealer - FOR DEVELOPMENT ONLY!"
        );

        Ok(Self {
            record: FederationRecord {
                federation_id: federation_id.to_string(),
                threshold,
                group_public_key: crypto::point_to_hex(&group_key)?,
                guardians,
            },
            group_key: group_key.to_affine(),
            shares: by_guardian,
        })
    }

    pub fn record(&self) -> &FederationRecord {
        &self.record
    }

    pub fn registry(&self) -> StaticGuardianRegistry {
        StaticGuardianRegistry::new([self.record.clone()])
    }

    pub fn group_key(&self) -> AffinePoint {
        self.group_key
    }

    pub fn guardian_ids(&self) -> Vec<String> {
        self.shares.keys().cloned().collect()
    }

    pub fn share(&self, guardian_id: &str) -> Option<&SecretShare> {
        self.shares.get(guardian_id)
    }

    /// FROST participant for one guardian
    pub fn signer(&self, guardian_id: &str) -> Option<GuardianSigner> {
        let share = self.shares.get(guardian_id)?;
        GuardianSigner::new(guardian_id, share, self.group_key).ok()
    }

    /// Seal every share under the secret `secret_for(guardian_id)`
    pub fn seal_shares<F>(&self, secret_for: F) -> Result<Vec<GuardianShare>, ShareError>
    where
        F: Fn(&str) -> String,
    {
        self.shares
            .iter()
            .map(|(guardian_id, share)| {
                let secret = Zeroizing::new(secret_for(guardian_id));
                shares::seal_share(guardian_id, share, &secret)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Federation;

    #[tokio::test]
    async fn test_dealt_federation_is_consistent() {
        let federation = TestFederation::generate("family", 3, 5).unwrap();
        assert_eq!(federation.guardian_ids().len(), 5);

        let loaded = Federation::load(&federation.registry(), "family").await.unwrap();
        assert_eq!(loaded.threshold, 3);
        assert_eq!(loaded.group_key, federation.group_key());

        let subset: Vec<SecretShare> = ["g1", "g3", "g5"]
            .iter()
            .map(|id| federation.share(id).unwrap().clone())
            .collect();
        let secret = shamir::interpolate(&subset, 3).unwrap();
        assert_eq!(crypto::public_point(&secret).to_affine(), federation.group_key());
    }

    #[test]
    fn test_sealed_shares_open_with_guardian_secret() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let sealed = federation.seal_shares(|id| format!("secret-{}", id)).unwrap();
        assert_eq!(sealed.len(), 3);

        let opened = sealed[1].open("secret-g2").unwrap();
        assert_eq!(opened.value(), federation.share("g2").unwrap().value());
    }
}
