//! Unified signing service
//!
//! Picks FROST or SSS per use case, routes every follow-up call to the
//! strategy recorded on the session and hands completed signatures to the
//! event publisher.

use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SignerConfig;
use crate::error::{Result, SigningError};
use crate::frost::FrostSessionManager;
use crate::logging;
use crate::publisher::EventPublisher;
use crate::registry::{Federation, GuardianRegistry};
use crate::sss::{ReconstructionParams, SssReconstructionManager};
use crate::storage::SessionStore;
use crate::types::{
    FinalizeResponse, HealthResponse, MethodRecommendation, PublishResponse,
    ReconstructionReason, SessionStatus, SignatureRequest, SigningMethod, SigningPackage,
    SigningSession, UseCase, VerificationResult,
};

/// Method for a use case; an explicit preference always wins
pub fn select_method(use_case: Option<UseCase>, preference: Option<SigningMethod>) -> SigningMethod {
    if let Some(method) = preference {
        return method;
    }
    match use_case {
        Some(
            UseCase::EmergencyRecovery
            | UseCase::KeyRotation
            | UseCase::PerformanceCritical
            | UseCase::OfflineGuardians,
        ) => SigningMethod::Sss,
        Some(
            UseCase::DailyOperations | UseCase::HighValueTransaction | UseCase::FedimintIntegration,
        )
        | None => SigningMethod::Frost,
    }
}

/// Parse a caller-supplied use case
pub fn parse_use_case(use_case: &str) -> Result<UseCase> {
    use_case
        .parse()
        .map_err(|_| SigningError::InvalidUseCase(use_case.to_string()))
}

/// Advisory description of the method chosen for `use_case`
pub fn recommend_method(use_case: UseCase) -> MethodRecommendation {
    let method = select_method(Some(use_case), None);
    let reason = match use_case {
        UseCase::DailyOperations => "Routine signing; no reason to ever materialize the key",
        UseCase::HighValueTransaction => "Maximum security: the private key is never reconstructed",
        UseCase::FedimintIntegration => "Federation protocols expect threshold Schnorr signatures",
        UseCase::EmergencyRecovery => "Recovery must succeed even if some guardians are unreachable",
        UseCase::KeyRotation => "Rotation needs the full key once to re-share it",
        UseCase::PerformanceCritical => "Single-round share collection has the lowest latency",
        UseCase::OfflineGuardians => "Shares can be collected asynchronously from absent guardians",
    };
    let (expected_latency, security_notes) = match method {
        SigningMethod::Frost => (
            "two guardian rounds (nonce commitment, then partial signature)",
            vec![
                "The private key never exists in one place".to_string(),
                "Every signer must stay online for both rounds".to_string(),
                "Each partial signature is verified against the guardian's key share".to_string(),
            ],
        ),
        SigningMethod::Sss => (
            "one guardian round (share submission)",
            vec![
                "The full key is reconstructed in memory for one signature".to_string(),
                "Shares and the reconstructed key are wiped right after signing".to_string(),
                "Shares are checked against the guardian's registered key share".to_string(),
            ],
        ),
    };
    MethodRecommendation {
        method,
        reason: reason.to_string(),
        expected_latency: expected_latency.to_string(),
        security_notes,
    }
}

fn reason_for(use_case: Option<UseCase>) -> ReconstructionReason {
    match use_case {
        Some(UseCase::EmergencyRecovery) => ReconstructionReason::EmergencyRecovery,
        Some(UseCase::KeyRotation) => ReconstructionReason::KeyRotation,
        _ => ReconstructionReason::Routine,
    }
}

/// Facade over both signing strategies
pub struct UnifiedSigningService {
    frost: FrostSessionManager,
    sss: SssReconstructionManager,
    store: Arc<dyn SessionStore>,
    registry: Arc<dyn GuardianRegistry>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    federation_id: String,
}

impl UnifiedSigningService {
    pub fn new(
        config: &SignerConfig,
        store: Arc<dyn SessionStore>,
        registry: Arc<dyn GuardianRegistry>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let frost = FrostSessionManager::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            config.federation_id.clone(),
            config.frost_ttl,
        );
        let sss = SssReconstructionManager::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            config.federation_id.clone(),
            config.sss_ttls,
        );
        Self {
            frost,
            sss,
            store,
            registry,
            publisher,
            clock,
            federation_id: config.federation_id.clone(),
        }
    }

    pub fn frost(&self) -> &FrostSessionManager {
        &self.frost
    }

    pub fn sss(&self) -> &SssReconstructionManager {
        &self.sss
    }

    pub fn federation_id(&self) -> &str {
        &self.federation_id
    }

    async fn federation(&self) -> Result<Federation> {
        Federation::load(self.registry.as_ref(), &self.federation_id)
            .await
            .map_err(|e| SigningError::Registry(e.to_string()))
    }

    /// Open a session with the method selected for the request
    pub async fn request_signature(&self, request: SignatureRequest) -> Result<SigningSession> {
        let method = select_method(request.use_case, request.method);
        let federation = self.federation().await?;
        let threshold = request.threshold.unwrap_or(federation.threshold);
        let participants = request
            .participants
            .unwrap_or_else(|| federation.guardian_ids());

        tracing::info!(
            use_case = ?request.use_case,
            method = %method,
            threshold,
            "Signature requested"
        );

        match method {
            SigningMethod::Frost => {
                self.frost
                    .create_session_with_event(
                        threshold,
                        participants,
                        &request.message_hash,
                        request.event,
                    )
                    .await
            }
            SigningMethod::Sss => {
                self.sss
                    .create_reconstruction_request_with(ReconstructionParams {
                        threshold,
                        reason: request.reason.unwrap_or_else(|| reason_for(request.use_case)),
                        message_hash: request.message_hash,
                        participants: Some(participants),
                        ttl: None,
                        event: request.event,
                    })
                    .await
            }
        }
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SigningSession> {
        self.frost.get_session(session_id).await
    }

    pub async fn submit_nonce_commitment(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        commitment: &str,
    ) -> Result<SessionStatus> {
        self.frost
            .submit_nonce_commitment(session_id, guardian_id, commitment)
            .await
    }

    pub async fn request_signatures(&self, session_id: Uuid) -> Result<SigningPackage> {
        self.frost.request_signatures(session_id).await
    }

    pub async fn submit_partial_signature(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        partial_signature: &str,
    ) -> Result<SessionStatus> {
        self.frost
            .submit_partial_signature(session_id, guardian_id, partial_signature)
            .await
    }

    pub async fn submit_share(
        &self,
        session_id: Uuid,
        guardian_id: &str,
        share_index: u16,
        share_value: &str,
    ) -> Result<SessionStatus> {
        self.sss
            .submit_share(session_id, guardian_id, share_index, share_value)
            .await
    }

    /// Aggregate (FROST) or reconstruct and sign (SSS)
    pub async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse> {
        let session = self.get_session(session_id).await?;
        let signature = match session.method {
            SigningMethod::Frost => self.frost.aggregate_signatures(session_id).await?,
            SigningMethod::Sss => self.sss.reconstruct_and_sign(session_id).await?,
        };
        Ok(FinalizeResponse {
            session_id,
            method: session.method,
            signature,
        })
    }

    pub async fn verify(&self, session_id: Uuid, message_hash: &str) -> Result<VerificationResult> {
        self.frost
            .verify_aggregated_signature(session_id, message_hash)
            .await
    }

    /// Hand `{event, signature}` of a completed session to the publisher.
    ///
    /// A failure leaves the session completed and unpublished; calling again
    /// retries without re-signing. Once published the stored id is returned.
    pub async fn publish_result(&self, session_id: Uuid) -> Result<PublishResponse> {
        let session = self.get_session(session_id).await?;
        if let Some(event_id) = session.published_event_id {
            return Ok(PublishResponse {
                session_id,
                published_event_id: event_id,
            });
        }
        if session.status != SessionStatus::Completed {
            return Err(SigningError::NotCompleted(session_id));
        }
        let signature = session
            .result_signature
            .clone()
            .ok_or(SigningError::NotCompleted(session_id))?;

        let verified = self.verify(session_id, &session.message_hash).await?;
        if !verified.valid {
            logging::log_security_event(
                "publish_refused",
                false,
                Some(session_id),
                serde_json::json!({"reason": "stored signature does not verify"}),
            );
            return Err(SigningError::internal(format!(
                "signature of session {} does not verify",
                session_id
            )));
        }

        let event = session.event_payload.unwrap_or_else(|| {
            serde_json::json!({
                "session_id": session_id,
                "federation_id": self.federation_id,
                "message_hash": session.message_hash,
            })
        });
        let receipt = match self.publisher.publish(&event, &signature).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let err = SigningError::Publish(e.to_string());
                logging::log_publish_event(session_id, Err(&err));
                return Err(err);
            }
        };
        self.store
            .set_published_event_id(session_id, &receipt.event_id)
            .await?;

        logging::log_publish_event(session_id, Ok(receipt.event_id.as_str()));
        Ok(PublishResponse {
            session_id,
            published_event_id: receipt.event_id,
        })
    }

    /// Sweep overdue sessions of both methods
    pub async fn expire_old_sessions(&self) -> Result<u64> {
        let count = self.sss.expire_old_sessions().await?;
        if count > 0 {
            logging::log_system_event(
                "Expired overdue sessions",
                serde_json::json!({"expired": count, "at": self.clock.now()}),
            );
        }
        Ok(count)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let federation = self.federation().await?;
        Ok(HealthResponse {
            status: "healthy".to_string(),
            federation_id: federation.federation_id,
            guardians: federation.guardians.len(),
            threshold: federation.threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dealer::TestFederation;
    use crate::publisher::{PublishError, PublishReceipt};
    use crate::storage::MemorySessionStore;
    use crate::types::SchnorrSignature;
    use async_trait::async_trait;

    mockall::mock! {
        pub Publisher {}

        #[async_trait]
        impl EventPublisher for Publisher {
            async fn publish(
                &self,
                event: &serde_json::Value,
                signature: &SchnorrSignature,
            ) -> std::result::Result<PublishReceipt, PublishError>;
        }
    }

    fn service(federation: &TestFederation, publisher: MockPublisher) -> UnifiedSigningService {
        let config = SignerConfig {
            federation_id: "family".to_string(),
            ..SignerConfig::default()
        };
        UnifiedSigningService::new(
            &config,
            Arc::new(MemorySessionStore::new()),
            Arc::new(federation.registry()),
            Arc::new(publisher),
            Arc::new(ManualClock::default()),
        )
    }

    async fn completed_sss_session(
        service: &UnifiedSigningService,
        federation: &TestFederation,
        event: Option<serde_json::Value>,
    ) -> Uuid {
        let session = service
            .request_signature(SignatureRequest {
                use_case: Some(UseCase::EmergencyRecovery),
                message_hash: "5a".repeat(32),
                event,
                ..SignatureRequest::default()
            })
            .await
            .unwrap();
        for id in ["g1", "g2"] {
            let share = federation.share(id).unwrap();
            service
                .submit_share(session.id, id, share.index, &share.to_hex())
                .await
                .unwrap();
        }
        service.finalize(session.id).await.unwrap();
        session.id
    }

    #[test]
    fn test_method_selection_table() {
        assert_eq!(select_method(Some(UseCase::EmergencyRecovery), None), SigningMethod::Sss);
        assert_eq!(select_method(Some(UseCase::OfflineGuardians), None), SigningMethod::Sss);
        assert_eq!(select_method(Some(UseCase::DailyOperations), None), SigningMethod::Frost);
        assert_eq!(select_method(Some(UseCase::FedimintIntegration), None), SigningMethod::Frost);
        assert_eq!(select_method(None, None), SigningMethod::Frost);
        assert_eq!(
            select_method(Some(UseCase::EmergencyRecovery), Some(SigningMethod::Frost)),
            SigningMethod::Frost
        );
        assert_eq!(
            select_method(Some(UseCase::HighValueTransaction), Some(SigningMethod::Sss)),
            SigningMethod::Sss
        );
        assert!(matches!(parse_use_case("lunch"), Err(SigningError::InvalidUseCase(_))));
    }

    #[test]
    fn test_recommendation() {
        let rec = recommend_method(UseCase::KeyRotation);
        assert_eq!(rec.method, SigningMethod::Sss);
        assert!(!rec.security_notes.is_empty());
        assert_eq!(recommend_method(UseCase::DailyOperations).method, SigningMethod::Frost);
    }

    #[tokio::test]
    async fn test_request_routes_by_method() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let service = service(&federation, MockPublisher::new());

        let sss = service
            .request_signature(SignatureRequest {
                use_case: Some(UseCase::KeyRotation),
                message_hash: "10".repeat(32),
                ..SignatureRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(sss.method, SigningMethod::Sss);
        assert_eq!(sss.reason, Some(ReconstructionReason::KeyRotation));
        assert_eq!(sss.participants.len(), 3);
        assert_eq!(sss.threshold, 2);

        let result = service
            .submit_nonce_commitment(sss.id, "g1", &"02".repeat(33))
            .await;
        assert!(matches!(
            result,
            Err(SigningError::MethodMismatch {
                expected: SigningMethod::Frost,
                actual: SigningMethod::Sss,
                ..
            })
        ));

        let frost = service
            .request_signature(SignatureRequest {
                message_hash: "11".repeat(32),
                ..SignatureRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(frost.method, SigningMethod::Frost);
        let result = service.submit_share(frost.id, "g1", 1, &"01".repeat(32)).await;
        assert!(matches!(result, Err(SigningError::MethodMismatch { .. })));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|event, signature| event["kind"] == 1 && signature.r.len() == 66)
            .times(1)
            .returning(|_, _| {
                Ok(PublishReceipt {
                    event_id: "evt-1".to_string(),
                })
            });
        let service = service(&federation, publisher);
        let session_id =
            completed_sss_session(&service, &federation, Some(serde_json::json!({"kind": 1}))).await;

        let first = service.publish_result(session_id).await.unwrap();
        assert_eq!(first.published_event_id, "evt-1");
        let second = service.publish_result(session_id).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_signature() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let mut publisher = MockPublisher::new();
        let mut seq = mockall::Sequence::new();
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(PublishError::Transport("relay offline".to_string())));
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(PublishReceipt {
                    event_id: "evt-2".to_string(),
                })
            });
        let service = service(&federation, publisher);
        let session_id = completed_sss_session(&service, &federation, None).await;
        let signed = service.get_session(session_id).await.unwrap();

        let err = service.publish_result(session_id).await.unwrap_err();
        assert!(err.is_retryable());
        let after = service.get_session(session_id).await.unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert_eq!(after.result_signature, signed.result_signature);
        assert!(after.published_event_id.is_none());

        let retried = service.publish_result(session_id).await.unwrap();
        assert_eq!(retried.published_event_id, "evt-2");
    }

    #[tokio::test]
    async fn test_publish_requires_completion() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let service = service(&federation, MockPublisher::new());
        let session = service
            .request_signature(SignatureRequest {
                message_hash: "12".repeat(32),
                ..SignatureRequest::default()
            })
            .await
            .unwrap();

        let result = service.publish_result(session.id).await;
        assert!(matches!(result, Err(SigningError::NotCompleted(_))));
    }

    #[tokio::test]
    async fn test_health_reports_federation() {
        let federation = TestFederation::generate("family", 3, 5).unwrap();
        let service = service(&federation, MockPublisher::new());
        let health = service.health().await.unwrap();
        assert_eq!(health.guardians, 5);
        assert_eq!(health.threshold, 3);
    }
}
