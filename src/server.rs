//! Axum HTTP server for the federation signer
//!
//! Exposes session creation, guardian submissions, finalization and
//! publication of the unified signing service.

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::SigningError;
use crate::service::{self, UnifiedSigningService};
use crate::types::{
    ContributionResponse, ErrorResponse, ExpireResponse, FinalizeResponse, HealthResponse,
    MethodRecommendation, NonceCommitmentRequest, PartialSignatureRequest, PublishResponse,
    ShareSubmissionRequest, SignatureRequest, SigningPackage, SigningSession, VerificationResult,
};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Application state shared across handlers
pub struct AppState {
    pub service: UnifiedSigningService,
}

impl AppState {
    pub fn new(service: UnifiedSigningService) -> Self {
        Self { service }
    }
}

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/methods/{use_case}", get(recommend_handler))
        // Sessions
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{id}", get(get_session_handler))
        .route("/sessions/{id}/nonces", post(nonce_handler))
        .route("/sessions/{id}/signing-package", post(signing_package_handler))
        .route("/sessions/{id}/partials", post(partial_handler))
        .route("/sessions/{id}/shares", post(share_handler))
        .route("/sessions/{id}/finalize", post(finalize_handler))
        .route("/sessions/{id}/verify", get(verify_handler))
        .route("/sessions/{id}/publish", post(publish_handler))
        // Maintenance
        .route("/maintenance/expire", post(expire_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    state.service.health().await.map(Json).map_err(signing_error)
}

async fn recommend_handler(Path(use_case): Path<String>) -> ApiResult<MethodRecommendation> {
    let use_case = service::parse_use_case(&use_case).map_err(signing_error)?;
    Ok(Json(service::recommend_method(use_case)))
}

async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignatureRequest>,
) -> Result<(StatusCode, Json<SigningSession>), ApiError> {
    let session = state
        .service
        .request_signature(request)
        .await
        .map_err(signing_error)?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<SigningSession> {
    state.service.get_session(id).await.map(Json).map_err(signing_error)
}

/// FROST round 1
async fn nonce_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<NonceCommitmentRequest>,
) -> ApiResult<ContributionResponse> {
    let status = state
        .service
        .submit_nonce_commitment(id, &request.guardian_id, &request.commitment)
        .await
        .map_err(signing_error)?;
    Ok(Json(ContributionResponse {
        session_id: id,
        guardian_id: request.guardian_id,
        status,
    }))
}

/// Freeze the signing set and return the package
async fn signing_package_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<SigningPackage> {
    state
        .service
        .request_signatures(id)
        .await
        .map(Json)
        .map_err(signing_error)
}

/// FROST round 2
async fn partial_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<PartialSignatureRequest>,
) -> ApiResult<ContributionResponse> {
    let status = state
        .service
        .submit_partial_signature(id, &request.guardian_id, &request.partial_signature)
        .await
        .map_err(signing_error)?;
    Ok(Json(ContributionResponse {
        session_id: id,
        guardian_id: request.guardian_id,
        status,
    }))
}

/// SSS share submission
async fn share_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ShareSubmissionRequest>,
) -> ApiResult<ContributionResponse> {
    let status = state
        .service
        .submit_share(id, &request.guardian_id, request.share_index, &request.share_value)
        .await
        .map_err(signing_error)?;
    Ok(Json(ContributionResponse {
        session_id: id,
        guardian_id: request.guardian_id,
        status,
    }))
}

async fn finalize_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<FinalizeResponse> {
    state.service.finalize(id).await.map(Json).map_err(signing_error)
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    /// Defaults to the session's own digest
    message_hash: Option<String>,
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<VerificationResult> {
    let message_hash = match query.message_hash {
        Some(hash) => hash,
        None => {
            state
                .service
                .get_session(id)
                .await
                .map_err(signing_error)?
                .message_hash
        }
    };
    state
        .service
        .verify(id, &message_hash)
        .await
        .map(Json)
        .map_err(signing_error)
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<PublishResponse> {
    state
        .service
        .publish_result(id)
        .await
        .map(Json)
        .map_err(signing_error)
}

async fn expire_handler(State(state): State<Arc<AppState>>) -> ApiResult<ExpireResponse> {
    let expired = state
        .service
        .expire_old_sessions()
        .await
        .map_err(signing_error)?;
    Ok(Json(ExpireResponse { expired }))
}

/// Convert signing error to HTTP response
fn signing_error(err: SigningError) -> ApiError {
    let status = match &err {
        SigningError::InvalidThreshold { .. }
        | SigningError::InvalidParticipants(_)
        | SigningError::InvalidMessageHash(_)
        | SigningError::InvalidUseCase(_)
        | SigningError::InvalidContribution { .. } => StatusCode::BAD_REQUEST,
        SigningError::NotAParticipant { .. } | SigningError::NotInSigningSet { .. } => {
            StatusCode::FORBIDDEN
        }
        SigningError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SigningError::SessionExpired(_) => StatusCode::GONE,
        SigningError::MissingNonceCommitment { .. }
        | SigningError::DuplicateContribution { .. }
        | SigningError::NonceReuse { .. }
        | SigningError::InvalidState { .. }
        | SigningError::MethodMismatch { .. }
        | SigningError::InsufficientContributions { .. }
        | SigningError::InsufficientShares { .. }
        | SigningError::NotCompleted(_) => StatusCode::CONFLICT,
        SigningError::InterpolationError(_) | SigningError::AggregationError { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SigningError::Publish(_) => StatusCode::BAD_GATEWAY,
        SigningError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
        SigningError::Storage(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        SigningError::Storage(_) | SigningError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(code = err.error_code(), error = %err, "Request failed");
    } else {
        tracing::debug!(code = err.error_code(), error = %err, "Request rejected");
    }

    let mut body = ErrorResponse::new(err.error_code(), err.to_string());
    if let Some(guardian_id) = err.guardian() {
        body = body.with_guardian(guardian_id);
    }
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::SignerConfig;
    use crate::dealer::TestFederation;
    use crate::publisher::LoggingPublisher;
    use crate::storage::MemorySessionStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_app(federation: &TestFederation) -> Router {
        let config = SignerConfig {
            federation_id: "family".to_string(),
            ..SignerConfig::default()
        };
        let service = UnifiedSigningService::new(
            &config,
            Arc::new(MemorySessionStore::new()),
            Arc::new(federation.registry()),
            Arc::new(LoggingPublisher),
            Arc::new(SystemClock),
        );
        create_router(Arc::new(AppState::new(service)))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let app = create_test_app(&federation);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["guardians"], 3);
    }

    #[tokio::test]
    async fn test_recommend_endpoint() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let app = create_test_app(&federation);

        let request = Request::builder()
            .uri("/methods/emergency_recovery")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["method"], "sss");

        let request = Request::builder().uri("/methods/lunch").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_USE_CASE");
    }

    #[tokio::test]
    async fn test_create_and_fetch_session() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let app = create_test_app(&federation);

        let request = post_json(
            "/sessions",
            serde_json::json!({"use_case": "daily_operations", "message_hash": "ab".repeat(32)}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let session = body_json(response).await;
        assert_eq!(session["method"], "frost");
        assert_eq!(session["status"], "pending");

        let id = session["id"].as_str().unwrap();
        let request = Request::builder()
            .uri(format!("/sessions/{}", id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let app = create_test_app(&federation);

        let request = post_json(
            &format!("/sessions/{}/finalize", Uuid::new_v4()),
            serde_json::json!({}),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_duplicate_nonce_names_guardian() {
        let federation = TestFederation::generate("family", 2, 3).unwrap();
        let app = create_test_app(&federation);

        let request = post_json("/sessions", serde_json::json!({"message_hash": "cd".repeat(32)}));
        let session = body_json(app.clone().oneshot(request).await.unwrap()).await;
        let id = session["id"].as_str().unwrap().to_string();

        let g1 = federation.signer("g1").unwrap();
        let commitment = g1.commit(id.parse().unwrap()).unwrap();
        let body = serde_json::json!({"guardian_id": "g1", "commitment": commitment});

        let response = app
            .clone()
            .oneshot(post_json(&format!("/sessions/{}/nonces", id), body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "nonce_collection");

        let response = app
            .oneshot(post_json(&format!("/sessions/{}/nonces", id), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error = body_json(response).await;
        assert_eq!(error["code"], "DUPLICATE_CONTRIBUTION");
        assert_eq!(error["guardian_id"], "g1");
    }
}
