//! Event publisher collaborator
//!
//! Receives `{event, signature}` once a session completes. Implementations
//! must be idempotent for a repeated `(event, signature)` pair because
//! publication is retried independently of signing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

use crate::crypto;
use crate::types::SchnorrSignature;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher rejected event: {0}")]
    Rejected(String),
    #[error("publisher unreachable: {0}")]
    Transport(String),
    #[error("invalid publisher response: {0}")]
    InvalidResponse(String),
}

/// Confirmation returned by the publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub event_id: String,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        event: &serde_json::Value,
        signature: &SchnorrSignature,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Wire body posted to the HTTP publisher
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    event: &'a serde_json::Value,
    signature: &'a SchnorrSignature,
    /// 64-byte BIP-340 encoding (hex)
    sig: String,
}

/// Publisher reached over HTTP (relay gateway)
pub struct HttpEventPublisher {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpEventPublisher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PublishError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(
        &self,
        event: &serde_json::Value,
        signature: &SchnorrSignature,
    ) -> Result<PublishReceipt, PublishError> {
        let sig = crypto::to_bip340_bytes(signature)
            .map_err(|e| PublishError::Rejected(format!("malformed signature: {}", e)))?;
        let body = PublishRequest {
            event,
            signature,
            sig: hex::encode(sig),
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("{}: {}", status, text)));
        }

        let receipt: PublishReceipt = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

        tracing::debug!(endpoint = %self.endpoint, event_id = %receipt.event_id, "Event published");
        Ok(receipt)
    }
}

/// Stable id of an `(event, signature)` pair without an id of its own
fn derived_event_id(event: &serde_json::Value, signature: &SchnorrSignature) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.to_string().as_bytes());
    hasher.update(signature.r.as_bytes());
    hasher.update(signature.s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Publisher used when no endpoint is configured; logs and echoes the event id
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

#[async_trait]
impl EventPublisher for LoggingPublisher {
    async fn publish(
        &self,
        event: &serde_json::Value,
        signature: &SchnorrSignature,
    ) -> Result<PublishReceipt, PublishError> {
        let event_id = match event.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => derived_event_id(event, signature),
        };

        tracing::info!(event_id = %event_id, nonce = %signature.r, "Publishing disabled, event logged only");
        Ok(PublishReceipt { event_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> SchnorrSignature {
        crypto::from_bip340_bytes(&[7u8; 64])
    }

    #[tokio::test]
    async fn test_logging_publisher_echoes_event_id() {
        let event = serde_json::json!({"id": "abc123", "kind": 1});
        let receipt = LoggingPublisher.publish(&event, &signature()).await.unwrap();
        assert_eq!(receipt.event_id, "abc123");
    }

    #[tokio::test]
    async fn test_logging_publisher_derives_stable_id() {
        let event = serde_json::json!({"kind": 1});
        let first = LoggingPublisher.publish(&event, &signature()).await.unwrap();
        let second = LoggingPublisher.publish(&event, &signature()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.event_id.len(), 64);

        let other = serde_json::json!({"kind": 2});
        let third = LoggingPublisher.publish(&other, &signature()).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_http_publisher_reports_unreachable_endpoint() {
        let publisher =
            HttpEventPublisher::new("http://127.0.0.1:9/publish", Duration::from_millis(200)).unwrap();
        let event = serde_json::json!({"id": "abc"});
        let result = publisher.publish(&event, &signature()).await;
        assert!(matches!(result, Err(PublishError::Transport(_))));
    }
}
