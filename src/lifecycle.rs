//! Session loading and store-error translation shared by both strategies

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SigningError};
use crate::logging;
use crate::storage::{SessionStore, StorageError};
use crate::types::{ContributionRound, SessionStatus, SigningMethod, SigningSession};

/// Load a session, moving it to `expired` first if it is overdue
pub(crate) async fn load_session(
    store: &dyn SessionStore,
    clock: &dyn Clock,
    session_id: Uuid,
) -> Result<SigningSession> {
    let mut session = store
        .get_session(session_id)
        .await?
        .ok_or(SigningError::SessionNotFound(session_id))?;

    if session.is_overdue(clock.now()) {
        expire_session(store, &session).await?;
        session.status = SessionStatus::Expired;
    }
    Ok(session)
}

/// Load a session that must still accept work under `method`
pub(crate) async fn load_active(
    store: &dyn SessionStore,
    clock: &dyn Clock,
    session_id: Uuid,
    method: SigningMethod,
) -> Result<SigningSession> {
    let session = load_session(store, clock, session_id).await?;
    if session.method != method {
        return Err(SigningError::MethodMismatch {
            session_id,
            expected: method,
            actual: session.method,
        });
    }
    if session.status == SessionStatus::Expired {
        return Err(SigningError::SessionExpired(session_id));
    }
    Ok(session)
}

pub(crate) async fn expire_session(store: &dyn SessionStore, session: &SigningSession) -> Result<()> {
    let active = SessionStatus::active_for(session.method);
    if store
        .transition(session.id, active, SessionStatus::Expired)
        .await?
    {
        logging::log_session_event(
            session.id,
            session.method,
            SessionStatus::Expired,
            "Session expired",
        );
    }
    Ok(())
}

/// Translate a rejected contribution insert into the engine taxonomy
pub(crate) async fn contribution_error(
    store: &dyn SessionStore,
    session: &SigningSession,
    guardian_id: &str,
    round: ContributionRound,
    operation: &'static str,
    err: StorageError,
) -> SigningError {
    match err {
        StorageError::NotFound(_) => SigningError::SessionNotFound(session.id),
        StorageError::Expired => {
            if let Err(e) = expire_session(store, session).await {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to mark session expired");
            }
            SigningError::SessionExpired(session.id)
        }
        StorageError::StateConflict(SessionStatus::Expired) => {
            SigningError::SessionExpired(session.id)
        }
        StorageError::StateConflict(status) => SigningError::InvalidState {
            session_id: session.id,
            status,
            operation,
        },
        StorageError::Duplicate(_) => SigningError::DuplicateContribution {
            guardian_id: guardian_id.to_string(),
            round,
        },
        StorageError::NonceReuse(_) => {
            logging::log_security_event(
                "nonce_reuse",
                false,
                Some(session.id),
                serde_json::json!({"guardian_id": guardian_id}),
            );
            SigningError::NonceReuse {
                guardian_id: guardian_id.to_string(),
            }
        }
        StorageError::MissingPrerequisite(_) => SigningError::MissingNonceCommitment {
            session_id: session.id,
            guardian_id: guardian_id.to_string(),
        },
        other => SigningError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemorySessionStore;
    use chrono::Utc;

    fn session(now: chrono::DateTime<Utc>) -> SigningSession {
        SigningSession::new(
            SigningMethod::Sss,
            2,
            vec!["g1".into(), "g2".into()],
            "00".repeat(32),
            now,
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn test_overdue_session_is_expired_on_load() {
        let store = MemorySessionStore::new();
        let clock = ManualClock::new(Utc::now());
        let s = session(clock.now());
        store.insert_session(&s).await.unwrap();

        clock.advance(chrono::Duration::minutes(6));
        let loaded = load_session(&store, &clock, s.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Expired);
        assert_eq!(
            store.get_session(s.id).await.unwrap().unwrap().status,
            SessionStatus::Expired
        );

        let result = load_active(&store, &clock, s.id, SigningMethod::Sss).await;
        assert!(matches!(result, Err(SigningError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn test_method_mismatch() {
        let store = MemorySessionStore::new();
        let clock = ManualClock::new(Utc::now());
        let s = session(clock.now());
        store.insert_session(&s).await.unwrap();

        let result = load_active(&store, &clock, s.id, SigningMethod::Frost).await;
        assert!(matches!(
            result,
            Err(SigningError::MethodMismatch {
                actual: SigningMethod::Sss,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = MemorySessionStore::new();
        let clock = ManualClock::default();
        let result = load_session(&store, &clock, Uuid::new_v4()).await;
        assert!(matches!(result, Err(SigningError::SessionNotFound(_))));
    }
}
