//! In-Memory Session Store
//!
//! In-memory storage for tests. Nothing is ever evicted: sessions,
//! contributions and the nonce-reuse set grow for the life of the store, so
//! long-running processes use `SqliteSessionStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{ContributionInsert, SessionStore, StorageError, StorageResult};
use crate::types::{
    ContributionRound, GuardianContribution, SchnorrSignature, SessionStatus, SigningSession,
};

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, SigningSession>,
    /// Contributions per session, in submission order
    contributions: HashMap<Uuid, Vec<GuardianContribution>>,
    /// Every nonce commitment ever recorded
    nonce_commitments: HashSet<String>,
}

/// In-memory session store
///
/// A single write lock covers sessions and contributions so that an insert
/// and its status advance are observed together.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemorySessionStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn compare_and_set(
    inner: &mut Inner,
    id: Uuid,
    from: &[SessionStatus],
    apply: impl FnOnce(&mut SigningSession),
) -> StorageResult<bool> {
    let session = inner
        .sessions
        .get_mut(&id)
        .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
    if !from.contains(&session.status) {
        return Ok(false);
    }
    apply(session);
    Ok(true)
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_session(&self, session: &SigningSession) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(StorageError::Duplicate(format!("session {}", session.id)));
        }
        inner.sessions.insert(session.id, session.clone());
        inner.contributions.insert(session.id, Vec::new());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> StorageResult<Option<SigningSession>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        compare_and_set(&mut inner, id, from, |s| s.status = to)
    }

    async fn complete_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        signature: &SchnorrSignature,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        compare_and_set(&mut inner, id, from, |s| {
            s.status = SessionStatus::Completed;
            s.result_signature = Some(signature.clone());
        })
    }

    async fn fail_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        reason: &str,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        compare_and_set(&mut inner, id, from, |s| {
            s.status = SessionStatus::Failed;
            s.failure_reason = Some(reason.to_string());
        })
    }

    async fn set_published_event_id(&self, id: Uuid, event_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if session.status != SessionStatus::Completed {
            return Err(StorageError::StateConflict(session.status));
        }
        session.published_event_id = Some(event_id.to_string());
        Ok(())
    }

    async fn insert_contribution(
        &self,
        insert: ContributionInsert<'_>,
    ) -> StorageResult<SessionStatus> {
        let contribution = insert.contribution;
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let session = inner
            .sessions
            .get(&contribution.session_id)
            .ok_or_else(|| StorageError::NotFound(contribution.session_id.to_string()))?;
        if session.status == SessionStatus::Expired || session.is_overdue(insert.now) {
            return Err(StorageError::Expired);
        }
        if !insert.accepted.contains(&session.status) {
            return Err(StorageError::StateConflict(session.status));
        }

        let existing = inner
            .contributions
            .get(&contribution.session_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let has_round = |round: ContributionRound| {
            existing
                .iter()
                .any(|c| c.guardian_id == contribution.guardian_id && c.round == round)
        };
        if let Some(required) = insert.requires {
            if !has_round(required) {
                return Err(StorageError::MissingPrerequisite(required));
            }
        }
        if has_round(contribution.round) {
            return Err(StorageError::Duplicate(format!(
                "{} {}",
                contribution.guardian_id, contribution.round
            )));
        }
        if let Some(commitment) = &contribution.nonce_commitment {
            if inner.nonce_commitments.contains(commitment) {
                return Err(StorageError::NonceReuse(contribution.guardian_id.clone()));
            }
            inner.nonce_commitments.insert(commitment.clone());
        }

        inner
            .contributions
            .entry(contribution.session_id)
            .or_default()
            .push(contribution.clone());

        let session = inner
            .sessions
            .get_mut(&contribution.session_id)
            .ok_or_else(|| StorageError::NotFound(contribution.session_id.to_string()))?;
        if let Some(advance) = insert.advance {
            if session.status == advance.from {
                session.status = advance.to;
            }
        }
        Ok(session.status)
    }

    async fn get_contributions(&self, session_id: Uuid) -> StorageResult<Vec<GuardianContribution>> {
        let inner = self.inner.read().await;
        Ok(inner
            .contributions
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn expire_sessions(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for session in inner.sessions.values_mut() {
            if session.is_overdue(now) {
                session.status = SessionStatus::Expired;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_active(&self) -> StorageResult<Vec<SigningSession>> {
        let inner = self.inner.read().await;
        let mut active: Vec<SigningSession> = inner
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateTransition;
    use crate::types::SigningMethod;

    fn session(now: DateTime<Utc>) -> SigningSession {
        SigningSession::new(
            SigningMethod::Frost,
            2,
            vec!["g1".into(), "g2".into(), "g3".into()],
            "ab".repeat(32),
            now,
            chrono::Duration::minutes(10),
        )
    }

    fn nonce_insert(c: &GuardianContribution, now: DateTime<Utc>) -> ContributionInsert<'_> {
        ContributionInsert {
            contribution: c,
            accepted: &[SessionStatus::Pending, SessionStatus::NonceCollection],
            requires: None,
            advance: Some(StateTransition {
                from: SessionStatus::Pending,
                to: SessionStatus::NonceCollection,
            }),
            now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();

        let loaded = store.get_session(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contribution_advances_status() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();

        let c = GuardianContribution::nonce(s.id, "g1", "02aa", now);
        let status = store.insert_contribution(nonce_insert(&c, now)).await.unwrap();
        assert_eq!(status, SessionStatus::NonceCollection);
        assert_eq!(store.get_contributions(s.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_round_rejected() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();

        let first = GuardianContribution::nonce(s.id, "g1", "02aa", now);
        let second = GuardianContribution::nonce(s.id, "g1", "02bb", now);
        store.insert_contribution(nonce_insert(&first, now)).await.unwrap();
        let result = store.insert_contribution(nonce_insert(&second, now)).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_nonce_reuse_across_sessions() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let a = session(now);
        let b = session(now);
        store.insert_session(&a).await.unwrap();
        store.insert_session(&b).await.unwrap();

        let first = GuardianContribution::nonce(a.id, "g1", "02aa", now);
        let reused = GuardianContribution::nonce(b.id, "g1", "02aa", now);
        store.insert_contribution(nonce_insert(&first, now)).await.unwrap();
        let result = store.insert_contribution(nonce_insert(&reused, now)).await;
        assert!(matches!(result, Err(StorageError::NonceReuse(_))));
    }

    #[tokio::test]
    async fn test_signature_requires_nonce() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();
        store
            .transition(s.id, &[SessionStatus::Pending], SessionStatus::Signing)
            .await
            .unwrap();

        let c = GuardianContribution::signature(s.id, "g1", "11".repeat(32), now);
        let result = store
            .insert_contribution(ContributionInsert {
                contribution: &c,
                accepted: &[SessionStatus::Signing],
                requires: Some(ContributionRound::Nonce),
                advance: None,
                now,
            })
            .await;
        assert!(matches!(
            result,
            Err(StorageError::MissingPrerequisite(ContributionRound::Nonce))
        ));
    }

    #[tokio::test]
    async fn test_overdue_session_rejects_contribution() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();

        let later = now + chrono::Duration::minutes(11);
        let c = GuardianContribution::nonce(s.id, "g1", "02aa", later);
        let result = store.insert_contribution(nonce_insert(&c, later)).await;
        assert!(matches!(result, Err(StorageError::Expired)));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemorySessionStore::new();
        let s = session(Utc::now());
        store.insert_session(&s).await.unwrap();

        assert!(store
            .transition(s.id, &[SessionStatus::Pending], SessionStatus::Signing)
            .await
            .unwrap());
        assert!(!store
            .transition(s.id, &[SessionStatus::Pending], SessionStatus::Signing)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expire_sessions() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        let s = session(now);
        store.insert_session(&s).await.unwrap();

        assert_eq!(store.expire_sessions(now).await.unwrap(), 0);
        let later = now + chrono::Duration::minutes(10);
        assert_eq!(store.expire_sessions(later).await.unwrap(), 1);
        assert_eq!(store.expire_sessions(later).await.unwrap(), 0);
        assert!(store.get_active().await.unwrap().is_empty());
    }
}
