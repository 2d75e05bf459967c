//! SQLite Persistent Storage for Signing Sessions
//!
//! Provides durable storage for sessions and contributions that survives
//! service restarts. Uses connection pooling via r2d2 for concurrent access.
//!
//! Contribution inserts run in an `IMMEDIATE` transaction so that the state
//! check, the insert and the status advance are one atomic step even with
//! several processes sharing the database file.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use std::path::Path;
use uuid::Uuid;

use super::traits::{ContributionInsert, SessionStore, StorageError, StorageResult};
use crate::types::{
    ContributionRound, GuardianContribution, SchnorrSignature, SessionStatus, SigningSession,
};

/// SQLite-backed session store with connection pooling
pub struct SqliteSessionStore {
    pool: Pool<SqliteConnectionManager>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    // SQLITE_CONSTRAINT_PRIMARYKEY / SQLITE_CONSTRAINT_UNIQUE
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.extended_code == 1555 || err.extended_code == 2067)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn status_list(statuses: &[SessionStatus]) -> String {
    serde_json::Value::from(
        statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>(),
    )
    .to_string()
}

impl SqliteSessionStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signing_sessions (
                id TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                threshold INTEGER NOT NULL,
                total_participants INTEGER NOT NULL,
                message_hash TEXT NOT NULL,
                participants TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                signature_r TEXT,
                signature_s TEXT,
                published_event_id TEXT,
                failure_reason TEXT,
                event_payload TEXT,
                reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON signing_sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON signing_sessions(expires_at);

            CREATE TABLE IF NOT EXISTS guardian_contributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES signing_sessions(id),
                guardian_id TEXT NOT NULL,
                round TEXT NOT NULL,
                nonce_commitment TEXT,
                partial_signature TEXT,
                share_index INTEGER,
                submitted_at INTEGER NOT NULL,
                UNIQUE (session_id, guardian_id, round)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_contributions_nonce
                ON guardian_contributions(nonce_commitment)
                WHERE nonce_commitment IS NOT NULL;
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    /// Convert a database row to SigningSession
    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SigningSession> {
        let id: String = row.get("id")?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?;
        let participants: String = row.get("participants")?;
        let participants: Vec<String> = serde_json::from_str(&participants)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;
        let event_payload = row
            .get::<_, Option<String>>("event_payload")?
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, e.into()))?;

        let signature_r: Option<String> = row.get("signature_r")?;
        let signature_s: Option<String> = row.get("signature_s")?;
        let result_signature = match (signature_r, signature_s) {
            (Some(r), Some(s)) => Some(SchnorrSignature { r, s }),
            _ => None,
        };

        Ok(SigningSession {
            id,
            method: parse_column(1, &row.get::<_, String>("method")?)?,
            status: parse_column(2, &row.get::<_, String>("status")?)?,
            threshold: row.get::<_, i64>("threshold")? as u16,
            total_participants: row.get::<_, i64>("total_participants")? as u16,
            message_hash: row.get("message_hash")?,
            participants,
            created_at: from_millis(7, row.get("created_at")?)?,
            expires_at: from_millis(8, row.get("expires_at")?)?,
            result_signature,
            published_event_id: row.get("published_event_id")?,
            failure_reason: row.get("failure_reason")?,
            event_payload,
            reason: row
                .get::<_, Option<String>>("reason")?
                .map(|r| parse_column(14, &r))
                .transpose()?,
        })
    }

    fn row_to_contribution(row: &rusqlite::Row) -> rusqlite::Result<GuardianContribution> {
        let session_id: String = row.get("session_id")?;
        Ok(GuardianContribution {
            session_id: Uuid::parse_str(&session_id)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?,
            guardian_id: row.get("guardian_id")?,
            round: parse_column(3, &row.get::<_, String>("round")?)?,
            nonce_commitment: row.get("nonce_commitment")?,
            partial_signature: row.get("partial_signature")?,
            share_index: row.get::<_, Option<i64>>("share_index")?.map(|v| v as u16),
            submitted_at: from_millis(7, row.get("submitted_at")?)?,
        })
    }

    fn load_session(conn: &Connection, id: Uuid) -> Result<Option<SigningSession>, StorageError> {
        conn.query_row(
            "SELECT * FROM signing_sessions WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(db_err)
    }

    /// Compare-and-set update. `set_clause` binds `extra` from ?3 on.
    fn cas_sync(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        set_clause: &str,
        extra: &[&dyn ToSql],
    ) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE signing_sessions SET {} WHERE id = ?1 AND status IN (SELECT value FROM json_each(?2))",
            set_clause
        );
        let id_str = id.to_string();
        let statuses = status_list(from);
        let mut bound: Vec<&dyn ToSql> = vec![&id_str, &statuses];
        bound.extend_from_slice(extra);

        let rows = conn.execute(&sql, bound.as_slice()).map_err(db_err)?;
        if rows == 0 && Self::load_session(&conn, id)?.is_none() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(rows > 0)
    }

    // Synchronous helper methods for the trait implementations

    fn insert_session_sync(&self, session: &SigningSession) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let participants = serde_json::to_string(&session.participants)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let event_payload = session
            .event_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO signing_sessions (
                id, method, status, threshold, total_participants,
                message_hash, participants, created_at, expires_at,
                signature_r, signature_s, published_event_id,
                failure_reason, event_payload, reason
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9,
                ?10, ?11, ?12,
                ?13, ?14, ?15
            )
            "#,
            params![
                session.id.to_string(),
                session.method.to_string(),
                session.status.as_str(),
                session.threshold as i64,
                session.total_participants as i64,
                session.message_hash,
                participants,
                to_millis(session.created_at),
                to_millis(session.expires_at),
                session.result_signature.as_ref().map(|s| s.r.clone()),
                session.result_signature.as_ref().map(|s| s.s.clone()),
                session.published_event_id,
                session.failure_reason,
                event_payload,
                session.reason.map(|r| r.to_string()),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                return StorageError::Duplicate(format!("session {}", session.id));
            }
            db_err(e)
        })?;

        Ok(())
    }

    fn get_session_sync(&self, id: Uuid) -> Result<Option<SigningSession>, StorageError> {
        let conn = self.conn()?;
        Self::load_session(&conn, id)
    }

    fn set_published_event_id_sync(&self, id: Uuid, event_id: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE signing_sessions SET published_event_id = ?2 WHERE id = ?1 AND status = 'completed'",
                params![id.to_string(), event_id],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return match Self::load_session(&conn, id)? {
                Some(session) => Err(StorageError::StateConflict(session.status)),
                None => Err(StorageError::NotFound(id.to_string())),
            };
        }
        Ok(())
    }

    fn insert_contribution_sync(
        &self,
        insert: ContributionInsert<'_>,
    ) -> Result<SessionStatus, StorageError> {
        let contribution = insert.contribution;
        let session_id = contribution.session_id.to_string();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let session = Self::load_session(&tx, contribution.session_id)?
            .ok_or_else(|| StorageError::NotFound(session_id.clone()))?;
        if session.status == SessionStatus::Expired || session.is_overdue(insert.now) {
            return Err(StorageError::Expired);
        }
        if !insert.accepted.contains(&session.status) {
            return Err(StorageError::StateConflict(session.status));
        }

        let has_round = |round: ContributionRound| -> Result<bool, StorageError> {
            tx.query_row(
                "SELECT COUNT(*) FROM guardian_contributions WHERE session_id = ?1 AND guardian_id = ?2 AND round = ?3",
                params![session_id, contribution.guardian_id, round.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count > 0)
            .map_err(db_err)
        };
        if let Some(required) = insert.requires {
            if !has_round(required)? {
                return Err(StorageError::MissingPrerequisite(required));
            }
        }
        if has_round(contribution.round)? {
            return Err(StorageError::Duplicate(format!(
                "{} {}",
                contribution.guardian_id, contribution.round
            )));
        }

        tx.execute(
            r#"
            INSERT INTO guardian_contributions (
                session_id, guardian_id, round, nonce_commitment,
                partial_signature, share_index, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session_id,
                contribution.guardian_id,
                contribution.round.to_string(),
                contribution.nonce_commitment,
                contribution.partial_signature,
                contribution.share_index.map(|i| i as i64),
                to_millis(contribution.submitted_at),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                if contribution.nonce_commitment.is_some() {
                    return StorageError::NonceReuse(contribution.guardian_id.clone());
                }
                return StorageError::Duplicate(contribution.guardian_id.clone());
            }
            db_err(e)
        })?;

        let mut status = session.status;
        if let Some(advance) = insert.advance {
            let rows = tx
                .execute(
                    "UPDATE signing_sessions SET status = ?3 WHERE id = ?1 AND status = ?2",
                    params![session_id, advance.from.as_str(), advance.to.as_str()],
                )
                .map_err(db_err)?;
            if rows > 0 {
                status = advance.to;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(status)
    }

    fn get_contributions_sync(&self, session_id: Uuid) -> Result<Vec<GuardianContribution>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT * FROM guardian_contributions WHERE session_id = ?1 ORDER BY id ASC")
            .map_err(db_err)?;

        let contributions = stmt
            .query_map(params![session_id.to_string()], Self::row_to_contribution)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(contributions)
    }

    fn expire_sessions_sync(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                r#"
            UPDATE signing_sessions SET status = 'expired'
            WHERE status NOT IN ('completed', 'failed', 'expired') AND expires_at <= ?1
            "#,
                params![to_millis(now)],
            )
            .map_err(db_err)?;

        Ok(rows as u64)
    }

    fn get_active_sync(&self) -> Result<Vec<SigningSession>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
            SELECT * FROM signing_sessions
            WHERE status NOT IN ('completed', 'failed', 'expired')
            ORDER BY created_at ASC
            "#,
            )
            .map_err(db_err)?;

        let sessions = stmt
            .query_map([], Self::row_to_session)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert_session(&self, session: &SigningSession) -> StorageResult<()> {
        self.insert_session_sync(session)
    }

    async fn get_session(&self, id: Uuid) -> StorageResult<Option<SigningSession>> {
        self.get_session_sync(id)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StorageResult<bool> {
        self.cas_sync(id, from, "status = ?3", &[&to.as_str()])
    }

    async fn complete_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        signature: &SchnorrSignature,
    ) -> StorageResult<bool> {
        self.cas_sync(
            id,
            from,
            "status = 'completed', signature_r = ?3, signature_s = ?4",
            &[&signature.r, &signature.s],
        )
    }

    async fn fail_session(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        reason: &str,
    ) -> StorageResult<bool> {
        self.cas_sync(
            id,
            from,
            "status = 'failed', failure_reason = ?3",
            &[&reason],
        )
    }

    async fn set_published_event_id(&self, id: Uuid, event_id: &str) -> StorageResult<()> {
        self.set_published_event_id_sync(id, event_id)
    }

    async fn insert_contribution(
        &self,
        insert: ContributionInsert<'_>,
    ) -> StorageResult<SessionStatus> {
        self.insert_contribution_sync(insert)
    }

    async fn get_contributions(&self, session_id: Uuid) -> StorageResult<Vec<GuardianContribution>> {
        self.get_contributions_sync(session_id)
    }

    async fn expire_sessions(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        self.expire_sessions_sync(now)
    }

    async fn get_active(&self) -> StorageResult<Vec<SigningSession>> {
        self.get_active_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateTransition;
    use crate::types::{ReconstructionReason, SigningMethod};

    fn create_test_session(now: DateTime<Utc>) -> SigningSession {
        SigningSession::new(
            SigningMethod::Frost,
            2,
            vec!["g1".into(), "g2".into(), "g3".into()],
            "cd".repeat(32),
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
        let store = SqliteSessionStore::in_memory().unwrap();
        let now = Utc::now();
        let mut session = create_test_session(now);
        session.method = SigningMethod::Sss;
        session.reason = Some(ReconstructionReason::KeyRotation);
        session.event_payload = Some(serde_json::json!({"id": "evt", "kind": 1}));

        store.insert_session(&session).await.unwrap();

        let retrieved = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(retrieved.method, SigningMethod::Sss);
        assert_eq!(retrieved.participants, session.participants);
        assert_eq!(retrieved.reason, Some(ReconstructionReason::KeyRotation));
        assert_eq!(retrieved.event_payload, session.event_payload);
        assert_eq!(retrieved.expires_at.timestamp_millis(), session.expires_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_duplicate_session() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = create_test_session(Utc::now());

        store.insert_session(&session).await.unwrap();
        let result = store.insert_session(&session).await;

        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_contribution_insert_and_advance() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let now = Utc::now();
        let session = create_test_session(now);
        store.insert_session(&session).await.unwrap();

        let c = GuardianContribution::nonce(session.id, "g1", "02aa", now);
        let status = store.insert_contribution(nonce_insert(&c, now)).await.unwrap();
        assert_eq!(status, SessionStatus::NonceCollection);

        let again = GuardianContribution::nonce(session.id, "g1", "02bb", now);
        let result = store.insert_contribution(nonce_insert(&again, now)).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));

        let contributions = store.get_contributions(session.id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].nonce_commitment.as_deref(), Some("02aa"));
    }

    #[tokio::test]
    async fn test_nonce_reuse_rejected() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let now = Utc::now();
        let a = create_test_session(now);
        let b = create_test_session(now);
        store.insert_session(&a).await.unwrap();
        store.insert_session(&b).await.unwrap();

        let first = GuardianContribution::nonce(a.id, "g1", "02aa", now);
        store.insert_contribution(nonce_insert(&first, now)).await.unwrap();
        let reused = GuardianContribution::nonce(b.id, "g2", "02aa", now);
        let result = store.insert_contribution(nonce_insert(&reused, now)).await;
        assert!(matches!(result, Err(StorageError::NonceReuse(_))));
        assert_eq!(
            store.get_session(b.id).await.unwrap().unwrap().status,
            SessionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cas_and_complete() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = create_test_session(Utc::now());
        store.insert_session(&session).await.unwrap();

        assert!(store
            .transition(session.id, &[SessionStatus::Pending], SessionStatus::Aggregating)
            .await
            .unwrap());
        let signature = SchnorrSignature {
            r: format!("02{}", "11".repeat(32)),
            s: "22".repeat(32),
        };
        assert!(store
            .complete_session(session.id, &[SessionStatus::Aggregating], &signature)
            .await
            .unwrap());
        assert!(!store
            .fail_session(session.id, &[SessionStatus::Aggregating], "late")
            .await
            .unwrap());

        let done = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.result_signature, Some(signature));

        store.set_published_event_id(session.id, "evt-1").await.unwrap();
        let published = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(published.published_event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_transition_unknown_session() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let result = store
            .transition(Uuid::new_v4(), &[SessionStatus::Pending], SessionStatus::Signing)
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expire_and_active() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let now = Utc::now();
        let session = create_test_session(now);
        store.insert_session(&session).await.unwrap();
        assert_eq!(store.get_active().await.unwrap().len(), 1);

        let later = now + chrono::Duration::minutes(10);
        assert_eq!(store.expire_sessions(later).await.unwrap(), 1);
        assert!(store.get_active().await.unwrap().is_empty());

        let c = GuardianContribution::nonce(session.id, "g1", "02aa", later);
        let result = store.insert_contribution(nonce_insert(&c, later)).await;
        assert!(matches!(result, Err(StorageError::Expired)));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let session = create_test_session(Utc::now());

        {
            let store = SqliteSessionStore::new(&path).unwrap();
            store.insert_session(&session).await.unwrap();
        }

        let reopened = SqliteSessionStore::new(&path).unwrap();
        assert!(reopened.get_session(session.id).await.unwrap().is_some());
    }
}
