// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Metadata Store (MS) — §4.2.
//!
//! Backed by SQLite opened in WAL journal mode. All operations are
//! synchronous rusqlite calls behind a `std::sync::Mutex`; the store is
//! queried far less often than the PTY Bridge moves bytes, so a single
//! connection guarded by a mutex is simpler than a pool and never becomes
//! the bottleneck the spec worries about (§5's "MS is the only shared
//! authoritative state").

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::BrokerError;
use crate::model::{
    AnonymityState, AuditEvent, AuditKind, ResourceLimits, Session, SessionId, SessionStatus,
};

/// SQLite-backed implementation of the Metadata Store, per §4.2.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (creating if absent) the database at `path` and run the schema.
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let conn = Connection::open(path).map_err(|e| BrokerError::internal(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(BrokerError::from)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(BrokerError::from)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an ephemeral in-memory database, used by unit tests and the
    /// `fake` container-runtime test profile.
    pub fn open_in_memory() -> Result<Self, BrokerError> {
        let conn = Connection::open_in_memory().map_err(|e| BrokerError::internal(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                image            TEXT NOT NULL,
                status           TEXT NOT NULL,
                container_ref    TEXT,
                memory_bytes     INTEGER NOT NULL,
                cpu_shares       INTEGER NOT NULL,
                pids_max         INTEGER NOT NULL,
                created_at       INTEGER NOT NULL,
                ready_at         INTEGER,
                last_activity_at INTEGER NOT NULL,
                detached_at      INTEGER,
                expires_at       INTEGER,
                metadata         TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at
                ON sessions(expires_at) WHERE expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS audit_logs (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT,
                user_id     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at);

            CREATE TABLE IF NOT EXISTS security_events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT,
                user_id     TEXT NOT NULL,
                reason      TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                identifier   TEXT NOT NULL,
                endpoint     TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                count        INTEGER NOT NULL,
                PRIMARY KEY (identifier, endpoint, window_start)
            );

            CREATE TABLE IF NOT EXISTS container_metrics (
                session_id  TEXT NOT NULL,
                sampled_at  INTEGER NOT NULL,
                cpu_percent REAL,
                memory_bytes INTEGER
            );
            "#,
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    pub fn insert_session(&self, record: &Session) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let metadata = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".into());
        let result = conn.execute(
            "INSERT INTO sessions \
                (id, user_id, image, status, container_ref, memory_bytes, cpu_shares, pids_max, \
                 created_at, ready_at, last_activity_at, detached_at, expires_at, metadata) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                record.id.to_string(),
                record.user_id,
                record.image,
                record.status.as_str(),
                record.container_ref,
                record.resource_limits.memory_bytes,
                record.resource_limits.cpu_shares,
                record.resource_limits.pids_max,
                record.created_at,
                record.ready_at,
                record.last_activity_at,
                record.detached_at,
                record.expires_at,
                metadata,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(BrokerError::conflict(format!("session {} already exists", record.id)))
            }
            Err(e) => Err(BrokerError::from(e)),
        }
    }

    pub fn get(&self, id: SessionId) -> Result<Option<Session>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row("SELECT * FROM sessions WHERE id = ?1", params![id.to_string()], row_to_session)
            .optional()
            .map_err(BrokerError::from)?;
        Ok(row)
    }

    /// Compare-and-set status transition, per §4.2/§4.4. Fails
    /// `StalePrecondition` if the row isn't currently in `from`, or
    /// `NotFound` if the row doesn't exist.
    pub fn update_status(
        &self,
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        now: i64,
    ) -> Result<Session, BrokerError> {
        if !from.can_transition_to(to) {
            return Err(BrokerError::bad_request(format!("illegal transition {from} -> {to}")));
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn
            .execute(
                "UPDATE sessions SET status = ?1, last_activity_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id.to_string(), from.as_str()],
            )
            .map_err(BrokerError::from)?;
        if updated == 0 {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![id.to_string()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(BrokerError::from)?;
            return match exists {
                Some(()) => Err(BrokerError::stale_precondition(format!(
                    "session {id} is not in state {from}"
                ))),
                None => Err(BrokerError::not_found(format!("session {id} not found"))),
            };
        }
        drop(conn);
        self.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))
    }

    /// Unconditional status write used only by crash-recovery reconciliation
    /// (§4.4), which moves rows out of DAG edges the normal CAS path doesn't
    /// cover (e.g. a crashed `Terminating` row resolving back to `Detached`).
    pub fn force_set_status(
        &self,
        id: SessionId,
        to: SessionStatus,
        detached_at: Option<i64>,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET status = ?1, detached_at = ?2, expires_at = ?3, last_activity_at = ?4 \
             WHERE id = ?5",
            params![to.as_str(), detached_at, expires_at, now, id.to_string()],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Set `container_ref`, used once on `Creating -> Ready`.
    pub fn set_container_ref(&self, id: SessionId, container_ref: &str) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET container_ref = ?1 WHERE id = ?2",
            params![container_ref, id.to_string()],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    pub fn clear_container_ref(&self, id: SessionId) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("UPDATE sessions SET container_ref = NULL WHERE id = ?1", params![id.to_string()])
            .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Set `detached_at`/`expires_at`, used on `Attached -> Detached`.
    pub fn set_detached(&self, id: SessionId, detached_at: i64, expires_at: i64) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET detached_at = ?1, expires_at = ?2 WHERE id = ?3",
            params![detached_at, expires_at, id.to_string()],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Set `ready_at`, used once on `Creating -> Ready` — the attach-grace
    /// deadline in [`Self::ready_past_grace`] is measured from this, not
    /// `created_at`, so provisioning time doesn't eat into the grace budget.
    pub fn mark_ready(&self, id: SessionId, ready_at: i64) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("UPDATE sessions SET ready_at = ?1 WHERE id = ?2", params![ready_at, id.to_string()])
            .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Clear `detached_at`/`expires_at`, used on `Detached -> Attached`.
    pub fn clear_detached(&self, id: SessionId) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET detached_at = NULL, expires_at = NULL WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Unconditional `last_activity_at` touch, per §4.2 — called on every
    /// PTY Bridge I/O event, not gated by a CAS.
    pub fn touch(&self, id: SessionId, now: i64) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2", params![now, id.to_string()])
            .map_err(BrokerError::from)?;
        Ok(())
    }

    pub fn list_by_user(&self, user_id: &str, limit: u32) -> Result<Vec<Session>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(BrokerError::from)?;
        let rows = stmt
            .query_map(params![user_id, limit], row_to_session)
            .map_err(BrokerError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)?;
        Ok(rows)
    }

    /// All rows in one of `statuses`, used by crash-recovery reconciliation.
    pub fn list_by_statuses(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM sessions WHERE status IN ({placeholders})");
        let mut stmt = conn.prepare(&sql).map_err(BrokerError::from)?;
        let params: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), row_to_session)
            .map_err(BrokerError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)?;
        Ok(rows)
    }

    /// `Detached` sessions whose `expires_at` has passed, per §4.2.
    pub fn expired_detached(&self, now: i64) -> Result<Vec<SessionId>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT id FROM sessions WHERE status = 'Detached' AND expires_at < ?1")
            .map_err(BrokerError::from)?;
        let rows = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))
            .map_err(BrokerError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)?;
        Ok(rows.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// `Ready` sessions that passed their attach grace deadline, measured
    /// from `ready_at` (when the row entered `Ready`), not `created_at`
    /// (when provisioning started) — see [`Self::mark_ready`].
    pub fn ready_past_grace(&self, deadline_ready_before: i64) -> Result<Vec<SessionId>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT id FROM sessions WHERE status = 'Ready' AND ready_at < ?1")
            .map_err(BrokerError::from)?;
        let rows = stmt
            .query_map(params![deadline_ready_before], |row| row.get::<_, String>(0))
            .map_err(BrokerError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)?;
        Ok(rows.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub fn delete(&self, id: SessionId) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])
            .map_err(BrokerError::from)?;
        Ok(())
    }

    /// `Terminated` rows whose audit-visibility grace window has elapsed.
    pub fn terminated_past_grace(&self, grace_deadline: i64) -> Result<Vec<SessionId>, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT id FROM sessions WHERE status = 'Terminated' AND last_activity_at < ?1")
            .map_err(BrokerError::from)?;
        let rows = stmt
            .query_map(params![grace_deadline], |row| row.get::<_, String>(0))
            .map_err(BrokerError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)?;
        Ok(rows.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub fn append_audit(
        &self,
        session_id: Option<SessionId>,
        user_id: &str,
        kind: AuditKind,
        payload: serde_json::Value,
        now: i64,
    ) -> Result<AuditEvent, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let payload_text = payload.to_string();
        conn.execute(
            "INSERT INTO audit_logs (session_id, user_id, kind, payload, created_at) \
             VALUES (?1,?2,?3,?4,?5)",
            params![session_id.map(|s| s.to_string()), user_id, kind.as_str(), payload_text, now],
        )
        .map_err(BrokerError::from)?;
        let seq = conn.last_insert_rowid();
        Ok(AuditEvent { seq, session_id, user_id: user_id.to_owned(), kind, payload, created_at: now })
    }

    pub fn append_security(
        &self,
        session_id: Option<SessionId>,
        user_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO security_events (session_id, user_id, reason, created_at) VALUES (?1,?2,?3,?4)",
            params![session_id.map(|s| s.to_string()), user_id, reason, now],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Count of `kind` audit rows ever written for `session_id` — used by
    /// tests asserting §8 invariant 1 (create/terminate pairing).
    pub fn count_audit(&self, session_id: SessionId, kind: AuditKind) -> Result<u64, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE session_id = ?1 AND kind = ?2",
                params![session_id.to_string(), kind.as_str()],
                |row| row.get(0),
            )
            .map_err(BrokerError::from)?;
        Ok(count as u64)
    }

    /// Atomic upsert-and-increment for the per-`(identifier, endpoint, window)`
    /// rate-limit counter, per §5's "atomic upsert at the store layer".
    pub fn incr_rate(&self, identifier: &str, endpoint: &str, window_start: i64) -> Result<u32, BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO rate_limits (identifier, endpoint, window_start, count) VALUES (?1,?2,?3,1) \
             ON CONFLICT(identifier, endpoint, window_start) DO UPDATE SET count = count + 1",
            params![identifier, endpoint, window_start],
        )
        .map_err(BrokerError::from)?;
        let count: i64 = conn
            .query_row(
                "SELECT count FROM rate_limits WHERE identifier = ?1 AND endpoint = ?2 AND window_start = ?3",
                params![identifier, endpoint, window_start],
                |row| row.get(0),
            )
            .map_err(BrokerError::from)?;
        Ok(count as u32)
    }

    /// Optional `container_metrics` emission, gated by `--metrics-enabled`.
    pub fn record_metric(
        &self,
        session_id: SessionId,
        sampled_at: i64,
        cpu_percent: Option<f64>,
        memory_bytes: Option<i64>,
    ) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO container_metrics (session_id, sampled_at, cpu_percent, memory_bytes) \
             VALUES (?1,?2,?3,?4)",
            params![session_id.to_string(), sampled_at, cpu_percent, memory_bytes],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }

    /// Retention GC, per §4.2: audit/security/metric rows older than 24h,
    /// rate-limit windows older than 1h.
    pub fn gc_retention(&self, now: i64) -> Result<(), BrokerError> {
        const AUDIT_RETENTION_SECS: i64 = 24 * 3600;
        const RATE_RETENTION_SECS: i64 = 3600;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM audit_logs WHERE created_at < ?1", params![now - AUDIT_RETENTION_SECS])
            .map_err(BrokerError::from)?;
        conn.execute(
            "DELETE FROM security_events WHERE created_at < ?1",
            params![now - AUDIT_RETENTION_SECS],
        )
        .map_err(BrokerError::from)?;
        conn.execute(
            "DELETE FROM container_metrics WHERE sampled_at < ?1",
            params![now - AUDIT_RETENTION_SECS],
        )
        .map_err(BrokerError::from)?;
        conn.execute(
            "DELETE FROM rate_limits WHERE window_start < ?1",
            params![now - RATE_RETENTION_SECS],
        )
        .map_err(BrokerError::from)?;
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(Session {
        id: id.parse().unwrap_or_default(),
        user_id: row.get("user_id")?,
        image: row.get("image")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        container_ref: row.get("container_ref")?,
        resource_limits: ResourceLimits {
            memory_bytes: row.get::<_, i64>("memory_bytes")? as u64,
            cpu_shares: row.get::<_, i64>("cpu_shares")? as u32,
            pids_max: row.get::<_, i64>("pids_max")? as u32,
        },
        created_at: row.get("created_at")?,
        ready_at: row.get("ready_at")?,
        last_activity_at: row.get("last_activity_at")?,
        detached_at: row.get("detached_at")?,
        expires_at: row.get("expires_at")?,
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata).unwrap_or_default(),
    })
}

/// Process-wide [`AnonymityState`] guarded by a mutex, per §5 — enable/disable
/// take the lock; `status()` reads are meant to be lock-free against a
/// memory-ordered snapshot, which [`crate::aes::AnonymitySupervisor`] provides
/// on top of this store via its own atomics rather than re-reading SQLite.
pub struct AnonymityRow;

impl AnonymityRow {
    pub fn default_state(listen_port: u16) -> AnonymityState {
        AnonymityState { enabled: false, listen_port, pid: None, started_at: None }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
