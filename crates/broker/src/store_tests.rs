// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::model::{ResourceLimits, SessionStatus};

fn new_session(status: SessionStatus) -> Session {
    Session {
        id: SessionId::new_v4(),
        user_id: "user-1".to_owned(),
        image: "alpine:latest".to_owned(),
        status,
        container_ref: if status.has_container() { Some("c-1".to_owned()) } else { None },
        resource_limits: ResourceLimits::default(),
        created_at: 1_000,
        ready_at: if status.has_container() { Some(1_000) } else { None },
        last_activity_at: 1_000,
        detached_at: None,
        expires_at: None,
        metadata: BTreeMap::new(),
    }
}

#[test]
fn insert_and_get_round_trips() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("insert");

    let fetched = store.get(session.id).expect("get").expect("present");
    assert_eq!(fetched.id, session.id);
    assert_eq!(fetched.status, SessionStatus::Creating);
    assert!(fetched.invariants_hold());
}

#[test]
fn duplicate_insert_is_conflict() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("first insert");
    let err = store.insert_session(&session).expect_err("second insert should fail");
    assert_eq!(err.code, crate::error::ErrorCode::Conflict);
}

#[test]
fn update_status_cas_succeeds_on_matching_from() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("insert");

    let updated = store
        .update_status(session.id, SessionStatus::Creating, SessionStatus::Ready, 2_000)
        .expect("transition");
    assert_eq!(updated.status, SessionStatus::Ready);
    assert_eq!(updated.last_activity_at, 2_000);
}

#[test]
fn update_status_cas_fails_on_stale_from() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("insert");
    store
        .update_status(session.id, SessionStatus::Creating, SessionStatus::Ready, 2_000)
        .expect("first transition");

    let err = store
        .update_status(session.id, SessionStatus::Creating, SessionStatus::Ready, 3_000)
        .expect_err("stale CAS should fail");
    assert_eq!(err.code, crate::error::ErrorCode::StalePrecondition);
}

#[test]
fn update_status_on_missing_row_is_not_found() {
    let store = MetadataStore::open_in_memory().expect("open");
    let err = store
        .update_status(SessionId::new_v4(), SessionStatus::Creating, SessionStatus::Ready, 1_000)
        .expect_err("missing row should fail");
    assert_eq!(err.code, crate::error::ErrorCode::NotFound);
}

#[test]
fn update_status_rejects_illegal_edge() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("insert");

    let err = store
        .update_status(session.id, SessionStatus::Creating, SessionStatus::Attached, 2_000)
        .expect_err("illegal edge should fail");
    assert_eq!(err.code, crate::error::ErrorCode::BadRequest);
}

#[test]
fn expired_detached_lists_only_past_deadline() {
    let store = MetadataStore::open_in_memory().expect("open");
    let mut session = new_session(SessionStatus::Detached);
    session.detached_at = Some(1_000);
    session.expires_at = Some(1_500);
    store.insert_session(&session).expect("insert");

    assert!(store.expired_detached(1_000).expect("query").is_empty());
    let expired = store.expired_detached(2_000).expect("query");
    assert_eq!(expired, vec![session.id]);
}

#[test]
fn ready_past_grace_uses_ready_at_not_created_at() {
    let store = MetadataStore::open_in_memory().expect("open");
    let mut session = new_session(SessionStatus::Ready);
    session.created_at = 1_000;
    session.ready_at = None;
    store.insert_session(&session).expect("insert");

    // Provisioning took a while: ready_at lands well after created_at.
    store.mark_ready(session.id, 1_900).expect("mark ready");

    assert!(store.ready_past_grace(1_900).expect("query").is_empty());
    assert_eq!(store.ready_past_grace(2_000).expect("query"), vec![session.id]);
}

#[test]
fn clear_detached_resets_both_fields() {
    let store = MetadataStore::open_in_memory().expect("open");
    let mut session = new_session(SessionStatus::Detached);
    session.detached_at = Some(1_000);
    session.expires_at = Some(1_500);
    store.insert_session(&session).expect("insert");

    store.clear_detached(session.id).expect("clear");

    let row = store.get(session.id).expect("query").expect("row");
    assert!(row.detached_at.is_none());
    assert!(row.expires_at.is_none());
}

#[test]
fn rate_limit_increments_within_window() {
    let store = MetadataStore::open_in_memory().expect("open");
    assert_eq!(store.incr_rate("user-1", "create", 0).expect("incr"), 1);
    assert_eq!(store.incr_rate("user-1", "create", 0).expect("incr"), 2);
    assert_eq!(store.incr_rate("user-1", "create", 60).expect("incr"), 1);
}

#[test]
fn audit_log_round_trips_and_counts() {
    let store = MetadataStore::open_in_memory().expect("open");
    let session = new_session(SessionStatus::Creating);
    store.insert_session(&session).expect("insert");

    store
        .append_audit(Some(session.id), &session.user_id, AuditKind::SessionCreate, serde_json::json!({}), 1_000)
        .expect("append");
    assert_eq!(store.count_audit(session.id, AuditKind::SessionCreate).expect("count"), 1);
    assert_eq!(store.count_audit(session.id, AuditKind::SessionTerminate).expect("count"), 0);
}

#[test]
fn gc_retention_removes_stale_rows_only() {
    let store = MetadataStore::open_in_memory().expect("open");
    store
        .append_audit(None, "user-1", AuditKind::SessionCreate, serde_json::json!({}), 0)
        .expect("append old");
    store
        .append_audit(None, "user-1", AuditKind::SessionCreate, serde_json::json!({}), 100_000)
        .expect("append recent");
    store.incr_rate("user-1", "create", 0).expect("rate");

    store.gc_retention(100_000).expect("gc");

    assert_eq!(
        store.count_audit(SessionId::new_v4(), AuditKind::SessionCreate).expect("count"),
        0
    );
}

#[test]
fn list_by_statuses_filters_correctly() {
    let store = MetadataStore::open_in_memory().expect("open");
    let creating = new_session(SessionStatus::Creating);
    let ready = new_session(SessionStatus::Ready);
    store.insert_session(&creating).expect("insert");
    store.insert_session(&ready).expect("insert");

    let rows = store.list_by_statuses(&[SessionStatus::Creating]).expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, creating.id);
}

#[test]
fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("termbroker.db");
    let session = new_session(SessionStatus::Ready);

    {
        let store = MetadataStore::open(&db_path).expect("open");
        store.insert_session(&session).expect("insert");
    }

    let store = MetadataStore::open(&db_path).expect("reopen");
    let fetched = store.get(session.id).expect("get").expect("present");
    assert_eq!(fetched.status, SessionStatus::Ready);
    assert_eq!(fetched.container_ref.as_deref(), Some("c-1"));
}
