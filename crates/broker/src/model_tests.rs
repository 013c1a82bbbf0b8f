// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::*;

fn base_session(status: SessionStatus) -> Session {
    Session {
        id: Uuid::nil(),
        user_id: "alice".to_owned(),
        image: "alpine:latest".to_owned(),
        status,
        container_ref: None,
        resource_limits: ResourceLimits::default(),
        created_at: 0,
        ready_at: None,
        last_activity_at: 0,
        detached_at: None,
        expires_at: None,
        metadata: BTreeMap::new(),
    }
}

#[test]
fn creating_has_no_container_ref() {
    let s = base_session(SessionStatus::Creating);
    assert!(s.invariants_hold());
}

#[test]
fn ready_without_container_ref_violates_invariant() {
    let s = base_session(SessionStatus::Ready);
    assert!(!s.invariants_hold());
}

#[test]
fn ready_with_container_ref_holds() {
    let mut s = base_session(SessionStatus::Ready);
    s.container_ref = Some("abc123".to_owned());
    assert!(s.invariants_hold());
}

#[test]
fn expires_at_must_be_after_detached_at() {
    let mut s = base_session(SessionStatus::Detached);
    s.container_ref = Some("abc123".to_owned());
    s.detached_at = Some(100);
    s.expires_at = Some(50);
    assert!(!s.invariants_hold());

    s.expires_at = Some(150);
    assert!(s.invariants_hold());
}

#[test]
fn expires_at_without_detached_at_violates_invariant() {
    let mut s = base_session(SessionStatus::Detached);
    s.container_ref = Some("abc123".to_owned());
    s.expires_at = Some(150);
    assert!(!s.invariants_hold());
}

#[test]
fn legal_transitions_match_dag() {
    use SessionStatus::*;
    assert!(Creating.can_transition_to(Ready));
    assert!(Creating.can_transition_to(Failed));
    assert!(Ready.can_transition_to(Attached));
    assert!(Attached.can_transition_to(Detached));
    assert!(Detached.can_transition_to(Attached));
    assert!(Detached.can_transition_to(Terminating));
    assert!(Attached.can_transition_to(Terminating));
    assert!(Ready.can_transition_to(Terminating));
    assert!(Terminating.can_transition_to(Terminated));
    assert!(Failed.can_transition_to(Terminated));
}

#[test]
fn illegal_transitions_are_rejected() {
    use SessionStatus::*;
    assert!(!Ready.can_transition_to(Terminated));
    assert!(!Terminated.can_transition_to(Ready));
    assert!(!Creating.can_transition_to(Attached));
    assert!(!Failed.can_transition_to(Ready));
}

#[test]
fn status_round_trips_through_str() {
    for status in
        [
            SessionStatus::Creating,
            SessionStatus::Ready,
            SessionStatus::Attached,
            SessionStatus::Detached,
            SessionStatus::Terminating,
            SessionStatus::Terminated,
            SessionStatus::Failed,
        ]
    {
        assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
    }
}

const ALL_STATUSES: [SessionStatus; 7] = [
    SessionStatus::Creating,
    SessionStatus::Ready,
    SessionStatus::Attached,
    SessionStatus::Detached,
    SessionStatus::Terminating,
    SessionStatus::Terminated,
    SessionStatus::Failed,
];

proptest! {
    /// Drive the DAG with an arbitrary sequence of attempted next-states
    /// (most of which are illegal from wherever the walk currently sits) and
    /// only apply the move when `can_transition_to` allows it. Whatever path
    /// results must still honor the shape of §4.4's DAG: `Terminated` is a
    /// sink, and it is only ever entered from `Terminating` or `Failed`.
    #[test]
    fn prop_arbitrary_event_ordering_only_walks_legal_dag_edges(
        attempts in prop::collection::vec(0usize..ALL_STATUSES.len(), 1..128)
    ) {
        let mut current = SessionStatus::Creating;
        let mut history = vec![current];

        for idx in attempts {
            let candidate = ALL_STATUSES[idx];
            if current.can_transition_to(candidate) {
                current = candidate;
                history.push(current);
            }
        }

        if let Some(first_terminated) = history.iter().position(|s| *s == SessionStatus::Terminated) {
            prop_assert!(first_terminated > 0);
            let predecessor = history[first_terminated - 1];
            prop_assert!(matches!(predecessor, SessionStatus::Terminating | SessionStatus::Failed));
        }

        // Terminated is a sink: no legal edge ever leaves it, so once the walk
        // lands there every remaining attempt is a no-op and it stays last.
        if current == SessionStatus::Terminated {
            for target in ALL_STATUSES {
                prop_assert!(!current.can_transition_to(target));
            }
            prop_assert_eq!(*history.last().expect("non-empty"), SessionStatus::Terminated);
        }
    }
}
