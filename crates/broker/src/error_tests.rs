// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn http_status_matches_error_kind_design() {
    assert_eq!(ErrorCode::BadRequest.http_status(), 400);
    assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    assert_eq!(ErrorCode::RuntimeUnavailable.http_status(), 503);
}

#[test]
fn ws_close_code_groups_conflicts_as_not_attachable() {
    assert_eq!(ErrorCode::Conflict.ws_close_code(), 4003);
    assert_eq!(ErrorCode::NotFound.ws_close_code(), 4003);
    assert_eq!(ErrorCode::StalePrecondition.ws_close_code(), 4003);
}

#[test]
fn display_matches_as_str() {
    assert_eq!(ErrorCode::Internal.to_string(), "INTERNAL");
}

#[test]
fn error_body_carries_code_and_message() {
    let body = ErrorCode::NotFound.to_error_body("session not found");
    assert_eq!(body.code, "NOT_FOUND");
    assert_eq!(body.message, "session not found");
}

#[test]
fn broker_error_display_includes_code_and_message() {
    let err = BrokerError::not_found("no such session");
    assert_eq!(err.to_string(), "NOT_FOUND: no such session");
}

#[test]
fn broker_error_constructors_set_expected_codes() {
    assert_eq!(BrokerError::conflict("x").code, ErrorCode::Conflict);
    assert_eq!(BrokerError::bad_request("x").code, ErrorCode::BadRequest);
    assert_eq!(BrokerError::stale_precondition("x").code, ErrorCode::StalePrecondition);
    assert_eq!(BrokerError::runtime_unavailable("x").code, ErrorCode::RuntimeUnavailable);
    assert_eq!(BrokerError::internal("x").code, ErrorCode::Internal);
}
