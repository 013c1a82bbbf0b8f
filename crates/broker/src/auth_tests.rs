// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::HeaderMap;

use crate::auth::{validate_bearer, validate_token};
use crate::error::ErrorCode;

#[test]
fn no_expected_token_allows_everything() {
    assert!(validate_token(None, None).is_ok());
    assert!(validate_token(Some("anything"), None).is_ok());
}

#[test]
fn matching_token_passes() {
    assert!(validate_token(Some("secret123"), Some("secret123")).is_ok());
}

#[test]
fn mismatched_or_missing_token_is_unauthorized() {
    assert_eq!(validate_token(Some("wrong"), Some("secret123")), Err(ErrorCode::Unauthorized));
    assert_eq!(validate_token(None, Some("secret123")), Err(ErrorCode::Unauthorized));
}

#[test]
fn bearer_header_valid() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret123".parse().expect("header value"));
    assert!(validate_bearer(&headers, Some("secret123")).is_ok());
}

#[test]
fn bearer_header_wrong_scheme_is_unauthorized() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().expect("header value"));
    assert_eq!(validate_bearer(&headers, Some("secret123")), Err(ErrorCode::Unauthorized));
}

#[test]
fn bearer_header_missing_is_unauthorized() {
    let headers = HeaderMap::new();
    assert_eq!(validate_bearer(&headers, Some("secret123")), Err(ErrorCode::Unauthorized));
}

#[test]
fn no_expected_token_skips_header_check_entirely() {
    let headers = HeaderMap::new();
    assert!(validate_bearer(&headers, None).is_ok());
}
