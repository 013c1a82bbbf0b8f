// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use super::*;

fn parse(args: &[&str]) -> Config {
    let mut full = vec!["termbroker"];
    full.extend_from_slice(args);
    Config::parse_from(full)
}

#[test]
fn defaults_validate_cleanly() {
    let config = parse(&[]);
    assert_eq!(config.port, 8080);
    assert_eq!(config.session_idle_ttl_secs, 600);
    config.validate().expect("defaults should validate");
}

#[test]
fn zero_port_is_rejected() {
    let config = parse(&["--port", "0"]);
    assert!(config.validate().is_err());
}

#[test]
fn default_allowlist_matches_spec() {
    let config = parse(&[]);
    let allowlist = config.image_allowlist();
    assert!(config.image_allowed("alpine:latest"));
    assert!(config.image_allowed("ubuntu:22.04"));
    assert!(!config.image_allowed("privileged:latest"));
    assert_eq!(allowlist.len(), DEFAULT_IMAGE_ALLOWLIST.len());
}

#[test]
fn custom_allowlist_overrides_default() {
    let config = parse(&["--image-allowlist", "busybox:latest, alpine:latest"]);
    assert!(config.image_allowed("busybox:latest"));
    assert!(config.image_allowed("alpine:latest"));
    assert!(!config.image_allowed("ubuntu:22.04"));
}

#[test]
fn empty_allowlist_fails_validation() {
    let config = parse(&["--image-allowlist", "  ,  "]);
    assert!(config.validate().is_err());
}

#[test]
fn invalid_container_runtime_fails_validation() {
    let config = parse(&["--container-runtime", "kubernetes"]);
    assert!(config.validate().is_err());
}

#[test]
fn fake_runtime_is_detected() {
    let config = parse(&["--container-runtime", "fake"]);
    assert!(config.uses_fake_runtime());
    let config = parse(&[]);
    assert!(!config.uses_fake_runtime());
}

#[test]
fn anon_proxy_argv_substitutes_port() {
    let config = parse(&["--anon-proxy-cmd", "anon --socks-port {port} --quiet", "--anon-socks-port", "9999"]);
    assert_eq!(config.anon_proxy_argv(), vec!["anon", "--socks-port", "9999", "--quiet"]);
}

#[test]
fn max_sessions_per_user_defaults_to_five() {
    let config = parse(&[]);
    assert_eq!(config.max_sessions_per_user, 5);
}
