//! Tests for constants module.
//!
//! Validates that timing bounds, default modes, and the container ID rules
//! have the values the run engine relies on.

use magikbuild::constants::*;
use std::time::Duration;

// =============================================================================
// Timing Tests
// =============================================================================

#[test]
fn test_state_poll_interval_reasonable() {
    assert!(
        STATE_POLL_INTERVAL >= Duration::from_millis(10),
        "state polling too aggressive"
    );
    assert!(
        STATE_POLL_INTERVAL <= Duration::from_secs(1),
        "state polling too slow to notice exits"
    );
}

#[test]
fn test_handshake_timeout_is_four_minutes() {
    assert_eq!(HANDSHAKE_TIMEOUT, Duration::from_secs(240));
}

#[test]
fn test_reap_grace_exceeds_poll_interval() {
    assert!(
        REAP_GRACE_PERIOD > STATE_POLL_INTERVAL * 10,
        "reap grace should cover many poll intervals"
    );
}

// =============================================================================
// Relay Buffer Tests
// =============================================================================

#[test]
fn test_relay_buffer_bounds_ordered() {
    assert!(RELAY_READ_SIZE > 0, "read size must be positive");
    assert!(
        MAX_RELAY_BUFFER >= RELAY_READ_SIZE,
        "buffer must hold at least one read"
    );
}

// =============================================================================
// Default Mode Tests
// =============================================================================

#[test]
fn test_secret_mode_is_owner_read_only() {
    assert_eq!(DEFAULT_SECRET_MODE, 0o400);
    assert_eq!(DEFAULT_SECRET_MODE & 0o077, 0, "secrets must not be group/world readable");
}

#[test]
fn test_default_mount_locations() {
    assert_eq!(SECRETS_MOUNT_DIR, "/run/secrets");
    assert_eq!(SSH_AGENT_MOUNT_DIR, "/run/buildkit");
    assert_eq!(DEFAULT_SSH_ID, "default");
}

#[test]
fn test_cache_dir_id_length() {
    assert_eq!(CACHE_DIR_ID_LEN, 16);
    assert_eq!(magikbuild::mounts::cache::cache_dir_id("/cache").len(), CACHE_DIR_ID_LEN);
}

#[test]
fn test_child_descriptors_below_staging_range() {
    for fd in [CHILD_CONFIG_FD, CHILD_CREATED_FD, CHILD_START_FD] {
        assert!(fd > 2, "child descriptors must not clobber stdio");
        assert!(fd < CHILD_FD_STAGING_MIN, "staging range must not overlap targets");
    }
}

// =============================================================================
// Container ID Validation Tests
// =============================================================================

#[test]
fn test_valid_container_ids() {
    for id in ["build-1", "a", "stage_2.step", "ABC123"] {
        assert!(validate_container_id(id).is_ok(), "{id} should be valid");
    }
}

#[test]
fn test_invalid_container_ids() {
    assert!(validate_container_id("").is_err(), "empty should be rejected");
    assert!(validate_container_id(".hidden").is_err(), "leading dot should be rejected");
    assert!(validate_container_id("a/b").is_err(), "slash should be rejected");
    assert!(validate_container_id("with space").is_err(), "space should be rejected");
    let long = "x".repeat(MAX_CONTAINER_ID_LEN + 1);
    assert!(validate_container_id(&long).is_err(), "overlong should be rejected");
    let max = "x".repeat(MAX_CONTAINER_ID_LEN);
    assert!(validate_container_id(&max).is_ok(), "maximum length should be accepted");
}

#[test]
fn test_default_runtimes_search_order() {
    assert_eq!(DEFAULT_RUNTIMES, &["crun", "runc"]);
}
