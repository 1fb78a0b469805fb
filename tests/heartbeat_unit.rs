//! Unit tests for heartbeat negotiation and the missed-heartbeat watchdog.

use std::time::Duration;
use warren::heartbeat::{is_overdue, negotiate_heartbeat, send_interval};

// =============================================================================
// negotiate_heartbeat tests
// =============================================================================

#[test]
fn negotiate_both_zero_disables() {
    assert!(negotiate_heartbeat(0, 0).is_none());
}

#[test]
fn negotiate_client_zero_disables_even_if_server_wants_it() {
    assert!(negotiate_heartbeat(0, 60).is_none());
}

#[test]
fn negotiate_server_zero_uses_client_value() {
    assert_eq!(negotiate_heartbeat(10, 0), Some(Duration::from_secs(10)));
}

#[test]
fn negotiate_takes_lower_of_two() {
    assert_eq!(negotiate_heartbeat(10, 60), Some(Duration::from_secs(10)));
    assert_eq!(negotiate_heartbeat(120, 60), Some(Duration::from_secs(60)));
}

#[test]
fn negotiate_equal_values() {
    assert_eq!(negotiate_heartbeat(30, 30), Some(Duration::from_secs(30)));
}

#[test]
fn negotiate_max_value() {
    assert_eq!(
        negotiate_heartbeat(u16::MAX, u16::MAX),
        Some(Duration::from_secs(u64::from(u16::MAX)))
    );
}

// =============================================================================
// send_interval / is_overdue tests
// =============================================================================

#[test]
fn heartbeats_are_sent_twice_per_interval() {
    assert_eq!(send_interval(Duration::from_secs(10)), Duration::from_secs(5));
    assert_eq!(send_interval(Duration::from_secs(1)), Duration::from_millis(500));
}

#[test]
fn not_overdue_within_two_intervals() {
    let hb = Duration::from_secs(10);
    assert!(!is_overdue(1_000, 1_000, hb));
    assert!(!is_overdue(1_000, 11_000, hb));
    assert!(!is_overdue(1_000, 21_000, hb)); // exactly 2x is still fine
}

#[test]
fn overdue_after_two_intervals() {
    let hb = Duration::from_secs(10);
    assert!(is_overdue(1_000, 21_001, hb));
    assert!(is_overdue(0, 60_000, hb));
}

#[test]
fn clock_going_backwards_is_not_overdue() {
    assert!(!is_overdue(50_000, 10_000, Duration::from_secs(1)));
}
