use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Negotiate the heartbeat interval between client and broker.
///
/// Parameters
/// - `client_secs`: interval requested by the client, in seconds. `0`
///   disables heartbeats regardless of what the broker proposes.
/// - `server_secs`: interval proposed by the broker, in seconds. `0` means the
///   broker has no preference.
///
/// Returns `Some(Duration)` with the lower of the two non-zero values, or
/// `None` when heartbeats are disabled.
pub fn negotiate_heartbeat(client_secs: u16, server_secs: u16) -> Option<Duration> {
    let negotiated = match (client_secs, server_secs) {
        (0, _) => 0,
        (c, 0) => c,
        (c, s) => std::cmp::min(c, s),
    };
    if negotiated == 0 {
        None
    } else {
        Some(Duration::from_secs(u64::from(negotiated)))
    }
}

/// How often a heartbeat is sent for a negotiated interval: twice per period.
pub fn send_interval(negotiated: Duration) -> Duration {
    negotiated / 2
}

/// Whether the peer has been silent for longer than two negotiated intervals.
///
/// Parameters
/// - `last_received_ms`: wall-clock millis of the last inbound traffic.
/// - `now_ms`: current wall-clock millis.
/// - `negotiated`: the negotiated heartbeat interval.
pub fn is_overdue(last_received_ms: u64, now_ms: u64, negotiated: Duration) -> bool {
    now_ms.saturating_sub(last_received_ms) > negotiated.as_millis() as u64 * 2
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
