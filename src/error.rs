use thiserror::Error;

use crate::session::SessionStatus;
use crate::topology::ChannelId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by `Session` and `Channel` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected before any network activity.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No configured host accepted the connection. Carries the last error seen.
    #[error("connection refused: {0}")]
    ConnectionRefused(TransportError),
    /// The broker rejected the credentials.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    /// Operation attempted while the session is not connected.
    #[error("not connected (session is {0})")]
    NotConnected(SessionStatus),
    /// Every recovery attempt was exhausted.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
    /// `close()` was called while a recovery was in progress.
    #[error("recovery aborted: session was closed")]
    RecoveryAborted,
    /// Operation attempted on a channel that was closed.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    /// All channel numbers are in use.
    #[error("channel limit of {0} reached")]
    ChannelLimit(ChannelId),
    /// Channel-level refusal from the broker (unknown queue, precondition
    /// failed, exclusive queue locked, ...).
    #[error("broker error: {0}")]
    Broker(String),
}

/// Errors reported by the broker transport collaborator.
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Nothing is listening at the endpoint, or the name does not resolve.
    #[error("connection to {0} refused")]
    Refused(String),
    /// The endpoint did not answer within the connection timeout.
    #[error("connection to {0} timed out")]
    Timeout(String),
    /// Credentials rejected during the handshake.
    #[error("access refused: {0}")]
    AccessRefused(String),
    /// The broker refused a channel-level operation; the link is still up.
    #[error("channel error: {0}")]
    Channel(String),
    /// The link is gone.
    #[error("connection closed: {0}")]
    Closed(String),
    /// Nothing was received from the peer for too long.
    #[error("missed heartbeats from {0}")]
    MissedHeartbeats(String),
}

impl TransportError {
    /// Whether the error means the transport itself is unusable, as opposed
    /// to a refusal scoped to a single operation.
    pub fn is_link_failure(&self) -> bool {
        !matches!(
            self,
            TransportError::Channel(_) | TransportError::AccessRefused(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_are_not_link_failures() {
        assert!(!TransportError::Channel("NOT_FOUND".into()).is_link_failure());
        assert!(TransportError::Closed("reset".into()).is_link_failure());
        assert!(TransportError::MissedHeartbeats("h".into()).is_link_failure());
    }

    #[test]
    fn connection_refused_display_carries_cause() {
        let err = Error::ConnectionRefused(TransportError::Refused("nowhere:5672".into()));
        let display = err.to_string();
        assert!(display.contains("connection refused"));
        assert!(display.contains("nowhere:5672"));
    }
}
