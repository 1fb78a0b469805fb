use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;
use tracing::{error, warn};

use crate::error::{Error, TransportError};
use crate::topology::ChannelId;
use crate::transport::Delivery;

/// Boxed error type returned by delivery handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a consumer handler failed.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("consumer handler failed: {0}")]
    Failed(BoxError),
    /// The handler panicked.
    #[error("consumer handler panicked: {0}")]
    Panicked(String),
}

/// Receives deliveries for one consumer.
///
/// Implemented for any `Fn(Delivery) -> Result<(), BoxError>` closure.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn handle(&self, delivery: Delivery) -> Result<(), BoxError>;
}

impl<F> DeliveryHandler for F
where
    F: Fn(Delivery) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn handle(&self, delivery: Delivery) -> Result<(), BoxError> {
        self(delivery)
    }
}

/// Callbacks for failures that are never propagated to the caller.
///
/// Only `handle_consumer_error` is required; the other hooks log by default.
pub trait ExceptionHandler: Send + Sync {
    /// A consumer handler returned an error or panicked.
    fn handle_consumer_error(&self, channel: ChannelId, consumer_tag: &str, error: &HandlerError);

    /// The transport reported a link failure.
    fn handle_connection_error(&self, endpoint: &str, error: &TransportError) {
        warn!(endpoint, error = %error, "connection lost");
    }

    /// A recovery cycle ended without restoring the session.
    fn handle_recovery_error(&self, error: &Error) {
        error!(error = %error, "recovery failed");
    }
}

/// Logs handler failures and otherwise does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_consumer_error(&self, channel: ChannelId, consumer_tag: &str, error: &HandlerError) {
        warn!(channel, consumer_tag, error = %error, "consumer handler failed");
    }
}

/// Run `handler` on `delivery`, turning errors and panics into `HandlerError`.
pub(crate) fn invoke(handler: &dyn DeliveryHandler, delivery: Delivery) -> Result<(), HandlerError> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(delivery))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerError::Failed(e)),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(HandlerError::Panicked(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn delivery() -> Delivery {
        Delivery {
            consumer_tag: "ctag".into(),
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "q".into(),
            redelivered: false,
            properties: Default::default(),
            body: Bytes::from_static(b"hi"),
        }
    }

    #[test]
    fn invoke_passes_through_success() {
        let h = |_d: Delivery| -> Result<(), BoxError> { Ok(()) };
        assert!(invoke(&h, delivery()).is_ok());
    }

    #[test]
    fn invoke_wraps_returned_error() {
        let h = |_d: Delivery| -> Result<(), BoxError> { Err("oops".into()) };
        match invoke(&h, delivery()) {
            Err(HandlerError::Failed(e)) => assert_eq!(e.to_string(), "oops"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn invoke_catches_panic() {
        let h = |_d: Delivery| -> Result<(), BoxError> { panic!("boom") };
        match invoke(&h, delivery()) {
            Err(HandlerError::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }
}
