//! Connection lifecycle and automatic recovery for async message-broker clients.
//!
//! A [`Session`] owns one broker transport at a time. Channels opened through
//! it record every queue, exchange, binding, consumer and QoS declaration;
//! when the link drops the session reconnects (trying the configured hosts in
//! order), reopens each channel under its old number and replays the record.
//!
//! The wire protocol lives behind the [`Connector`] and [`Transport`] traits.
//! [`MemoryBroker`] is an in-process implementation with fault injection.

pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod memory;
pub mod recovery;
pub mod session;
pub mod topology;
pub mod transport;

pub use channel::{Channel, Exchange, Queue};
pub use config::{Config, Credentials, Endpoint, ExecutorSource};
pub use error::{Error, Result, TransportError};
pub use executor::{Executor, ThreadFactory, ThreadPool, TokioExecutor};
pub use handler::{BoxError, DeliveryHandler, ExceptionHandler, HandlerError, LoggingExceptionHandler};
pub use heartbeat::negotiate_heartbeat;
pub use memory::MemoryBroker;
pub use recovery::RecoveryState;
pub use session::{Session, SessionStatus};
pub use topology::{ChannelId, Entry, EntryKey, TopologyRegistry};
pub use transport::{
    ConnectParams, ConsumeOptions, Connector, Delivery, ExchangeKind, ExchangeOptions, Properties,
    QueueOptions, Transport,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn smoke_connect_declare_close() {
        let broker = MemoryBroker::new();
        let session = Session::connect(Config::new().connector(broker.clone()))
            .await
            .unwrap();
        let ch = session.create_channel().await.unwrap();
        let q = ch.declare_queue("", QueueOptions::new().exclusive(true)).await.unwrap();
        assert!(q.name().starts_with("amq.gen-"));
        assert!(broker.queue_exists(q.name()));
        session.close().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(broker.connection_count(), 0);
        assert!(!broker.queue_exists(q.name()));
    }
}
