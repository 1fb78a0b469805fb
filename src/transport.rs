//! The broker transport collaborator.
//!
//! A `Connector` opens `Transport`s; a `Transport` is one physical link to one
//! broker endpoint with numbered channels multiplexed over it. Wire framing,
//! TLS and socket handling live entirely behind these traits. The session
//! layer only ever talks to the broker through them, which is what lets it
//! throw a transport away and replay topology onto a fresh one.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{Credentials, Endpoint};
use crate::error::TransportError;
use crate::topology::ChannelId;

/// Exchange routing types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `queue.declare`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only check that the queue exists.
    pub passive: bool,
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it goes away.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Options for `exchange.declare`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Options for `basic.consume`.
///
/// Deliveries are always acknowledged automatically by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag; empty asks the broker to generate one.
    pub consumer_tag: String,
    /// No other consumer may attach to the queue while this one is active.
    pub exclusive: bool,
}

impl ConsumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Message properties carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
    /// Ordered application headers.
    pub headers: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn reply_to(mut self, value: impl Into<String>) -> Self {
        self.reply_to = Some(value.into());
        self
    }

    pub fn message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = Some(value.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Add an application header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Get the value of a header by name (case-sensitive).
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer_tag: String,
    /// Per-channel sequence number assigned by the transport.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Bytes,
}

/// Parameters handed to a `Connector` for each connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub credentials: Credentials,
    pub vhost: String,
    /// Requested heartbeat in seconds; `0` disables heartbeats.
    pub heartbeat: u16,
    pub tls: bool,
    pub connection_timeout: Duration,
}

/// A single physical connection to one broker endpoint.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from several tasks at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The endpoint this transport is connected to.
    fn endpoint(&self) -> &Endpoint;

    /// Heartbeat interval agreed during the handshake, if any.
    fn negotiated_heartbeat(&self) -> Option<std::time::Duration>;

    /// Wall-clock millis of the last traffic received from the broker.
    fn last_received(&self) -> u64;

    async fn open_channel(&self, channel: ChannelId) -> Result<(), TransportError>;

    async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError>;

    /// Declare a queue and return its effective name (broker-generated when
    /// `name` is empty).
    async fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError>;

    async fn delete_queue(&self, channel: ChannelId, name: &str) -> Result<(), TransportError>;

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError>;

    async fn delete_exchange(&self, channel: ChannelId, name: &str)
    -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn unbind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn set_qos(
        &self,
        channel: ChannelId,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), TransportError>;

    /// Start a consumer. Deliveries are pushed into `deliveries` until the
    /// consumer is cancelled or the transport goes away, at which point the
    /// sender is dropped. Returns the effective consumer tag.
    async fn consume(
        &self,
        channel: ChannelId,
        queue: &str,
        options: &ConsumeOptions,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Result<String, TransportError>;

    async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &Properties,
    ) -> Result<(), TransportError>;

    /// Send one heartbeat to the broker.
    async fn send_heartbeat(&self) -> Result<(), TransportError>;

    /// Resolves once the link is lost, with the reason. Does not resolve for
    /// a close requested through `close()`.
    async fn closed(&self) -> TransportError;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens transports. This is the connection factory handed to the session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        params: &ConnectParams,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
