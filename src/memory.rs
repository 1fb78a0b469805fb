//! An in-process broker implementing `Connector`.
//!
//! `MemoryBroker` models the parts of a broker the session layer depends on:
//! named nodes that can be up, down or unresponsive, user credentials, plain
//! and TLS listeners, exchanges with direct/fanout/topic routing plus the
//! default exchange, server-named, exclusive and auto-delete queues,
//! round-robin consumers and heartbeats. It also exposes fault injection
//! (dropping links, stalling heartbeats, freezing and stopping nodes) so
//! recovery can be driven deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TLS_PORT, Endpoint};
use crate::error::TransportError;
use crate::heartbeat::{current_millis, negotiate_heartbeat};
use crate::topology::ChannelId;
use crate::transport::{
    ConnectParams, ConsumeOptions, Connector, Delivery, ExchangeKind, ExchangeOptions, Properties,
    QueueOptions, Transport,
};

/// Heartbeat proposed by a fresh broker, in seconds.
pub const DEFAULT_SERVER_HEARTBEAT: u16 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeMode {
    Up,
    Down,
    /// Accepts the TCP connection but never answers the handshake.
    Blackhole,
    /// Completes the handshake, then never answers anything else.
    Frozen,
}

#[derive(Default)]
struct ChannelState {
    prefetch: Option<(u16, bool)>,
    next_delivery_tag: u64,
}

struct ConnState {
    host: String,
    channels: HashMap<ChannelId, ChannelState>,
    closed_tx: watch::Sender<Option<String>>,
    last_received: Arc<AtomicU64>,
    /// Heartbeats from the client go unanswered.
    stalled: bool,
    /// Every request hangs; only `close` still works.
    frozen: bool,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Bytes,
}

struct ConsumerSlot {
    conn: u64,
    channel: ChannelId,
    tag: String,
    exclusive: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    ready: VecDeque<Message>,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    builtin: bool,
    /// (queue, routing key) pairs.
    bindings: Vec<(String, String)>,
}

struct BrokerState {
    nodes: HashMap<String, NodeMode>,
    users: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    connections: HashMap<u64, ConnState>,
    next_conn_id: u64,
    server_heartbeat: u16,
    attempts: HashMap<String, usize>,
}

impl BrokerState {
    fn new() -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
        ] {
            exchanges.insert(
                name.to_string(),
                ExchangeState {
                    kind,
                    durable: true,
                    builtin: true,
                    bindings: Vec::new(),
                },
            );
        }
        Self {
            nodes: HashMap::new(),
            users: HashMap::new(),
            queues: HashMap::new(),
            exchanges,
            connections: HashMap::new(),
            next_conn_id: 1,
            server_heartbeat: DEFAULT_SERVER_HEARTBEAT,
            attempts: HashMap::new(),
        }
    }

    fn conn(&mut self, conn: u64) -> Result<&mut ConnState, TransportError> {
        self.connections
            .get_mut(&conn)
            .ok_or_else(|| TransportError::Closed("connection is closed".into()))
    }

    /// Check the link and channel, and count the reply as inbound traffic.
    fn check_channel(&mut self, conn: u64, channel: ChannelId) -> Result<(), TransportError> {
        let state = self.conn(conn)?;
        state.last_received.store(current_millis(), Ordering::SeqCst);
        if state.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(TransportError::Channel(format!(
                "CHANNEL_ERROR - channel {channel} is not open"
            )))
        }
    }

    fn declare_queue(
        &mut self,
        conn: u64,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError> {
        let name = if name.is_empty() {
            if options.passive {
                return Err(TransportError::Channel(
                    "NOT_FOUND - passive declare of a server-named queue".into(),
                ));
            }
            format!("amq.gen-{}", random_suffix())
        } else {
            name.to_string()
        };
        match self.queues.get(&name) {
            Some(existing) => {
                if let Some(owner) = existing.exclusive_owner.filter(|o| *o != conn) {
                    debug!(queue = %name, owner, "exclusive queue is locked");
                    return Err(TransportError::Channel(format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
                    )));
                }
                if !options.passive
                    && (existing.durable != options.durable
                        || existing.auto_delete != options.auto_delete)
                {
                    return Err(TransportError::Channel(format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"
                    )));
                }
            }
            None if options.passive => {
                return Err(TransportError::Channel(format!(
                    "NOT_FOUND - no queue '{name}'"
                )));
            }
            None => {
                self.queues.insert(
                    name.clone(),
                    QueueState {
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        exclusive_owner: options.exclusive.then_some(conn),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        ready: VecDeque::new(),
                    },
                );
            }
        }
        Ok(name)
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(q, _)| q != name);
            }
        }
    }

    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind && !options.passive => {
                Err(TransportError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': received '{kind}' but current is '{}'",
                    existing.kind
                )))
            }
            Some(existing) if existing.durable != options.durable && !options.passive => {
                Err(TransportError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None if options.passive => Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{name}'"
            ))),
            None if name.is_empty() || name.starts_with("amq.") => {
                Err(TransportError::Channel(format!(
                    "ACCESS_REFUSED - exchange name '{name}' contains reserved prefix 'amq.'"
                )))
            }
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable: options.durable,
                        builtin: false,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let x = self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::Channel(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &x.bindings {
            let matched = match x.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hand `msg` to the next live consumer of `queue`, or park it.
    fn enqueue(&mut self, queue: &str, msg: Message) {
        let BrokerState {
            queues,
            connections,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        while !q.consumers.is_empty() {
            let idx = q.next_consumer % q.consumers.len();
            let slot = &q.consumers[idx];
            let tag = connections
                .get_mut(&slot.conn)
                .and_then(|c| c.channels.get_mut(&slot.channel))
                .map(|ch| {
                    ch.next_delivery_tag += 1;
                    ch.next_delivery_tag
                });
            if let Some(delivery_tag) = tag {
                let delivery = Delivery {
                    consumer_tag: slot.tag.clone(),
                    delivery_tag,
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                    redelivered: false,
                    properties: msg.properties.clone(),
                    body: msg.body.clone(),
                };
                if slot.tx.send(delivery).is_ok() {
                    q.next_consumer = idx + 1;
                    return;
                }
            }
            q.consumers.remove(idx);
        }
        q.ready.push_back(msg);
    }

    fn drain_ready(&mut self, queue: &str) {
        let pending: Vec<Message> = match self.queues.get_mut(queue) {
            Some(q) if !q.consumers.is_empty() => q.ready.drain(..).collect(),
            _ => return,
        };
        for msg in pending {
            self.enqueue(queue, msg);
        }
    }

    /// Remove consumers matching `pred`, deleting auto-delete queues they leave empty.
    fn remove_consumers(&mut self, pred: impl Fn(&ConsumerSlot) -> bool) {
        let mut emptied = Vec::new();
        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| !pred(c));
            if q.auto_delete && before > 0 && q.consumers.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            debug!(queue = %name, "auto-delete queue lost its last consumer");
            self.delete_queue(&name);
        }
    }

    /// Tear down a connection. `reason` is reported to the client when the
    /// link was lost rather than closed by the client.
    fn drop_connection(&mut self, conn: u64, reason: Option<&str>) {
        let Some(state) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(reason) = reason {
            let _ = state.closed_tx.send(Some(reason.to_string()));
        }
        self.remove_consumers(|c| c.conn == conn);
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(conn))
            .map(|(n, _)| n.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }

    fn freeze_connections_on(&mut self, host: &str) {
        for conn in self.connections.values_mut() {
            if conn.host == host {
                conn.frozen = true;
            }
        }
    }

    fn drop_connections_on(&mut self, host: &str, reason: &str) -> usize {
        let ids: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| c.host == host)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.drop_connection(*id, Some(reason));
        }
        ids.len()
    }
}

/// Cheaply cloneable handle to a shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with one running node, `localhost`, and the `guest` user.
    pub fn new() -> Self {
        let broker = Self::empty();
        broker.add_node(DEFAULT_HOST);
        broker.add_user("guest", "guest");
        broker
    }

    /// A broker with no nodes and no users.
    pub fn empty() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a node reachable as `host`, listening on 5672 and 5671 (TLS).
    pub fn add_node(&self, host: impl Into<String>) {
        self.state().nodes.insert(host.into(), NodeMode::Up);
    }

    /// Stop `host`: live connections are dropped and new ones refused.
    pub fn stop_node(&self, host: &str) {
        let mut state = self.state();
        if let Some(mode) = state.nodes.get_mut(host) {
            *mode = NodeMode::Down;
        }
        state.drop_connections_on(host, "node stopped");
    }

    pub fn start_node(&self, host: &str) {
        if let Some(mode) = self.state().nodes.get_mut(host) {
            *mode = NodeMode::Up;
        }
    }

    /// New connections to `host` hang until the client gives up.
    pub fn blackhole_node(&self, host: &str) {
        if let Some(mode) = self.state().nodes.get_mut(host) {
            *mode = NodeMode::Blackhole;
        }
    }

    /// Sever every connection to `host` as if the network failed. The node
    /// keeps accepting new connections. Returns the number dropped.
    pub fn drop_connections(&self, host: &str) -> usize {
        self.state()
            .drop_connections_on(host, "connection reset by peer")
    }

    /// Stop answering heartbeats on the current connections to `host`.
    pub fn stall_heartbeats(&self, host: &str) {
        for conn in self.state().connections.values_mut() {
            if conn.host == host {
                conn.stalled = true;
            }
        }
    }

    /// Make `host` stop answering: requests on its connections, current and
    /// future, never complete. Closing a connection still works.
    pub fn freeze_node(&self, host: &str) {
        let mut state = self.state();
        if let Some(mode) = state.nodes.get_mut(host) {
            *mode = NodeMode::Frozen;
        }
        state.freeze_connections_on(host);
    }

    /// Like `freeze_node`, but only for the connections open right now.
    pub fn freeze_connections(&self, host: &str) {
        self.state().freeze_connections_on(host);
    }

    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.state().users.insert(username.into(), password.into());
    }

    pub fn remove_user(&self, username: &str) {
        self.state().users.remove(username);
    }

    /// Heartbeat the broker proposes during the handshake; `0` for none.
    pub fn set_server_heartbeat(&self, secs: u16) {
        self.state().server_heartbeat = secs;
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn binding_exists(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.state()
            .exchanges
            .get(exchange)
            .map(|x| {
                x.bindings
                    .iter()
                    .any(|(q, k)| q == queue && k == routing_key)
            })
            .unwrap_or(false)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages parked in `queue` waiting for a consumer.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn connections_on(&self, host: &str) -> usize {
        self.state()
            .connections
            .values()
            .filter(|c| c.host == host)
            .count()
    }

    /// Connection attempts made against `host`, successful or not.
    pub fn connection_attempts(&self, host: &str) -> usize {
        self.state().attempts.get(host).copied().unwrap_or(0)
    }

    /// Channels open across all live connections.
    pub fn open_channels(&self) -> usize {
        self.state()
            .connections
            .values()
            .map(|c| c.channels.len())
            .sum()
    }

    /// `(channel, prefetch_count, global)` for every channel with QoS set.
    pub fn qos_settings(&self) -> Vec<(ChannelId, u16, bool)> {
        let mut out: Vec<(ChannelId, u16, bool)> = self
            .state()
            .connections
            .values()
            .flat_map(|c| {
                c.channels
                    .iter()
                    .filter_map(|(id, ch)| ch.prefetch.map(|(n, g)| (*id, n, g)))
            })
            .collect();
        out.sort();
        out
    }

    /// Publish from outside any client connection. Returns the number of
    /// queues the message was routed to.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<usize, TransportError> {
        let mut state = self.state();
        let targets = state.route(exchange, routing_key)?;
        let msg = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: Properties::default(),
            body: body.into(),
        };
        for queue in &targets {
            state.enqueue(queue, msg.clone());
        }
        Ok(targets.len())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        params: &ConnectParams,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mode = {
            let mut state = self.state();
            *state.attempts.entry(endpoint.host.clone()).or_insert(0) += 1;
            state.nodes.get(&endpoint.host).copied()
        };
        match mode {
            None | Some(NodeMode::Down) => {
                return Err(TransportError::Refused(endpoint.to_string()));
            }
            Some(NodeMode::Blackhole) => return future::pending().await,
            Some(NodeMode::Up) | Some(NodeMode::Frozen) => {}
        }
        let frozen = mode == Some(NodeMode::Frozen);
        match (endpoint.port, params.tls) {
            (DEFAULT_PORT, false) | (DEFAULT_TLS_PORT, true) => {}
            (DEFAULT_PORT, true) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("tls handshake with {endpoint} failed: peer is not speaking TLS"),
                )));
            }
            (DEFAULT_TLS_PORT, false) => {
                return Err(TransportError::Closed(format!(
                    "{endpoint} reset the connection during the handshake"
                )));
            }
            _ => return Err(TransportError::Refused(endpoint.to_string())),
        }

        let mut state = self.state();
        let authorized = state
            .users
            .get(&params.credentials.username)
            .is_some_and(|p| *p == params.credentials.password);
        if !authorized {
            return Err(TransportError::AccessRefused(format!(
                "login refused for user '{}'",
                params.credentials.username
            )));
        }
        let heartbeat = negotiate_heartbeat(params.heartbeat, state.server_heartbeat);
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        let (closed_tx, closed_rx) = watch::channel(None);
        let last_received = Arc::new(AtomicU64::new(current_millis()));
        state.connections.insert(
            conn_id,
            ConnState {
                host: endpoint.host.clone(),
                channels: HashMap::new(),
                closed_tx,
                last_received: last_received.clone(),
                stalled: false,
                frozen,
            },
        );
        debug!(conn = conn_id, %endpoint, tls = params.tls, "memory broker accepted connection");
        Ok(Arc::new(MemoryTransport {
            broker: self.clone(),
            conn_id,
            endpoint: endpoint.clone(),
            heartbeat,
            closed_rx,
            last_received,
        }))
    }
}

/// A client connection to a `MemoryBroker`.
pub struct MemoryTransport {
    broker: MemoryBroker,
    conn_id: u64,
    endpoint: Endpoint,
    heartbeat: Option<Duration>,
    closed_rx: watch::Receiver<Option<String>>,
    last_received: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Hang forever if the connection has been frozen.
    async fn responsive(&self) -> Result<(), TransportError> {
        let frozen = self.broker.state().conn(self.conn_id)?.frozen;
        if frozen {
            debug!(conn = self.conn_id, "request swallowed by frozen connection");
            future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn negotiated_heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::SeqCst)
    }

    async fn open_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        let conn = state.conn(self.conn_id)?;
        if conn.channels.contains_key(&channel) {
            return Err(TransportError::Channel(format!(
                "CHANNEL_ERROR - channel {channel} is already open"
            )));
        }
        conn.channels.insert(channel, ChannelState::default());
        Ok(())
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.conn(self.conn_id)?.channels.remove(&channel);
        let conn_id = self.conn_id;
        state.remove_consumers(|c| c.conn == conn_id && c.channel == channel);
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: ChannelId,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        state.declare_queue(self.conn_id, name, options)
    }

    async fn delete_queue(&self, channel: ChannelId, name: &str) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        if let Some(owner) = state
            .queues
            .get(name)
            .and_then(|q| q.exclusive_owner)
            .filter(|o| *o != self.conn_id)
        {
            debug!(queue = name, owner, "refusing to delete exclusive queue");
            return Err(TransportError::Channel(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
            )));
        }
        state.delete_queue(name);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        state.declare_exchange(name, kind, options)
    }

    async fn delete_exchange(
        &self,
        channel: ChannelId,
        name: &str,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        if state.exchanges.get(name).is_some_and(|x| x.builtin) || name.is_empty() {
            return Err(TransportError::Channel(format!(
                "ACCESS_REFUSED - exchange '{name}' cannot be deleted"
            )));
        }
        state.exchanges.remove(name);
        Ok(())
    }

    async fn bind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        if exchange.is_empty() {
            return Err(TransportError::Channel(
                "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            ));
        }
        let x = state.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::Channel(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !x.bindings.contains(&binding) {
            x.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        if let Some(x) = state.exchanges.get_mut(exchange) {
            x.bindings.retain(|(q, k)| !(q == queue && k == routing_key));
        }
        Ok(())
    }

    async fn set_qos(
        &self,
        channel: ChannelId,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        if let Some(ch) = state.conn(self.conn_id)?.channels.get_mut(&channel) {
            ch.prefetch = Some((prefetch_count, global));
        }
        Ok(())
    }

    async fn consume(
        &self,
        channel: ChannelId,
        queue: &str,
        options: &ConsumeOptions,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Result<String, TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        let conn_id = self.conn_id;
        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", random_suffix())
        } else {
            options.consumer_tag.clone()
        };
        let tag_in_use = state.queues.values().any(|q| {
            q.consumers
                .iter()
                .any(|c| c.conn == conn_id && c.channel == channel && c.tag == tag)
        });
        if tag_in_use {
            return Err(TransportError::Channel(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"
            )));
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
        if q.exclusive_owner.is_some_and(|o| o != conn_id) {
            return Err(TransportError::Channel(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{queue}'"
            )));
        }
        if q.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !q.consumers.is_empty())
        {
            return Err(TransportError::Channel(format!(
                "ACCESS_REFUSED - queue '{queue}' in exclusive use"
            )));
        }
        q.consumers.push(ConsumerSlot {
            conn: conn_id,
            channel,
            tag: tag.clone(),
            exclusive: options.exclusive,
            tx: deliveries,
        });
        state.drain_ready(queue);
        Ok(tag)
    }

    async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        let conn_id = self.conn_id;
        state.remove_consumers(|c| c.conn == conn_id && c.channel == channel && c.tag == consumer_tag);
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &Properties,
    ) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        state.check_channel(self.conn_id, channel)?;
        let targets = state.route(exchange, routing_key)?;
        let msg = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body,
        };
        for queue in &targets {
            state.enqueue(queue, msg.clone());
        }
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), TransportError> {
        self.responsive().await?;
        let mut state = self.broker.state();
        let conn = state.conn(self.conn_id)?;
        if !conn.stalled {
            conn.last_received.store(current_millis(), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn closed(&self) -> TransportError {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return TransportError::Closed(reason);
            }
            if rx.changed().await.is_err() {
                // Sender gone without a reason: closed by the client.
                return future::pending().await;
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().drop_connection(self.conn_id, None);
        Ok(())
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&p[1..], k) || (!k.is_empty() && matches(p, &k[1..])),
            (Some(_), None) => false,
            (None, Some(_)) => false,
            (Some(&"*"), Some(_)) => matches(&p[1..], &k[1..]),
            (Some(pw), Some(kw)) => pw == kw && matches(&p[1..], &k[1..]),
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = routing_key.split('.').collect();
    matches(&p, &k)
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect()
}
