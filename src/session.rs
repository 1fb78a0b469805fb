use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::config::{Config, Endpoint, ExecutorSource};
use crate::error::{Error, Result, TransportError};
use crate::executor::{ActiveExecutor, Executor, ThreadPool, TokioExecutor};
use crate::heartbeat::{current_millis, is_overdue, send_interval};
use crate::recovery::{self, ConnectFailure, HostPolicy, RecoveryManager, RecoveryState, Trigger};
use crate::topology::{ChannelId, Entry, TopologyRegistry};
use crate::transport::{ConnectParams, Connector, Transport};

/// Highest channel number handed out by `create_channel`.
pub const CHANNEL_MAX: ChannelId = 2047;

/// Timer period used when heartbeats are disabled; the timers never fire then.
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Lifecycle status of a `Session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The last recovery failed; `trigger_recovery` may be retried.
    Disconnected,
    Connecting,
    Connected,
    Recovering,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Recovering => "recovering",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Mutable session state, guarded by `SessionInner::state`.
pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) endpoint: Option<Endpoint>,
    /// Incremented each time a transport is installed.
    pub(crate) generation: u64,
    /// Generation whose loss has already been reported.
    pub(crate) failed_generation: u64,
    /// Incremented by `close()`; recovery aborts when it changes underneath it.
    pub(crate) epoch: u64,
    pub(crate) channels: BTreeSet<ChannelId>,
    pub(crate) topology: TopologyRegistry,
    pub(crate) executor: Option<ActiveExecutor>,
    /// Cancelled once the current generation stops being current.
    pub(crate) monitor: Option<CancellationToken>,
    pub(crate) recovery_cancel: Option<CancellationToken>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Connecting,
            transport: None,
            endpoint: None,
            generation: 0,
            failed_generation: 0,
            epoch: 0,
            channels: BTreeSet::new(),
            topology: TopologyRegistry::new(),
            executor: None,
            monitor: None,
            recovery_cancel: None,
        }
    }
}

/// The transport a channel operation runs against.
///
/// Taken under the state lock and used after it is released, so a broker
/// call that never answers cannot stall `close()` or recovery.
pub(crate) struct Link {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) generation: u64,
    pub(crate) lost: CancellationToken,
}

pub(crate) struct SessionInner {
    pub(crate) config: Config,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) state: Mutex<SessionState>,
    /// Serializes channel operations so the record keeps broker order.
    /// Never held by `close()` or recovery.
    pub(crate) ops: Mutex<()>,
    pub(crate) recovery: RecoveryManager,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionInner {
    pub(crate) fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            credentials: self.config.credentials.clone(),
            vhost: self.config.vhost.clone(),
            heartbeat: self.config.heartbeat_secs(),
            tls: self.config.tls,
            connection_timeout: self.config.connection_timeout,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn link(&self, state: &SessionState) -> Result<Link> {
        match (&state.transport, state.status) {
            (Some(transport), SessionStatus::Connected) => Ok(Link {
                transport: transport.clone(),
                generation: state.generation,
                lost: state.monitor.clone().unwrap_or_default(),
            }),
            (_, status) => Err(Error::NotConnected(status)),
        }
    }

    /// Await one broker call on `link`, giving up as soon as its generation
    /// is torn down by recovery or `close()`.
    pub(crate) async fn call<T, F>(self: &Arc<Self>, link: &Link, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = link.lost.cancelled() => Err(Error::NotConnected(self.status())),
            result = op => result.map_err(|e| self.route_failure(link.generation, e)),
        }
    }

    /// Check, under the state lock, that `link` is still the live transport.
    pub(crate) fn still_current(&self, state: &SessionState, link: &Link) -> Result<()> {
        match state.status {
            SessionStatus::Connected if state.generation == link.generation => Ok(()),
            // Replaced while the call was in flight; the new transport never saw it.
            SessionStatus::Connected => Err(Error::NotConnected(SessionStatus::Recovering)),
            status => Err(Error::NotConnected(status)),
        }
    }

    /// Close a transport, waiting at most the connection timeout.
    pub(crate) async fn close_transport(&self, transport: &Arc<dyn Transport>) {
        match tokio::time::timeout(self.config.connection_timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(endpoint = %transport.endpoint(), error = %e, "transport did not close cleanly"),
            Err(_) => debug!(endpoint = %transport.endpoint(), "transport close timed out"),
        }
    }

    pub(crate) fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        if state.status != status {
            debug!(from = %state.status, to = %status, "session status changed");
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Build the executor for a new connect/recovery cycle.
    pub(crate) fn build_executor(&self) -> Result<ActiveExecutor> {
        let pool = |size: usize| -> Result<ActiveExecutor> {
            let pool = match &self.config.thread_factory {
                Some(factory) => ThreadPool::with_thread_factory(size, factory.as_ref()),
                None => ThreadPool::new(size),
            }
            .map_err(|e| Error::Configuration(format!("cannot start thread pool: {e}")))?;
            Ok(ActiveExecutor {
                executor: Arc::new(pool),
                owned: true,
            })
        };
        match &self.config.executor {
            ExecutorSource::Shared(executor) => Ok(ActiveExecutor {
                executor: executor.clone(),
                owned: false,
            }),
            ExecutorSource::Factory(factory) => Ok(ActiveExecutor {
                executor: factory(),
                owned: true,
            }),
            ExecutorSource::ThreadPool(size) => pool(*size),
            ExecutorSource::Default if self.config.thread_factory.is_some() => {
                pool(std::thread::available_parallelism().map_or(4, |n| n.get()))
            }
            ExecutorSource::Default => Ok(ActiveExecutor {
                executor: Arc::new(TokioExecutor::current()),
                owned: true,
            }),
        }
    }

    /// Make `transport` the current generation and mark the session Connected.
    pub(crate) fn install(
        self: &Arc<Self>,
        state: &mut SessionState,
        transport: Arc<dyn Transport>,
        executor: ActiveExecutor,
    ) {
        state.generation += 1;
        let generation = state.generation;
        if let Some(old) = state.executor.replace(executor.clone()) {
            if !same_executor(&old.executor, &executor.executor) {
                old.release();
            }
        }
        if let Some(monitor) = state.monitor.take() {
            monitor.cancel();
        }
        state.endpoint = Some(transport.endpoint().clone());
        state.monitor = Some(self.spawn_monitor(transport.clone(), generation));
        state.transport = Some(transport);
        self.set_status(state, SessionStatus::Connected);
    }

    /// Watch one transport generation for link loss and missed heartbeats.
    fn spawn_monitor(self: &Arc<Self>, transport: Arc<dyn Transport>, generation: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak: Weak<SessionInner> = Arc::downgrade(self);

        tokio::spawn(async move {
            let heartbeat = transport.negotiated_heartbeat();
            let endpoint = transport.endpoint().to_string();
            let period = heartbeat.unwrap_or(IDLE_PERIOD);
            let mut hb_tick = tokio::time::interval(send_interval(period));
            hb_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut watchdog = tokio::time::interval(period);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(%endpoint, generation, ?heartbeat, "monitoring transport");

            let cause = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    err = transport.closed() => break err,
                    _ = hb_tick.tick(), if heartbeat.is_some() => {
                        match tokio::time::timeout(period, transport.send_heartbeat()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break e,
                            Err(_) => break TransportError::MissedHeartbeats(endpoint.clone()),
                        }
                    }
                    _ = watchdog.tick(), if heartbeat.is_some() => {
                        if is_overdue(transport.last_received(), current_millis(), period) {
                            break TransportError::MissedHeartbeats(endpoint.clone());
                        }
                    }
                }
            };

            if let Some(inner) = weak.upgrade() {
                inner.handle_link_failure(generation, cause).await;
            }
        });
        token
    }

    /// React to the loss of transport `generation`, at most once per generation.
    pub(crate) async fn handle_link_failure(self: &Arc<Self>, generation: u64, cause: TransportError) {
        let (endpoint, abandoned) = {
            let mut state = self.state.lock().await;
            if state.generation != generation
                || state.status != SessionStatus::Connected
                || state.failed_generation == generation
            {
                debug!(generation, error = %cause, "stale failure signal ignored");
                return;
            }
            state.failed_generation = generation;
            let endpoint = state
                .endpoint
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            let abandoned = if self.config.automatic_recovery {
                None
            } else {
                self.set_status(&mut state, SessionStatus::Disconnected);
                if let Some(monitor) = state.monitor.take() {
                    monitor.cancel();
                }
                Some((state.transport.take(), state.executor.take()))
            };
            (endpoint, abandoned)
        };

        self.config
            .exception_handler
            .handle_connection_error(&endpoint, &cause);

        match abandoned {
            None => {
                if let Err(e) = recovery::recover(self, Trigger::Failure { generation }).await {
                    debug!(error = %e, "automatic recovery did not complete");
                }
            }
            Some((transport, executor)) => {
                info!(%endpoint, "connection lost and automatic recovery is disabled");
                if let Some(t) = transport {
                    self.close_transport(&t).await;
                }
                if let Some(e) = executor {
                    e.release();
                }
            }
        }
    }

    /// Map a transport error seen by a channel operation, routing link
    /// failures into recovery.
    pub(crate) fn route_failure(self: &Arc<Self>, generation: u64, err: TransportError) -> Error {
        if !err.is_link_failure() {
            return Error::Broker(err.to_string());
        }
        let status = if self.config.automatic_recovery {
            SessionStatus::Recovering
        } else {
            SessionStatus::Disconnected
        };
        let inner = self.clone();
        tokio::spawn(async move { inner.handle_link_failure(generation, err).await });
        Error::NotConnected(status)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(monitor) = state.monitor.take() {
            monitor.cancel();
        }
        if let Some(cancel) = state.recovery_cancel.take() {
            cancel.cancel();
        }
    }
}

fn same_executor(a: &Arc<dyn Executor>, b: &Arc<dyn Executor>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Caller-facing handle to one logical broker connection.
///
/// A `Session` owns one transport at a time, the channels opened through it
/// and the record of their topology. When the transport is lost the session
/// recovers in the background: it reconnects, reopens every channel under
/// the same number and replays declarations in order. Handles are cheap to
/// clone and share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Validate `config` and connect to the first reachable host.
    ///
    /// Hosts are tried in order, each bounded by the connection timeout.
    /// Rejected credentials fail immediately without trying further hosts.
    pub async fn connect(config: Config) -> Result<Self> {
        let endpoints = config.validate()?;
        let connector = config
            .connector
            .clone()
            .ok_or_else(|| Error::Configuration("no broker connector configured".into()))?;
        let (status_tx, _) = watch::channel(SessionStatus::Connecting);
        let inner = Arc::new(SessionInner {
            config,
            endpoints,
            connector,
            state: Mutex::new(SessionState::new()),
            ops: Mutex::new(()),
            recovery: RecoveryManager::new(),
            status_tx,
        });

        let mut excluded = Default::default();
        let (transport, endpoint) =
            match recovery::open_first_reachable(&inner, HostPolicy::FailFast, &mut excluded).await {
                Ok(opened) => opened,
                Err(failure) => {
                    let mut state = inner.state.lock().await;
                    inner.set_status(&mut state, SessionStatus::Disconnected);
                    return Err(match failure {
                        ConnectFailure::Auth(msg) => Error::AuthenticationFailure(msg),
                        ConnectFailure::Exhausted(last) => Error::ConnectionRefused(last),
                    });
                }
            };

        let executor = match inner.build_executor() {
            Ok(executor) => executor,
            Err(e) => {
                inner.close_transport(&transport).await;
                return Err(e);
            }
        };
        {
            let mut state = inner.state.lock().await;
            inner.install(&mut state, transport, executor);
        }
        info!(%endpoint, "session connected");
        Ok(Session { inner })
    }

    /// Open a new channel with the lowest free channel number.
    pub async fn create_channel(&self) -> Result<Channel> {
        let _serial = self.inner.ops.lock().await;
        let (link, id) = {
            let state = self.inner.state.lock().await;
            let link = self.inner.link(&state)?;
            let id = (1..=CHANNEL_MAX)
                .find(|id| !state.channels.contains(id))
                .ok_or(Error::ChannelLimit(CHANNEL_MAX))?;
            (link, id)
        };
        self.inner
            .call(&link, link.transport.open_channel(id))
            .await?;
        let mut state = self.inner.state.lock().await;
        self.inner.still_current(&state, &link)?;
        state.channels.insert(id);
        debug!(channel = id, "channel opened");
        Ok(Channel::new(id, self.inner.clone()))
    }

    /// Close the session, its transport and every channel.
    ///
    /// Closing an already-closed session does nothing. A recovery in progress
    /// is aborted and the session stays Closed. Channel operations still
    /// waiting on the broker return `NotConnected(Closed)`, and the transport
    /// close is bounded by the connection timeout.
    pub async fn close(&self) -> Result<()> {
        let (transport, executor) = {
            let mut state = self.inner.state.lock().await;
            if state.status == SessionStatus::Closed {
                return Ok(());
            }
            state.epoch += 1;
            state.channels.clear();
            state.topology.clear();
            // Status first: woken callers read it.
            self.inner.set_status(&mut state, SessionStatus::Closed);
            if let Some(cancel) = state.recovery_cancel.take() {
                cancel.cancel();
            }
            if let Some(monitor) = state.monitor.take() {
                monitor.cancel();
            }
            (state.transport.take(), state.executor.take())
        };
        if let Some(t) = transport {
            self.inner.close_transport(&t).await;
        }
        if let Some(e) = executor {
            e.release();
        }
        info!("session closed");
        Ok(())
    }

    /// Tolerates redundant start calls: a no-op while the session is
    /// connecting, connected or recovering. Never reopens a closed session.
    pub async fn start(&self) -> Result<()> {
        match self.status() {
            SessionStatus::Connecting | SessionStatus::Connected | SessionStatus::Recovering => {
                Ok(())
            }
            status => Err(Error::NotConnected(status)),
        }
    }

    /// Run a recovery cycle now: reconnect, reopen channels, replay topology.
    ///
    /// Also reopens a session that was closed or left disconnected by a
    /// failed recovery.
    pub async fn trigger_recovery(&self) -> Result<()> {
        recovery::recover(&self.inner, Trigger::Manual).await
    }

    /// Alias of `trigger_recovery`.
    pub async fn automatically_recover(&self) -> Result<()> {
        self.trigger_recovery().await
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    /// Receive every status transition.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.inner.recovery.state()
    }

    /// Endpoint of the current (or last) transport.
    pub async fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().await.endpoint.clone()
    }

    /// Number of transports installed so far, counting the initial one.
    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    pub async fn negotiated_heartbeat(&self) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .await
            .transport
            .as_ref()
            .and_then(|t| t.negotiated_heartbeat())
    }

    /// Numbers of the channels currently open.
    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.state.lock().await.channels.iter().copied().collect()
    }

    /// Snapshot of the topology recorded for `channel`, in replay order.
    pub async fn recorded_topology(&self, channel: ChannelId) -> Vec<Entry> {
        self.inner.state.lock().await.topology.entries_for(channel)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("hosts", &self.inner.endpoints)
            .finish_non_exhaustive()
    }
}
