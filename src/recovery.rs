//! Recovery state machine: reconnect, reopen channels, replay topology.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::spawn_dispatcher;
use crate::config::Endpoint;
use crate::error::{Error, Result, TransportError};
use crate::executor::ActiveExecutor;
use crate::session::{SessionInner, SessionStatus};
use crate::topology::{ChannelId, Entry};
use crate::transport::Transport;

/// Where the recovery manager is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    Detecting,
    Reconnecting,
    Replaying,
    Recovered,
    Failed,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What started a recovery cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Trigger {
    Manual,
    /// Loss of the transport installed as `generation`.
    Failure { generation: u64 },
}

/// How to treat a host that rejects our credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostPolicy {
    /// Give up on the whole host list.
    FailFast,
    /// Skip the host for the rest of the cycle and keep going.
    SkipHost,
}

#[derive(Debug)]
pub(crate) enum ConnectFailure {
    Auth(String),
    Exhausted(TransportError),
}

pub(crate) struct RecoveryManager {
    /// Held for the duration of one cycle.
    lock: Mutex<()>,
    state: StdMutex<RecoveryState>,
}

impl RecoveryManager {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            state: StdMutex::new(RecoveryState::Idle),
        }
    }

    pub(crate) fn state(&self) -> RecoveryState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set(&self, next: RecoveryState) {
        let mut s = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *s != next {
            debug!(from = %*s, to = %next, "recovery state changed");
        }
        *s = next;
    }
}

/// Try each configured host in order and return the first transport opened.
///
/// Each attempt is bounded by the connection timeout. Hosts in `excluded`
/// are skipped; under `HostPolicy::SkipHost` hosts that reject credentials
/// are added to it.
pub(crate) async fn open_first_reachable(
    inner: &SessionInner,
    policy: HostPolicy,
    excluded: &mut HashSet<Endpoint>,
) -> std::result::Result<(Arc<dyn Transport>, Endpoint), ConnectFailure> {
    let params = inner.connect_params();
    let mut last: Option<TransportError> = None;

    for endpoint in &inner.endpoints {
        if excluded.contains(endpoint) {
            continue;
        }
        debug!(%endpoint, "connecting");
        let attempt = tokio::time::timeout(
            params.connection_timeout,
            inner.connector.connect(endpoint, &params),
        )
        .await;
        let err = match attempt {
            Ok(Ok(transport)) => return Ok((transport, endpoint.clone())),
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(endpoint.to_string()),
        };
        match err {
            TransportError::AccessRefused(msg) => match policy {
                HostPolicy::FailFast => return Err(ConnectFailure::Auth(msg)),
                HostPolicy::SkipHost => {
                    warn!(%endpoint, reason = %msg, "credentials rejected, host skipped for this cycle");
                    excluded.insert(endpoint.clone());
                    last = Some(TransportError::AccessRefused(msg));
                }
            },
            other => {
                warn!(%endpoint, error = %other, "host unavailable");
                last = Some(other);
            }
        }
    }

    Err(ConnectFailure::Exhausted(last.unwrap_or_else(|| {
        TransportError::Refused("every configured host".into())
    })))
}

/// Run one recovery cycle.
///
/// Failure triggers are dropped when a cycle is already running or when
/// they name a transport generation that is no longer current. A manual
/// trigger waits for a running cycle and reports how it ended.
pub(crate) async fn recover(inner: &Arc<SessionInner>, trigger: Trigger) -> Result<()> {
    let _cycle = match inner.recovery.lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => match trigger {
            Trigger::Failure { generation } => {
                debug!(generation, "recovery already running, failure signal coalesced");
                return Ok(());
            }
            Trigger::Manual => {
                let _wait = inner.recovery.lock.lock().await;
                let status = inner.state.lock().await.status;
                return match status {
                    SessionStatus::Connected => Ok(()),
                    SessionStatus::Closed => Err(Error::RecoveryAborted),
                    other => Err(Error::RecoveryFailed(format!(
                        "concurrent recovery left the session {other}"
                    ))),
                };
            }
        },
    };

    // Detecting
    let cancel = CancellationToken::new();
    let (epoch, previous) = {
        let mut state = inner.state.lock().await;
        if let Trigger::Failure { generation } = trigger {
            if state.generation != generation || state.status != SessionStatus::Connected {
                debug!(generation, current = state.generation, "stale failure signal ignored");
                return Ok(());
            }
        }
        inner.recovery.set(RecoveryState::Detecting);
        inner.set_status(&mut state, SessionStatus::Recovering);
        state.recovery_cancel = Some(cancel.clone());
        if let Some(monitor) = state.monitor.take() {
            monitor.cancel();
        }
        (state.epoch, state.transport.take())
    };
    info!(?trigger, "recovery started");
    if let Some(old) = previous {
        inner.close_transport(&old).await;
    }

    // Reconnecting
    inner.recovery.set(RecoveryState::Reconnecting);
    let attempts = inner.config.recovery_attempts;
    let mut excluded = HashSet::new();
    let mut last = TransportError::Refused("every configured host".into());
    let mut opened = None;
    for attempt in 0..attempts {
        let pause = match (attempt, trigger) {
            (0, Trigger::Manual) => None,
            _ => Some(inner.config.network_recovery_interval),
        };
        if let Some(pause) = pause.filter(|p| !p.is_zero()) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return aborted(inner),
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(attempt = attempt + 1, attempts, "reconnect pass");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return aborted(inner),
            r = open_first_reachable(inner, HostPolicy::SkipHost, &mut excluded) => r,
        };
        match result {
            Ok(found) => {
                opened = Some(found);
                break;
            }
            Err(ConnectFailure::Exhausted(e)) => last = e,
            Err(ConnectFailure::Auth(msg)) => last = TransportError::AccessRefused(msg),
        }
        if excluded.len() == inner.endpoints.len() {
            break;
        }
    }
    let Some((transport, endpoint)) = opened else {
        let err = Error::RecoveryFailed(format!(
            "no host reachable after {attempts} pass(es): {last}"
        ));
        return fail(inner, epoch, err).await;
    };

    let executor = match inner.build_executor() {
        Ok(executor) => executor,
        Err(e) => {
            inner.close_transport(&transport).await;
            return fail(inner, epoch, Error::RecoveryFailed(e.to_string())).await;
        }
    };

    // Replaying
    inner.recovery.set(RecoveryState::Replaying);
    let plan = {
        let state = inner.state.lock().await;
        if state.epoch != epoch || state.status != SessionStatus::Recovering {
            None
        } else {
            let plan: Vec<(ChannelId, Vec<Entry>)> = state
                .channels
                .iter()
                .map(|&id| (id, state.topology.entries_for(id)))
                .collect();
            Some(plan)
        }
    };
    let Some(plan) = plan else {
        return abandon(inner, &transport, executor).await;
    };
    let replayed = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        r = replay(inner, &plan, &transport, &executor) => Some(r),
    };
    match replayed {
        None => return abandon(inner, &transport, executor).await,
        Some(Err(e)) => {
            inner.close_transport(&transport).await;
            executor.release();
            let err = Error::RecoveryFailed(format!("replay against {endpoint} failed: {e}"));
            return fail(inner, epoch, err).await;
        }
        Some(Ok(())) => {}
    }

    let mut state = inner.state.lock().await;
    if state.epoch != epoch || state.status != SessionStatus::Recovering {
        drop(state);
        return abandon(inner, &transport, executor).await;
    }
    // Channels closed while the replay ran.
    let stale: Vec<ChannelId> = plan
        .iter()
        .map(|(id, _)| *id)
        .filter(|id| !state.channels.contains(id))
        .collect();
    inner.install(&mut state, transport.clone(), executor);
    state.recovery_cancel = None;
    let generation = state.generation;
    let channels = state.channels.len();
    drop(state);

    let limit = inner.config.connection_timeout;
    for id in stale {
        if let Err(e) = bounded(limit, &endpoint, transport.close_channel(id)).await {
            debug!(channel = id, error = %e, "closing channel dropped during replay failed");
        }
    }
    if inner.status() == SessionStatus::Closed {
        return aborted(inner);
    }

    inner.recovery.set(RecoveryState::Recovered);
    info!(%endpoint, generation, channels, "recovery complete");
    Ok(())
}

/// Reopen every channel under its old number and replay its entries.
async fn replay(
    inner: &SessionInner,
    plan: &[(ChannelId, Vec<Entry>)],
    transport: &Arc<dyn Transport>,
    executor: &ActiveExecutor,
) -> std::result::Result<(), String> {
    let limit = inner.config.connection_timeout;
    for (id, entries) in plan {
        let id = *id;
        bounded(limit, transport.endpoint(), transport.open_channel(id))
            .await
            .map_err(|e| format!("reopening channel {id}: {e}"))?;
        if !inner.config.topology_recovery {
            continue;
        }
        for entry in entries {
            bounded(
                limit,
                transport.endpoint(),
                replay_entry(inner, transport, executor, id, entry),
            )
                .await
                .map_err(|e| format!("channel {id}: {entry:?}: {e}"))?;
        }
    }
    Ok(())
}

/// Fail a broker call that does not answer within `limit`.
async fn bounded<T>(
    limit: Duration,
    endpoint: &Endpoint,
    op: impl Future<Output = std::result::Result<T, TransportError>>,
) -> std::result::Result<T, TransportError> {
    tokio::time::timeout(limit, op)
        .await
        .unwrap_or_else(|_| Err(TransportError::Timeout(endpoint.to_string())))
}

async fn replay_entry(
    inner: &SessionInner,
    transport: &Arc<dyn Transport>,
    executor: &ActiveExecutor,
    channel: ChannelId,
    entry: &Entry,
) -> std::result::Result<(), TransportError> {
    match entry {
        Entry::Queue { name, options } => {
            let effective = transport.declare_queue(channel, name, options).await?;
            if effective != *name {
                warn!(channel, queue = %name, effective = %effective, "queue came back under another name");
            }
        }
        Entry::Exchange {
            name,
            kind,
            options,
        } => transport.declare_exchange(channel, name, *kind, options).await?,
        Entry::Binding {
            queue,
            exchange,
            routing_key,
        } => {
            transport
                .bind_queue(channel, queue, exchange, routing_key)
                .await?
        }
        Entry::Qos {
            prefetch_count,
            global,
        } => transport.set_qos(channel, *prefetch_count, *global).await?,
        Entry::Consumer {
            queue,
            options,
            handler,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let tag = transport.consume(channel, queue, options, tx).await?;
            spawn_dispatcher(
                channel,
                tag,
                rx,
                handler.clone(),
                executor.executor.clone(),
                inner.config.exception_handler.clone(),
            );
        }
    }
    debug!(channel, ?entry, "replayed");
    Ok(())
}

/// End the cycle as Failed, leaving the session Disconnected unless it was
/// closed in the meantime.
async fn fail(inner: &Arc<SessionInner>, epoch: u64, err: Error) -> Result<()> {
    let released = {
        let mut state = inner.state.lock().await;
        if state.epoch != epoch {
            None
        } else {
            inner.set_status(&mut state, SessionStatus::Disconnected);
            state.recovery_cancel = None;
            Some(state.executor.take())
        }
    };
    let Some(executor) = released else {
        return aborted(inner);
    };
    if let Some(executor) = executor {
        executor.release();
    }
    inner.recovery.set(RecoveryState::Failed);
    warn!(error = %err, "recovery failed, session disconnected");
    inner.config.exception_handler.handle_recovery_error(&err);
    Err(err)
}

/// Drop what an aborted cycle opened.
async fn abandon(
    inner: &SessionInner,
    transport: &Arc<dyn Transport>,
    executor: ActiveExecutor,
) -> Result<()> {
    inner.close_transport(transport).await;
    executor.release();
    aborted(inner)
}

fn aborted(inner: &SessionInner) -> Result<()> {
    inner.recovery.set(RecoveryState::Failed);
    info!("recovery aborted by close");
    Err(Error::RecoveryAborted)
}
