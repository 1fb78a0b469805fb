use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{MutexGuard, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result, TransportError};
use crate::executor::Executor;
use crate::handler::{self, BoxError, DeliveryHandler, ExceptionHandler};
use crate::session::{Link, SessionInner, SessionState};
use crate::topology::{ChannelId, Entry, EntryKey};
use crate::transport::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, Properties, QueueOptions,
};

/// A logical channel on a `Session`.
///
/// The channel number is assigned when the channel is created and stays the
/// same across recovery, even though the broker-side channel is a new one.
/// Declarations made through a channel are recorded so that recovery can
/// replay them.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    session: Arc<SessionInner>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, session: Arc<SessionInner>) -> Self {
        Self { id, session }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub async fn is_open(&self) -> bool {
        self.session.state.lock().await.channels.contains(&self.id)
    }

    /// Queue up behind other channel operations and take the live transport.
    async fn begin(&self) -> Result<(MutexGuard<'_, ()>, Link)> {
        let serial = self.session.ops.lock().await;
        let state = self.session.state.lock().await;
        if !state.channels.contains(&self.id) {
            return Err(Error::ChannelClosed(self.id));
        }
        let link = self.session.link(&state)?;
        Ok((serial, link))
    }

    async fn call<T, F>(&self, link: &Link, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let result = self.session.call(link, op).await;
        if let Err(e) = &result {
            debug!(channel = self.id, error = %e, "channel operation failed");
        }
        result
    }

    /// Lock the session again to record what a call on `link` did.
    async fn commit(&self, link: &Link) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.session.state.lock().await;
        if !state.channels.contains(&self.id) {
            return Err(Error::ChannelClosed(self.id));
        }
        self.session.still_current(&state, link)?;
        Ok(state)
    }

    /// Declare a queue. An empty `name` asks the broker to generate one; the
    /// returned `Queue` carries the effective name.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<Queue> {
        let (_serial, link) = self.begin().await?;
        let effective = self
            .call(&link, link.transport.declare_queue(self.id, name, &options))
            .await?;
        let mut state = self.commit(&link).await?;
        if !options.passive {
            state.topology.record(
                self.id,
                Entry::Queue {
                    name: effective.clone(),
                    options,
                },
            );
        }
        debug!(channel = self.id, queue = %effective, "queue declared");
        Ok(Queue {
            channel: self.clone(),
            name: effective,
        })
    }

    /// Delete a queue along with every recorded binding and consumer for it.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(&link, link.transport.delete_queue(self.id, name))
            .await?;
        self.commit(&link).await?.topology.remove_queue(name);
        debug!(channel = self.id, queue = name, "queue deleted");
        Ok(())
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<Exchange> {
        if name.is_empty() {
            return Err(default_exchange_refused("declare"));
        }
        let (_serial, link) = self.begin().await?;
        self.call(
            &link,
            link.transport.declare_exchange(self.id, name, kind, &options),
        )
        .await?;
        let mut state = self.commit(&link).await?;
        if !options.passive {
            state.topology.record(
                self.id,
                Entry::Exchange {
                    name: name.to_string(),
                    kind,
                    options,
                },
            );
        }
        debug!(channel = self.id, exchange = name, %kind, "exchange declared");
        Ok(Exchange {
            channel: self.clone(),
            name: name.to_string(),
        })
    }

    /// Delete an exchange along with every recorded binding to it.
    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(&link, link.transport.delete_exchange(self.id, name))
            .await?;
        self.commit(&link).await?.topology.remove_exchange(name);
        debug!(channel = self.id, exchange = name, "exchange deleted");
        Ok(())
    }

    /// The nameless exchange that routes by queue name.
    pub fn default_exchange(&self) -> Exchange {
        Exchange {
            channel: self.clone(),
            name: String::new(),
        }
    }

    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(
            &link,
            link.transport
                .bind_queue(self.id, queue, exchange, routing_key),
        )
        .await?;
        self.commit(&link).await?.topology.record(
            self.id,
            Entry::Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
        );
        debug!(channel = self.id, queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    pub async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(
            &link,
            link.transport
                .unbind_queue(self.id, queue, exchange, routing_key),
        )
        .await?;
        self.commit(&link)
            .await?
            .topology
            .remove_everywhere(&EntryKey::Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        debug!(channel = self.id, queue, exchange, routing_key, "queue unbound");
        Ok(())
    }

    /// Limit unacknowledged deliveries. A later call replaces the earlier one.
    pub async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(&link, link.transport.set_qos(self.id, prefetch_count, global))
            .await?;
        self.commit(&link).await?.topology.record(
            self.id,
            Entry::Qos {
                prefetch_count,
                global,
            },
        );
        Ok(())
    }

    /// Start consuming `queue`. Returns the effective consumer tag.
    ///
    /// The handler runs on the session's executor, one delivery at a time.
    /// Errors and panics from the handler go to the exception handler.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<String> {
        let (_serial, link) = self.begin().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = self
            .call(&link, link.transport.consume(self.id, queue, &options, tx))
            .await?;
        let mut state = self.commit(&link).await?;
        let executor = state
            .executor
            .as_ref()
            .map(|active| active.executor.clone())
            .ok_or(Error::NotConnected(state.status))?;
        state.topology.record(
            self.id,
            Entry::Consumer {
                queue: queue.to_string(),
                options: ConsumeOptions {
                    consumer_tag: tag.clone(),
                    ..options
                },
                handler: handler.clone(),
            },
        );
        drop(state);
        spawn_dispatcher(
            self.id,
            tag.clone(),
            rx,
            handler,
            executor,
            self.session.config.exception_handler.clone(),
        );
        debug!(channel = self.id, queue, consumer_tag = %tag, "consumer started");
        Ok(tag)
    }

    /// Cancel a consumer. Cancelling the last consumer of an auto-delete
    /// queue forgets the queue as well, since the broker deletes it.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let (_serial, link) = self.begin().await?;
        self.call(&link, link.transport.cancel(self.id, consumer_tag))
            .await?;
        let mut state = self.commit(&link).await?;
        let key = EntryKey::Consumer(consumer_tag.to_string());
        if let Some(Entry::Consumer { queue, .. }) = state.topology.remove(self.id, &key) {
            if state.topology.is_abandoned_auto_delete(&queue) {
                debug!(queue = %queue, "auto-delete queue lost its last consumer");
                state.topology.remove_queue(&queue);
            }
        }
        debug!(channel = self.id, consumer_tag, "consumer cancelled");
        Ok(())
    }

    /// Publish a message. Nothing is recorded and nothing is replayed after
    /// recovery.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        properties: Properties,
    ) -> Result<()> {
        let link = {
            let state = self.session.state.lock().await;
            if !state.channels.contains(&self.id) {
                return Err(Error::ChannelClosed(self.id));
            }
            self.session.link(&state)?
        };
        self.call(
            &link,
            link.transport
                .publish(self.id, exchange, routing_key, body.into(), &properties),
        )
        .await
    }

    /// Close the channel and forget its topology. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _serial = self.session.ops.lock().await;
        let link = {
            let mut state = self.session.state.lock().await;
            if !state.channels.remove(&self.id) {
                return Ok(());
            }
            state.topology.remove_channel(self.id);
            self.session.link(&state).ok()
        };
        if let Some(link) = link {
            let closed = tokio::select! {
                biased;
                _ = link.lost.cancelled() => Ok(()),
                r = link.transport.close_channel(self.id) => r,
            };
            if let Err(e) = closed {
                debug!(channel = self.id, error = %e, "broker-side channel close failed");
            }
        }
        debug!(channel = self.id, "channel closed");
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// Forward deliveries for one consumer to `executor`, one at a time.
///
/// The next delivery is not submitted until the handler has returned, so a
/// consumer sees its messages in order. Ends when the transport drops the
/// sending side.
pub(crate) fn spawn_dispatcher(
    channel: ChannelId,
    consumer_tag: String,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn DeliveryHandler>,
    executor: Arc<dyn Executor>,
    exceptions: Arc<dyn ExceptionHandler>,
) {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let (done_tx, done_rx) = oneshot::channel();
            let handler = handler.clone();
            let exceptions = exceptions.clone();
            let tag = consumer_tag.clone();
            executor.submit(Box::new(move || {
                if let Err(e) = handler::invoke(handler.as_ref(), delivery) {
                    exceptions.handle_consumer_error(channel, &tag, &e);
                }
                let _ = done_tx.send(());
            }));
            if done_rx.await.is_err() {
                warn!(channel, consumer_tag = %consumer_tag, "executor dropped a delivery");
            }
        }
        debug!(channel, consumer_tag = %consumer_tag, "consumer dispatcher finished");
    });
}

/// Handle to a declared queue.
#[derive(Clone, Debug)]
pub struct Queue {
    channel: Channel,
    name: String,
}

impl Queue {
    /// Effective name; broker-generated when declared with an empty name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Consume with a closure and default options.
    pub async fn subscribe<F>(&self, handler: F) -> Result<String>
    where
        F: Fn(Delivery) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.channel
            .consume(&self.name, Arc::new(handler), ConsumeOptions::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<String> {
        self.channel.consume(&self.name, handler, options).await
    }

    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel.bind(&self.name, exchange, routing_key).await
    }

    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel.unbind(&self.name, exchange, routing_key).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.channel.delete_queue(&self.name).await
    }

    /// Publish straight to this queue through the default exchange.
    pub async fn publish(&self, body: impl Into<Bytes>) -> Result<()> {
        self.channel
            .publish("", &self.name, body, Properties::default())
            .await
    }
}

/// Handle to an exchange; `Channel::default_exchange` for the nameless one.
#[derive(Clone, Debug)]
pub struct Exchange {
    channel: Channel,
    name: String,
}

impl Exchange {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, body: impl Into<Bytes>, routing_key: &str) -> Result<()> {
        self.publish_with(body, routing_key, Properties::default())
            .await
    }

    pub async fn publish_with(
        &self,
        body: impl Into<Bytes>,
        routing_key: &str,
        properties: Properties,
    ) -> Result<()> {
        self.channel
            .publish(&self.name, routing_key, body, properties)
            .await
    }

    pub async fn delete(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(default_exchange_refused("delete"));
        }
        self.channel.delete_exchange(&self.name).await
    }
}

fn default_exchange_refused(action: &str) -> Error {
    Error::Broker(format!(
        "ACCESS_REFUSED - operation {action} not permitted on the default exchange"
    ))
}
