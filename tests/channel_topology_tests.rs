//! Channel operations and what they leave in the recorded topology.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use warren::{
    BoxError, Channel, Config, Delivery, Entry, EntryKey, Error, ExchangeKind, ExchangeOptions,
    MemoryBroker, Properties, QueueOptions, Session, SessionStatus,
};

async fn connect(broker: &MemoryBroker) -> Session {
    Session::connect(Config::new().connector(broker.clone()))
        .await
        .unwrap()
}

async fn keys(session: &Session, ch: &Channel) -> Vec<EntryKey> {
    session
        .recorded_topology(ch.id())
        .await
        .iter()
        .map(Entry::key)
        .collect()
}

// =============================================================================
// channel numbers
// =============================================================================

#[tokio::test]
async fn channel_numbers_start_at_one_and_reuse_gaps() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let a = session.create_channel().await.unwrap();
    let b = session.create_channel().await.unwrap();
    assert_eq!((a.id(), b.id()), (1, 2));
    a.close().await.unwrap();
    a.close().await.unwrap();
    assert_eq!(session.create_channel().await.unwrap().id(), 1);
    assert_eq!(session.create_channel().await.unwrap().id(), 3);
    session.close().await.unwrap();
}

#[tokio::test]
async fn channel_limit_is_reported() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    for _ in 0..warren::session::CHANNEL_MAX {
        session.create_channel().await.unwrap();
    }
    assert!(matches!(
        session.create_channel().await,
        Err(Error::ChannelLimit(2047))
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn channels_are_unusable_after_session_close() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    session.close().await.unwrap();
    assert!(matches!(
        ch.declare_queue("q", QueueOptions::new()).await,
        Err(Error::ChannelClosed(1))
    ));
    assert!(matches!(
        session.create_channel().await,
        Err(Error::NotConnected(SessionStatus::Closed))
    ));
    ch.close().await.unwrap();
}

// =============================================================================
// recording
// =============================================================================

#[tokio::test]
async fn declarations_are_recorded_in_order() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    ch.declare_exchange("logs", ExchangeKind::Fanout, ExchangeOptions::new())
        .await
        .unwrap();
    let q = ch.declare_queue("log-sink", QueueOptions::new()).await.unwrap();
    q.bind("logs", "").await.unwrap();
    ch.set_qos(10, false).await.unwrap();
    let tag = q
        .subscribe(|_d: Delivery| -> Result<(), BoxError> { Ok(()) })
        .await
        .unwrap();

    assert_eq!(
        keys(&session, &ch).await,
        vec![
            EntryKey::Exchange("logs".into()),
            EntryKey::Queue("log-sink".into()),
            EntryKey::Binding {
                queue: "log-sink".into(),
                exchange: "logs".into(),
                routing_key: "".into(),
            },
            EntryKey::Qos,
            EntryKey::Consumer(tag),
        ]
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn passive_declarations_are_not_recorded() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    ch.declare_queue("exists", QueueOptions::new()).await.unwrap();
    let other = session.create_channel().await.unwrap();
    other
        .declare_queue("exists", QueueOptions::new().passive(true))
        .await
        .unwrap();
    assert!(session.recorded_topology(other.id()).await.is_empty());
    session.close().await.unwrap();
}

#[tokio::test]
async fn deleting_a_queue_drops_its_bindings_and_consumers() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    ch.declare_exchange("x", ExchangeKind::Direct, ExchangeOptions::new())
        .await
        .unwrap();
    let q = ch.declare_queue("doomed", QueueOptions::new()).await.unwrap();
    q.bind("x", "k").await.unwrap();
    q.subscribe(|_d: Delivery| -> Result<(), BoxError> { Ok(()) })
        .await
        .unwrap();
    q.delete().await.unwrap();

    assert_eq!(keys(&session, &ch).await, vec![EntryKey::Exchange("x".into())]);
    assert!(!broker.queue_exists("doomed"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn deleting_an_exchange_drops_its_bindings() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    let x = ch
        .declare_exchange("x", ExchangeKind::Direct, ExchangeOptions::new())
        .await
        .unwrap();
    let q = ch.declare_queue("q", QueueOptions::new()).await.unwrap();
    q.bind("x", "k").await.unwrap();
    x.delete().await.unwrap();

    assert_eq!(keys(&session, &ch).await, vec![EntryKey::Queue("q".into())]);
    assert!(!broker.exchange_exists("x"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn unbinding_removes_the_binding_entry() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    let q = ch.declare_queue("q", QueueOptions::new()).await.unwrap();
    q.bind("amq.direct", "a").await.unwrap();
    q.bind("amq.direct", "b").await.unwrap();
    q.unbind("amq.direct", "a").await.unwrap();

    assert_eq!(
        keys(&session, &ch).await,
        vec![
            EntryKey::Queue("q".into()),
            EntryKey::Binding {
                queue: "q".into(),
                exchange: "amq.direct".into(),
                routing_key: "b".into(),
            },
        ]
    );
    assert!(!broker.binding_exists("amq.direct", "q", "a"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn cancelling_last_consumer_forgets_auto_delete_queue() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    let q = ch
        .declare_queue("scratch", QueueOptions::new().auto_delete(true))
        .await
        .unwrap();
    let tag = q
        .subscribe(|_d: Delivery| -> Result<(), BoxError> { Ok(()) })
        .await
        .unwrap();
    ch.cancel(&tag).await.unwrap();

    assert!(session.recorded_topology(ch.id()).await.is_empty());
    assert!(!broker.queue_exists("scratch"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn closing_a_channel_forgets_its_topology() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    ch.declare_queue("q", QueueOptions::new()).await.unwrap();
    ch.close().await.unwrap();
    assert!(session.recorded_topology(ch.id()).await.is_empty());
    assert!(broker.queue_exists("q"));
    assert_eq!(broker.open_channels(), 0);
    session.close().await.unwrap();
}

// =============================================================================
// broker refusals
// =============================================================================

#[tokio::test]
async fn channel_level_refusals_do_not_disturb_the_session() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    ch.declare_exchange("typed", ExchangeKind::Direct, ExchangeOptions::new())
        .await
        .unwrap();

    let mismatch = ch
        .declare_exchange("typed", ExchangeKind::Fanout, ExchangeOptions::new())
        .await;
    assert!(matches!(mismatch, Err(Error::Broker(msg)) if msg.contains("PRECONDITION_FAILED")));
    let missing = ch
        .declare_queue("nope", QueueOptions::new().passive(true))
        .await;
    assert!(matches!(missing, Err(Error::Broker(msg)) if msg.contains("NOT_FOUND")));
    let unroutable = ch
        .publish("no-such-exchange", "k", "x", Properties::default())
        .await;
    assert!(matches!(unroutable, Err(Error::Broker(_))));

    assert!(session.is_connected());
    assert_eq!(session.generation().await, 1);
    assert_eq!(keys(&session, &ch).await, vec![EntryKey::Exchange("typed".into())]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn default_exchange_cannot_be_declared_or_deleted() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    assert!(matches!(
        ch.declare_exchange("", ExchangeKind::Direct, ExchangeOptions::new())
            .await,
        Err(Error::Broker(msg)) if msg.starts_with("ACCESS_REFUSED")
    ));
    assert!(matches!(
        ch.default_exchange().delete().await,
        Err(Error::Broker(msg)) if msg.starts_with("ACCESS_REFUSED")
    ));
    assert!(session.is_connected());
    assert!(session.recorded_topology(ch.id()).await.is_empty());
    session.close().await.unwrap();
}

// =============================================================================
// delivery
// =============================================================================

#[tokio::test]
async fn properties_reach_the_consumer() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    let q = ch
        .declare_queue("", QueueOptions::new().exclusive(true))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    q.subscribe(move |d: Delivery| -> Result<(), BoxError> {
        let _ = tx.send(d);
        Ok(())
    })
    .await
    .unwrap();

    ch.default_exchange()
        .publish_with(
            "payload",
            q.name(),
            Properties::new()
                .content_type("text/plain")
                .correlation_id("abc")
                .header("trace", "t-1"),
        )
        .await
        .unwrap();
    let d = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(d.body, Bytes::from_static(b"payload"));
    assert_eq!(d.routing_key, q.name());
    assert_eq!(d.delivery_tag, 1);
    assert_eq!(d.properties.content_type.as_deref(), Some("text/plain"));
    assert_eq!(d.properties.get_header("trace"), Some("t-1"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn messages_published_before_subscribing_are_delivered_in_order() {
    let broker = MemoryBroker::new();
    let session = connect(&broker).await;
    let ch = session.create_channel().await.unwrap();
    let q = ch.declare_queue("backlog", QueueOptions::new()).await.unwrap();
    for i in 0..5 {
        ch.default_exchange()
            .publish(format!("m{i}"), "backlog")
            .await
            .unwrap();
    }
    assert_eq!(broker.message_count("backlog"), 5);

    let (tx, mut rx) = mpsc::unbounded_channel();
    q.subscribe(move |d: Delivery| -> Result<(), BoxError> {
        let _ = tx.send(d.body);
        Ok(())
    })
    .await
    .unwrap();
    for i in 0..5 {
        let body = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, Bytes::from(format!("m{i}")));
    }
    session.close().await.unwrap();
}
