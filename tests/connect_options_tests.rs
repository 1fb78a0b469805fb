//! Tests for the options accepted by `Session::connect`.
//!
//! Each test runs against an in-process `MemoryBroker` so failures (unknown
//! hosts, stopped nodes, rejected credentials, unresponsive nodes) can be
//! arranged deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use warren::executor::{DefaultThreadFactory, Task};
use warren::{
    BoxError, ChannelId, Config, Delivery, Error, ExceptionHandler, Executor, HandlerError,
    MemoryBroker, QueueOptions, Session, SessionStatus, ThreadFactory, ThreadPool, TransportError,
};

fn config(broker: &MemoryBroker) -> Config {
    Config::new().connector(broker.clone())
}

// =============================================================================
// heartbeat / timeout / TLS
// =============================================================================

#[tokio::test]
async fn connect_with_requested_heartbeat() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker).requested_heartbeat(10))
        .await
        .unwrap();
    assert!(session.is_connected());
    assert_eq!(
        session.negotiated_heartbeat().await,
        Some(Duration::from_secs(10))
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn heartbeat_disabled_by_default() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker)).await.unwrap();
    assert_eq!(session.negotiated_heartbeat().await, None);
    session.close().await.unwrap();
}

#[tokio::test]
async fn broker_proposal_caps_requested_heartbeat() {
    let broker = MemoryBroker::new();
    broker.set_server_heartbeat(5);
    let session = Session::connect(config(&broker).requested_heartbeat(30))
        .await
        .unwrap();
    assert_eq!(
        session.negotiated_heartbeat().await,
        Some(Duration::from_secs(5))
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn connect_with_connection_timeout() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker).connection_timeout(3))
        .await
        .unwrap();
    assert!(session.is_connected());
    assert_eq!(
        session.config().connection_timeout,
        Duration::from_secs(3)
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn unresponsive_host_times_out() {
    let broker = MemoryBroker::new();
    broker.blackhole_node("localhost");
    let started = Instant::now();
    let result = Session::connect(
        config(&broker).connection_timeout_duration(Duration::from_millis(150)),
    )
    .await;
    match result {
        Err(Error::ConnectionRefused(TransportError::Timeout(_))) => {}
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn connect_over_tls_uses_tls_port() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker).tls(true)).await.unwrap();
    assert_eq!(session.current_endpoint().await.unwrap().port, 5671);
    session.close().await.unwrap();
}

#[tokio::test]
async fn tls_against_plain_port_fails() {
    let broker = MemoryBroker::new();
    let result = Session::connect(config(&broker).tls(true).port(5672)).await;
    match result {
        Err(Error::ConnectionRefused(TransportError::Io(_))) => {}
        other => panic!("expected io error, got {:?}", other.map(|_| ())),
    }
}

// =============================================================================
// unreachable hosts and credentials
// =============================================================================

#[tokio::test]
async fn unknown_host_is_refused() {
    let broker = MemoryBroker::new();
    let result = Session::connect(config(&broker).hostname("a8s878787s8d78sd78.lol")).await;
    assert!(matches!(result, Err(Error::ConnectionRefused(_))));
}

#[tokio::test]
async fn stopped_node_is_refused() {
    let broker = MemoryBroker::new();
    broker.stop_node("localhost");
    let result = Session::connect(config(&broker)).await;
    assert!(matches!(
        result,
        Err(Error::ConnectionRefused(TransportError::Refused(_)))
    ));
}

#[tokio::test]
async fn wrong_port_is_refused() {
    let broker = MemoryBroker::new();
    let result = Session::connect(config(&broker).port(4567)).await;
    assert!(matches!(result, Err(Error::ConnectionRefused(_))));
}

#[tokio::test]
async fn bad_credentials_fail_without_trying_other_hosts() {
    let broker = MemoryBroker::new();
    broker.add_node("backup");
    let result = Session::connect(
        config(&broker)
            .hosts(["localhost", "backup"])
            .username("guest")
            .password("ugggessssss"),
    )
    .await;
    assert!(matches!(result, Err(Error::AuthenticationFailure(_))));
    assert_eq!(broker.connection_attempts("localhost"), 1);
    assert_eq!(broker.connection_attempts("backup"), 0);
}

#[tokio::test]
async fn hosts_are_tried_in_order() {
    let broker = MemoryBroker::new();
    broker.add_node("second");
    let session = Session::connect(config(&broker).hosts(["dead-host", "second", "localhost"]))
        .await
        .unwrap();
    assert_eq!(session.current_endpoint().await.unwrap().host, "second");
    assert_eq!(broker.connection_attempts("dead-host"), 1);
    assert_eq!(broker.connection_attempts("localhost"), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn unresponsive_first_host_fails_over_to_next() {
    let broker = MemoryBroker::new();
    broker.add_node("slow");
    broker.blackhole_node("slow");
    let session = Session::connect(
        config(&broker)
            .hosts(["slow", "localhost"])
            .connection_timeout_duration(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    assert_eq!(session.current_endpoint().await.unwrap().host, "localhost");
    session.close().await.unwrap();
}

// =============================================================================
// executors and thread factories
// =============================================================================

#[tokio::test]
async fn executor_factory_invoked_once_per_connect_and_recovery() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let session = Session::connect(config(&broker).executor_factory(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(ThreadPool::new(2).unwrap()) as Arc<dyn Executor>
    }))
    .await
    .unwrap();
    session.close().await.unwrap();
    session.automatically_recover().await.unwrap();
    assert!(session.is_connected());
    session.close().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn thread_pool_size_survives_close_and_recover() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker).thread_pool_size(20))
        .await
        .unwrap();
    session.close().await.unwrap();
    assert!(!session.is_connected());
    session.automatically_recover().await.unwrap();
    assert!(session.is_connected());
    session.close().await.unwrap();
}

#[tokio::test]
async fn list_of_hosts_survives_close_and_recover() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker).hosts(["127.0.0.1", "localhost"]))
        .await
        .unwrap();
    assert_eq!(session.current_endpoint().await.unwrap().host, "localhost");
    session.close().await.unwrap();
    assert!(!session.is_connected());
    session.automatically_recover().await.unwrap();
    assert!(session.is_connected());
    session.close().await.unwrap();
}

struct CountingFactory(AtomicUsize);

impl ThreadFactory for CountingFactory {
    fn new_thread(&self, name: String, body: Task) -> std::io::Result<JoinHandle<()>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        DefaultThreadFactory.new_thread(name, body)
    }
}

#[tokio::test]
async fn thread_factory_creates_handler_threads() {
    let broker = MemoryBroker::new();
    let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
    let session = Session::connect(
        config(&broker)
            .thread_factory(factory.clone())
            .thread_pool_size(2),
    )
    .await
    .unwrap();
    assert_eq!(factory.0.load(Ordering::SeqCst), 2);

    let ch = session.create_channel().await.unwrap();
    let q = ch
        .declare_queue("", QueueOptions::new().exclusive(true))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    q.subscribe(move |_d: Delivery| -> Result<(), BoxError> {
        let name = std::thread::current().name().map(str::to_string);
        let _ = tx.send(name);
        Ok(())
    })
    .await
    .unwrap();
    ch.default_exchange().publish("hi", q.name()).await.unwrap();

    let name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(name.unwrap().starts_with("warren-pool-"));
    session.close().await.unwrap();
}

// =============================================================================
// exception handler
// =============================================================================

struct Recording(mpsc::UnboundedSender<(ChannelId, String, String)>);

impl ExceptionHandler for Recording {
    fn handle_consumer_error(&self, channel: ChannelId, consumer_tag: &str, error: &HandlerError) {
        let _ = self
            .0
            .send((channel, consumer_tag.to_string(), error.to_string()));
    }
}

#[tokio::test]
async fn exception_handler_sees_consumer_failures() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = Session::connect(config(&broker).exception_handler(Arc::new(Recording(tx))))
        .await
        .unwrap();
    let ch = session.create_channel().await.unwrap();
    let q = ch
        .declare_queue("", QueueOptions::new().exclusive(true))
        .await
        .unwrap();
    let tag = q
        .subscribe(|_d: Delivery| -> Result<(), BoxError> { Err("bad payload".into()) })
        .await
        .unwrap();
    ch.default_exchange().publish("", q.name()).await.unwrap();

    let (channel, seen_tag, error) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel, ch.id());
    assert_eq!(seen_tag, tag);
    assert!(error.contains("bad payload"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = Session::connect(config(&broker).exception_handler(Arc::new(Recording(tx))))
        .await
        .unwrap();
    let ch = session.create_channel().await.unwrap();
    let q = ch.declare_queue("panicky", QueueOptions::new()).await.unwrap();
    q.subscribe(|_d: Delivery| -> Result<(), BoxError> { panic!("handler blew up") })
        .await
        .unwrap();
    ch.default_exchange().publish("one", "panicky").await.unwrap();
    ch.default_exchange().publish("two", "panicky").await.unwrap();

    for _ in 0..2 {
        let (_, _, error) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(error.contains("handler blew up"));
    }
    assert!(session.is_connected());
    session.close().await.unwrap();
}

// =============================================================================
// start
// =============================================================================

#[tokio::test]
async fn start_is_idempotent() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker)).await.unwrap();
    for _ in 0..100 {
        session.start().await.unwrap();
    }
    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(session.generation().await, 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn start_after_close_is_rejected() {
    let broker = MemoryBroker::new();
    let session = Session::connect(config(&broker)).await.unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(matches!(
        session.start().await,
        Err(Error::NotConnected(SessionStatus::Closed))
    ));
}
