use std::time::Duration;
use warren::{BoxError, Config, Delivery, MemoryBroker, QueueOptions, Session};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=warren=debug shows every state transition.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Two broker nodes in-process; the session prefers "primary".
    let broker = MemoryBroker::new();
    broker.add_node("primary");
    broker.add_node("secondary");

    let session = Session::connect(
        Config::new()
            .hosts(["primary", "secondary"])
            .requested_heartbeat(2)
            .network_recovery_interval(Duration::from_millis(200))
            .connector(broker.clone()),
    )
    .await?;
    println!("connected to {:?}", session.current_endpoint().await);

    let ch = session.create_channel().await?;
    let q = ch
        .declare_queue("", QueueOptions::new().exclusive(true))
        .await?;
    q.subscribe(|d: Delivery| -> Result<(), BoxError> {
        println!("received {:?}", String::from_utf8_lossy(&d.body));
        Ok(())
    })
    .await?;
    ch.default_exchange().publish("before failover", q.name()).await?;

    // Take the primary down and wait for the session to move.
    let mut status = session.watch_status();
    broker.stop_node("primary");
    status.wait_for(|s| *s == warren::SessionStatus::Recovering).await?;
    status.wait_for(|s| *s == warren::SessionStatus::Connected).await?;
    println!(
        "recovered on {:?}, channel {} and queue {} unchanged",
        session.current_endpoint().await,
        ch.id(),
        q.name()
    );

    ch.default_exchange().publish("after failover", q.name()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.close().await?;
    Ok(())
}
