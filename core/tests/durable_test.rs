use bytes::Bytes;
use mosaic_core::durable::{
    ConnectionError, ConnectionState, DurableBus, DurableConfig, MemoryTransport, NavigationMessage,
    SubscriptionError,
};
use mosaic_core::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> DurableConfig {
    DurableConfig {
        reconnect_wait: Duration::from_millis(50),
        pull_interval: Duration::from_millis(10),
        pull_expires: Duration::from_millis(50),
        max_deliver: 3,
        ..DurableConfig::default()
    }
}

async fn wait_until(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[test]
fn navigation_payload_format() {
    let entering = NavigationMessage::new("entering", "blogApp", None);
    assert_eq!(
        serde_json::to_value(&entering).unwrap(),
        serde_json::json!({"action": "entering", "page": "blogApp"})
    );

    let leaving = NavigationMessage::new("leaving", "blogApp", Some(Duration::from_micros(1_499_600)));
    assert_eq!(
        serde_json::to_value(&leaving).unwrap(),
        serde_json::json!({"action": "leaving", "page": "blogApp", "durationMs": 1500})
    );
}

#[tokio::test]
async fn concurrent_connects_are_coalesced() -> Result<()> {
    let transport = MemoryTransport::new();
    transport.set_connect_delay(Duration::from_millis(50));
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());

    let attempts = (0..5).map(|_| bus.ensure_connection());
    let results = futures::future::join_all(attempts).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(bus.state(), ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn publish_while_unreachable_returns_none() -> Result<()> {
    let transport = MemoryTransport::new();
    transport.set_reachable(false);
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let client = bus.attach();

    assert_eq!(client.publish_message("entering", "homeApp", None).await, None);
    assert!(!bus.is_connected());
    assert!(transport.entries().is_empty());

    // The failed attempt is forgotten; the next publish connects afresh.
    transport.set_reachable(true);
    let ack = client.publish_message("entering", "homeApp", None).await;
    assert_eq!(ack.map(|a| a.seq), Some(1));
    Ok(())
}

#[tokio::test]
async fn delivery_resumes_after_reconnect() -> Result<()> {
    let transport = MemoryTransport::new();
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let client = bus.attach();

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    let sub = client
        .subscribe_to_messages(move |m| {
            sink.lock().push(m.page);
            Ok(())
        })
        .await
        .expect("consumer should start");

    assert!(client.publish_message("entering", "homeApp", None).await.is_some());
    assert!(wait_until(Duration::from_secs(1), || received.lock().len() == 1).await);

    transport.set_reachable(false);
    transport.drop_connections("server restart");
    let mut state = bus.watch_state();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .expect("should notice the drop")
    .expect("state channel open");

    assert_eq!(client.publish_message("entering", "blogApp", None).await, None);
    assert!(matches!(
        bus.ensure_connection().await,
        Err(ConnectionError::Reconnecting)
    ));

    transport.set_reachable(true);
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("should reconnect")
    .expect("state channel open");

    assert!(client.publish_message("entering", "contactApp", None).await.is_some());
    assert!(wait_until(Duration::from_secs(1), || received.lock().len() == 2).await);
    assert_eq!(*received.lock(), vec!["homeApp", "contactApp"]);
    assert!(sub.is_active());
    Ok(())
}

#[tokio::test]
async fn ack_policy() -> Result<()> {
    let transport = MemoryTransport::new();
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let client = bus.attach();

    let flaky = Arc::new(AtomicUsize::new(0));
    let broken = Arc::new(AtomicUsize::new(0));
    let fine = Arc::new(AtomicUsize::new(0));
    let (f, b, ok) = (flaky.clone(), broken.clone(), fine.clone());
    let sub = client
        .subscribe_to_messages(move |m| match m.page.as_str() {
            "flaky" => {
                if f.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".into())
                } else {
                    Ok(())
                }
            }
            "broken" => {
                b.fetch_add(1, Ordering::SeqCst);
                Err("always".into())
            }
            _ => {
                ok.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .expect("consumer should start");
    let name = sub.name().to_string();

    client.publish_message("click", "flaky", None).await;
    client.publish_message("click", "broken", None).await;
    client.publish_message("click", "fine", None).await;
    let conn = bus.live_connection().expect("connected");
    conn.publish(&bus.config().subject, Bytes::from_static(b"{not json"))
        .await?;

    let t = Duration::from_secs(2);
    assert!(wait_until(t, || flaky.load(Ordering::SeqCst) == 3).await);
    assert!(wait_until(t, || broken.load(Ordering::SeqCst) == 3).await);
    assert!(wait_until(t, || transport.pending(&name) == Some(0)).await);

    // Nothing comes back once everything was acked, termed or exhausted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(flaky.load(Ordering::SeqCst), 3);
    assert_eq!(broken.load(Ordering::SeqCst), 3);
    assert_eq!(fine.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn resubscribing_replaces_the_consumer() -> Result<()> {
    let transport = MemoryTransport::new();
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let client = bus.attach();

    let first = client.subscribe_to_messages(|_| Ok(())).await.expect("first");
    let second = client.subscribe_to_messages(|_| Ok(())).await.expect("second");

    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(transport.consumer_names(), vec![second.name().to_string()]);

    second.unsubscribe().await;
    second.unsubscribe().await;
    assert!(transport.consumer_names().is_empty());
    Ok(())
}

#[tokio::test]
async fn connection_closes_with_last_client() -> Result<()> {
    let transport = MemoryTransport::new();
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());

    let first = bus.attach();
    let second = bus.attach();
    bus.ensure_connection().await?;
    assert_eq!(bus.client_count(), 2);

    drop(first);
    assert_eq!(bus.client_count(), 1);
    assert_eq!(bus.state(), ConnectionState::Connected);

    second.detach().await;
    assert_eq!(bus.client_count(), 0);
    assert_eq!(bus.state(), ConnectionState::Closed);
    assert!(wait_until(Duration::from_secs(1), || transport.open_connections() == 0).await);
    assert_eq!(transport.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn subscription_errors_are_observable() -> Result<()> {
    let transport = MemoryTransport::new();
    transport.set_reachable(false);
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let client = bus.attach();
    let errors = client.watch_error();

    assert!(client.subscribe_to_messages(|_| Ok(())).await.is_none());
    assert!(matches!(
        client.last_error(),
        Some(SubscriptionError::Connection(ConnectionError::Unreachable { .. }))
    ));
    assert!(errors.has_changed().unwrap_or(false));

    transport.set_reachable(true);
    let sub = client
        .subscribe_to_messages(|_| Ok(()))
        .await
        .expect("consumer should start");
    assert_eq!(client.last_error(), None);
    assert!(client.is_subscribed());

    // Pull failures while the server is away are reported...
    transport.set_reachable(false);
    transport.drop_connections("server restart");
    assert!(wait_until(Duration::from_secs(1), || client.last_error().is_some()).await);
    assert!(sub.is_active());

    // ...and cleared once the consumer pulls again.
    transport.set_reachable(true);
    assert!(wait_until(Duration::from_secs(2), || client.last_error().is_none()).await);

    sub.unsubscribe().await;
    assert!(!client.is_subscribed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_keeps_a_single_connection_under_load() -> Result<()> {
    let transport = MemoryTransport::new();
    let bus = DurableBus::new(Arc::new(transport.clone()), fast_config());
    let _client = bus.attach();
    bus.ensure_connection().await?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut callers = Vec::new();
    for _ in 0..4 {
        let bus = bus.clone();
        let stop = stop.clone();
        callers.push(tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let _ = bus.ensure_connection().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    for _ in 0..3 {
        transport.drop_connections("server restart");
        assert!(
            wait_until(Duration::from_secs(2), || {
                bus.state() == ConnectionState::Connected && bus.is_connected()
            })
            .await
        );
    }
    stop.store(true, Ordering::SeqCst);
    for caller in callers {
        caller.await.expect("caller task");
    }

    assert_eq!(transport.open_connections(), 1);
    assert_eq!(transport.connect_count(), 4);
    Ok(())
}
