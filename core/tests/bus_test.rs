use mosaic_core::bus::{BusConfig, BusError, Callback, MessageBus, PublishOptions, Subscription};
use mosaic_core::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// Records the subjects a callback saw
fn recorder() -> (Callback, Arc<parking_lot::Mutex<Vec<String>>>) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb = Callback::infallible(move |m| sink.lock().push(m.subject.clone()));
    (cb, seen)
}

#[test]
fn exact_and_wildcard_delivery() -> Result<()> {
    let bus = MessageBus::default();
    let (exact, exact_seen) = recorder();
    let (wild, wild_seen) = recorder();
    let (other, other_seen) = recorder();

    bus.subscribe("user.login", exact);
    bus.subscribe("user.*", wild);
    bus.subscribe("order.created", other);

    bus.publish("user.login", json!({"id": 1}), PublishOptions::default())?;
    bus.publish("user.logout", json!({"id": 1}), PublishOptions::default())?;
    bus.publish("user", json!(null), PublishOptions::default())?;

    assert_eq!(*exact_seen.lock(), vec!["user.login"]);
    assert_eq!(*wild_seen.lock(), vec!["user.login", "user.logout"]);
    assert!(other_seen.lock().is_empty());
    Ok(())
}

#[test]
fn match_all_sees_everything() -> Result<()> {
    let bus = MessageBus::default();
    let (all, seen) = recorder();
    bus.subscribe("*", all);

    bus.publish("a", json!(1), PublishOptions::default())?;
    bus.publish("b.c.d", json!(2), PublishOptions::default())?;
    assert_eq!(*seen.lock(), vec!["a", "b.c.d"]);
    Ok(())
}

#[test]
fn unsubscribe_is_idempotent() -> Result<()> {
    let bus = MessageBus::default();
    let (cb, seen) = recorder();
    let sub = bus.subscribe("user.login", cb.clone());

    sub.unsubscribe();
    sub.unsubscribe();
    bus.unsubscribe("user.login", &cb);
    bus.unsubscribe("never.registered", &cb);

    bus.publish("user.login", json!({}), PublishOptions::default())?;
    assert!(seen.lock().is_empty());
    assert_eq!(bus.pattern_count(), 0);
    Ok(())
}

#[test]
fn subscriber_failures_do_not_stop_delivery() -> Result<()> {
    let bus = MessageBus::default();
    bus.subscribe("job", Callback::new(|_| Err("boom".into())));
    bus.subscribe("job", Callback::infallible(|_| panic!("subscriber panic")));
    let (cb, seen) = recorder();
    bus.subscribe("job", cb);

    let id = bus.publish("job", json!({}), PublishOptions::default())?;
    assert!(!id.is_empty());
    assert_eq!(*seen.lock(), vec!["job"]);
    Ok(())
}

#[test]
fn unsubscribing_inside_a_callback_is_safe() -> Result<()> {
    let bus = MessageBus::default();
    let slot: Arc<parking_lot::Mutex<Option<Subscription>>> = Arc::new(parking_lot::Mutex::new(None));
    let hits = Arc::new(parking_lot::Mutex::new(0));

    let (slot2, hits2) = (slot.clone(), hits.clone());
    let sub = bus.subscribe(
        "once",
        Callback::infallible(move |_| {
            *hits2.lock() += 1;
            if let Some(sub) = slot2.lock().as_ref() {
                sub.unsubscribe();
            }
        }),
    );
    *slot.lock() = Some(sub);
    let (later, later_seen) = recorder();
    bus.subscribe("once", later);

    bus.publish("once", json!(1), PublishOptions::default())?;
    bus.publish("once", json!(2), PublishOptions::default())?;

    assert_eq!(*hits.lock(), 1);
    // The snapshot of the first publish still reached the later subscriber.
    assert_eq!(later_seen.lock().len(), 2);
    Ok(())
}

#[test]
fn empty_subject_is_rejected() {
    let bus = MessageBus::default();
    assert_eq!(
        bus.publish("", json!(1), PublishOptions::default()),
        Err(BusError::EmptySubject)
    );
    assert_eq!(bus.history_len(), 0);
}

#[test]
fn history_is_bounded_and_newest_first() -> Result<()> {
    let bus = MessageBus::default();
    for i in 0..150 {
        bus.publish("tick", json!(i), PublishOptions::default())?;
    }
    assert_eq!(bus.history_len(), 100);

    let recent = bus.event_history(100);
    assert_eq!(recent.len(), 100);
    assert_eq!(recent[0].data, json!(149));
    assert_eq!(recent[99].data, json!(50));

    assert_eq!(bus.recent().len(), 50);
    assert_eq!(bus.event_history(3).len(), 3);

    bus.clear_event_history();
    assert!(bus.event_history(10).is_empty());
    Ok(())
}

#[test]
fn publish_records_source() -> Result<()> {
    let bus = MessageBus::default();
    bus.publish("a", json!(1), PublishOptions::default())?;
    bus.publish("b", json!(2), PublishOptions::default().source("navbar"))?;
    let history = bus.event_history(2);
    assert_eq!(history[0].source, "navbar");
    assert_eq!(history[1].source, "unknown");
    Ok(())
}

#[tokio::test]
async fn request_reply_round_trip() -> Result<()> {
    let bus = MessageBus::default();
    let responder = bus.clone();
    bus.subscribe(
        "math.double",
        Callback::new(move |m| {
            let n = m.data.as_i64().unwrap_or(0);
            responder
                .reply(m, json!(n * 2))
                .map(|_| ())
                .map_err(|e| e.to_string().into())
        }),
    );

    let reply = timeout(
        Duration::from_secs(1),
        bus.request_with_timeout("math.double", json!(21), Duration::from_millis(500)),
    )
    .await
    .expect("request should finish")?;

    assert_eq!(reply.data, json!(42));
    assert_eq!(bus.pattern_count(), 1, "reply subscription must be removed");
    Ok(())
}

#[tokio::test]
async fn request_waits_for_a_deferred_reply() -> Result<()> {
    let bus = MessageBus::default();
    let responder = bus.clone();
    bus.subscribe(
        "profile.load",
        Callback::infallible(move |m| {
            let bus = responder.clone();
            let request = m.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = bus.reply(&request, json!({"user": request.data["user"]}));
            });
        }),
    );

    let started = tokio::time::Instant::now();
    let reply = bus
        .request_with_timeout("profile.load", json!({"user": "ada"}), Duration::from_millis(500))
        .await?;
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(reply.data, json!({"user": "ada"}));
    assert_eq!(bus.pattern_count(), 1, "reply subscription must be removed");
    Ok(())
}

#[tokio::test]
async fn request_times_out_without_residue() {
    let bus = MessageBus::new(BusConfig {
        request_timeout: Duration::from_millis(50),
        ..BusConfig::default()
    });

    let started = tokio::time::Instant::now();
    let err = bus.request("nobody.home", json!({})).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(
        err,
        BusError::RequestTimeout {
            subject: "nobody.home".into(),
            timeout_ms: 50
        }
    );
    assert_eq!(bus.pattern_count(), 0);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn late_reply_after_timeout_is_ignored() -> Result<()> {
    let bus = MessageBus::default();
    let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = requests.clone();
    bus.subscribe(
        "slow",
        Callback::infallible(move |m| sink.lock().push(m.clone())),
    );

    let err = bus
        .request_with_timeout("slow", json!({}), Duration::from_millis(20))
        .await;
    assert!(err.is_err());

    let request = requests.lock()[0].clone();
    assert!(request.reply_to.as_deref().unwrap_or("").starts_with("_REPLY."));
    // Nobody listens on the reply subject any more.
    bus.reply(&request, json!("late"))?;
    assert_eq!(bus.pattern_count(), 1);
    Ok(())
}
