//! Durable bus adapter for cross-application navigation telemetry.
//!
//! [`DurableBus`] owns the single connection shared by every attached
//! [`DurableClient`]. Connection attempts are coalesced, a dropped connection
//! is re-established forever with a fixed delay, and the connection is closed
//! once the last client detaches.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod transport;

pub use memory::{MemoryTransport, StreamEntry};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use transport::{
    ConnectOptions, ConnectionError, ConsumerConfig, DeliveredMessage, DurableConnection,
    DurableTransport, PubAck, PullConsumer, SubscriptionError,
};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::CallbackError;

/// Navigation telemetry payload carried on the durable subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationMessage {
    pub action: String,
    pub page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl NavigationMessage {
    pub fn new(action: &str, page: &str, duration: Option<Duration>) -> Self {
        Self {
            action: action.to_string(),
            page: page.to_string(),
            duration_ms: duration.map(|d| (d.as_secs_f64() * 1000.0).round() as u64),
        }
    }
}

/// Durable adapter configuration
#[derive(Clone, Debug)]
pub struct DurableConfig {
    pub server: String,
    pub client_name: String,
    /// Stream capturing `subject`.
    pub stream: String,
    pub subject: String,
    pub consumer_base: String,
    pub reconnect_wait: Duration,
    pub pull_batch: usize,
    pub pull_expires: Duration,
    pub pull_interval: Duration,
    pub max_deliver: u32,
    pub ack_wait: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            server: "ws://localhost:8080".to_string(),
            client_name: "mosaic-shell".to_string(),
            stream: memory::DEFAULT_STREAM.to_string(),
            subject: "app.navigation".to_string(),
            consumer_base: "mosaicNavConsumer".to_string(),
            reconnect_wait: Duration::from_millis(5000),
            pull_batch: 10,
            pull_expires: Duration::from_millis(2000),
            pull_interval: Duration::from_millis(3000),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
        }
    }
}

impl DurableConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let ms = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            server: std::env::var("MOSAIC_DURABLE_SERVER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(default.server),
            client_name: default.client_name,
            stream: std::env::var("MOSAIC_DURABLE_STREAM")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(default.stream),
            subject: std::env::var("MOSAIC_DURABLE_SUBJECT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(default.subject),
            consumer_base: default.consumer_base,
            reconnect_wait: ms("MOSAIC_DURABLE_RECONNECT_MS", default.reconnect_wait),
            pull_batch: default.pull_batch,
            pull_expires: ms("MOSAIC_DURABLE_PULL_EXPIRES_MS", default.pull_expires),
            pull_interval: ms("MOSAIC_DURABLE_PULL_INTERVAL_MS", default.pull_interval),
            max_deliver: std::env::var("MOSAIC_DURABLE_MAX_DELIVER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_deliver),
            ack_wait: default.ack_wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

type ConnectAttempt =
    Shared<BoxFuture<'static, Result<Arc<dyn DurableConnection>, ConnectionError>>>;

struct Inner {
    transport: Arc<dyn DurableTransport>,
    config: DurableConfig,
    connection: Mutex<Option<Arc<dyn DurableConnection>>>,
    inflight: Mutex<Option<ConnectAttempt>>,
    state: watch::Sender<ConnectionState>,
    clients: AtomicUsize,
    // Bumped on every deliberate shutdown; stale reconnect loops exit.
    epoch: AtomicU64,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(target: "durable", from = ?prev, to = ?next, "Status");
        }
    }

    fn options(&self) -> ConnectOptions {
        ConnectOptions {
            server: self.config.server.clone(),
            name: self.config.client_name.clone(),
        }
    }

    fn live(&self) -> Option<Arc<dyn DurableConnection>> {
        self.connection
            .lock()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }
}

/// Connection manager for the durable bus. Clones share one connection.
#[derive(Clone)]
pub struct DurableBus {
    inner: Arc<Inner>,
}

impl DurableBus {
    pub fn new(transport: Arc<dyn DurableTransport>, config: DurableConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                connection: Mutex::new(None),
                inflight: Mutex::new(None),
                state,
                clients: AtomicUsize::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DurableConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.live().is_some()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.load(Ordering::SeqCst)
    }

    /// The live connection, if any, without attempting to connect.
    pub fn live_connection(&self) -> Option<Arc<dyn DurableConnection>> {
        self.inner.live()
    }

    /// Return the live connection, joining or starting a connect attempt.
    ///
    /// Concurrent callers share one attempt. A failed attempt is forgotten so
    /// the next call retries; while a dropped connection is being
    /// re-established this fails fast with [`ConnectionError::Reconnecting`].
    pub async fn ensure_connection(&self) -> Result<Arc<dyn DurableConnection>, ConnectionError> {
        {
            let current = self.inner.connection.lock();
            if let Some(conn) = current.as_ref() {
                // A lost connection stays installed until the supervisor
                // notices; it owns reconnection from here.
                return if conn.is_closed() {
                    Err(ConnectionError::Reconnecting)
                } else {
                    Ok(conn.clone())
                };
            }
        }
        if self.state() == ConnectionState::Reconnecting {
            return Err(ConnectionError::Reconnecting);
        }

        let attempt = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = connect_once(self.inner.clone()).boxed().shared();
                    *inflight = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Register a logical subscriber. The connection is opened in the
    /// background and stays open while at least one client is attached.
    pub fn attach(&self) -> DurableClient {
        let count = self.inner.clients.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "durable", clients = count, "Client attached");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let bus = self.clone();
            handle.spawn(async move {
                if let Err(e) = bus.ensure_connection().await {
                    warn!(target: "durable", error = %e, "Failed to connect on attach");
                }
            });
        }

        let (error, _) = watch::channel(None);
        DurableClient {
            bus: self.clone(),
            active: Mutex::new(None),
            error: Arc::new(error),
        }
    }

    fn release(&self) {
        let prev = self.inner.clients.fetch_sub(1, Ordering::SeqCst);
        debug!(target: "durable", clients = prev.saturating_sub(1), "Client detached");
        if prev == 1 {
            self.shutdown();
        }
    }

    /// Close the connection and stop reconnecting. A later
    /// [`ensure_connection`](Self::ensure_connection) connects afresh.
    pub fn shutdown(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.inflight.lock().take();
        let conn = self.inner.connection.lock().take();
        self.inner.set_state(ConnectionState::Closed);

        if let Some(conn) = conn {
            info!(target: "durable", "All clients detached, closing connection");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { conn.close().await });
                }
                Err(_) => warn!(target: "durable", "No runtime available to close connection"),
            }
        }
    }
}

async fn connect_once(inner: Arc<Inner>) -> Result<Arc<dyn DurableConnection>, ConnectionError> {
    let epoch = inner.epoch.load(Ordering::SeqCst);
    inner.set_state(ConnectionState::Connecting);
    info!(target: "durable", server = %inner.config.server, "Attempting to connect");

    let result = inner.transport.connect(&inner.options()).await;
    if inner.epoch.load(Ordering::SeqCst) == epoch {
        inner.inflight.lock().take();
    }

    let conn = match result {
        Ok(conn) => conn,
        Err(e) => {
            error!(target: "durable", error = %e, "Connection error");
            if inner.epoch.load(Ordering::SeqCst) == epoch {
                inner.set_state(ConnectionState::Disconnected);
            }
            return Err(e);
        }
    };

    // Shut down while we were connecting.
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        conn.close().await;
        return Err(ConnectionError::Shutdown);
    }

    *inner.connection.lock() = Some(conn.clone());
    inner.set_state(ConnectionState::Connected);
    info!(target: "durable", "Connected");
    spawn_supervisor(inner, conn.clone(), epoch);
    Ok(conn)
}

// Watches the live connection and re-establishes it, forever, with a fixed
// delay between attempts.
fn spawn_supervisor(inner: Arc<Inner>, conn: Arc<dyn DurableConnection>, epoch: u64) {
    tokio::spawn(async move {
        let mut conn = conn;
        loop {
            let reason = conn.closed().await;
            if inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            // Enter Reconnecting before releasing the lost connection so
            // callers never see Connected without one.
            if reason.is_some() {
                inner.set_state(ConnectionState::Reconnecting);
            }
            {
                let mut current = inner.connection.lock();
                if current.as_ref().is_some_and(|c| same_connection(c, &conn)) {
                    current.take();
                }
            }
            let Some(reason) = reason else {
                inner.set_state(ConnectionState::Disconnected);
                return;
            };

            warn!(target: "durable", error = %reason, "Connection closed, reconnecting");
            conn.close().await;

            let mut attempt: u64 = 0;
            conn = loop {
                tokio::time::sleep(inner.config.reconnect_wait).await;
                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                attempt += 1;
                match inner.transport.connect(&inner.options()).await {
                    Ok(next) => {
                        if inner.epoch.load(Ordering::SeqCst) != epoch {
                            next.close().await;
                            return;
                        }
                        *inner.connection.lock() = Some(next.clone());
                        inner.set_state(ConnectionState::Connected);
                        info!(target: "durable", attempt, "Reconnected");
                        break next;
                    }
                    Err(e) => {
                        warn!(target: "durable", attempt, error = %e, "Reconnect attempt failed")
                    }
                }
            };
        }
    });
}

fn same_connection(a: &Arc<dyn DurableConnection>, b: &Arc<dyn DurableConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// Disambiguates consumers created within the same millisecond.
static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

type NavigationHandler = dyn Fn(NavigationMessage) -> Result<(), CallbackError> + Send + Sync;

/// A logical subscriber of the durable bus. Dropping it stops its pull
/// consumer and releases its share of the connection.
pub struct DurableClient {
    bus: DurableBus,
    active: Mutex<Option<PullSubscription>>,
    error: Arc<ErrorState>,
}

type ErrorState = watch::Sender<Option<SubscriptionError>>;

fn record_error(state: &ErrorState, error: SubscriptionError) {
    state.send_replace(Some(error));
}

fn clear_error(state: &ErrorState) {
    state.send_if_modified(|current| current.take().is_some());
}

impl DurableClient {
    pub fn bus(&self) -> &DurableBus {
        &self.bus
    }

    /// The most recent subscription failure, cleared once consuming works
    /// again.
    pub fn last_error(&self) -> Option<SubscriptionError> {
        self.error.borrow().clone()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<SubscriptionError>> {
        self.error.subscribe()
    }

    /// Whether this client's pull consumer is running.
    pub fn is_subscribed(&self) -> bool {
        self.active.lock().as_ref().is_some_and(|s| s.is_active())
    }

    /// Publish a navigation event. Returns the server acknowledgment, or
    /// `None` when it was not delivered. Nothing is queued while the
    /// connection is down.
    pub async fn publish_message(
        &self,
        action: &str,
        page: &str,
        duration: Option<Duration>,
    ) -> Option<PubAck> {
        let message = NavigationMessage::new(action, page, duration);
        let payload = match serde_json::to_vec(&message) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                error!(target: "durable", error = %e, "Failed to encode navigation message");
                return None;
            }
        };

        let conn = match self.bus.ensure_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(target: "durable", action, page, error = %e, "Publish error");
                return None;
            }
        };

        match conn.publish(&self.bus.inner.config.subject, payload).await {
            Ok(ack) => {
                info!(
                    target: "durable",
                    action,
                    page,
                    duration_ms = ?message.duration_ms,
                    seq = ack.seq,
                    "Published"
                );
                Some(ack)
            }
            Err(e) => {
                error!(target: "durable", action, page, error = %e, "Publish error");
                None
            }
        }
    }

    /// Start a durable pull consumer delivering decoded navigation messages
    /// to `callback`. Replaces this client's previous consumer.
    ///
    /// Successful callbacks are acked, failing ones nak'd for redelivery
    /// (bounded by `max_deliver`), undecodable payloads terminated.
    pub async fn subscribe_to_messages<F>(&self, callback: F) -> Option<PullSubscription>
    where
        F: Fn(NavigationMessage) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            debug!(target: "durable", consumer = %previous.name(), "Destroying previous consumer");
            previous.unsubscribe().await;
        }

        let conn = match self.bus.ensure_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(target: "durable", error = %e, "Subscribe error");
                record_error(&self.error, SubscriptionError::Connection(e));
                return None;
            }
        };

        let config = &self.bus.inner.config;
        let name = format!(
            "{}_{}_{}",
            config.consumer_base,
            chrono::Utc::now().timestamp_millis(),
            CONSUMER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let consumer = match conn
            .create_consumer(ConsumerConfig {
                durable_name: name.clone(),
                filter_subject: config.subject.clone(),
                max_deliver: config.max_deliver,
                ack_wait: config.ack_wait,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(target: "durable", consumer = %name, error = %e, "Subscribe error");
                record_error(&self.error, e);
                return None;
            }
        };
        clear_error(&self.error);

        info!(target: "durable", consumer = %name, subject = %config.subject, "Pull consumer active");
        let shared = Arc::new(PullShared {
            name,
            consumer: Mutex::new(consumer),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let handler: Arc<NavigationHandler> = Arc::new(callback);
        let task = tokio::spawn(run_pull_loop(
            self.bus.clone(),
            shared.clone(),
            handler,
            self.error.clone(),
        ));
        *shared.task.lock() = Some(task);

        let subscription = PullSubscription { shared };
        *self.active.lock() = Some(subscription.clone());
        Some(subscription)
    }

    /// Stop this client's consumer, if any, and release the connection share.
    pub async fn detach(self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.unsubscribe().await;
        }
        // Drop releases the reference.
    }
}

impl Drop for DurableClient {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            active.stop_in_background();
        }
        self.bus.release();
    }
}

struct PullShared {
    name: String,
    consumer: Mutex<Arc<dyn PullConsumer>>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running pull consumer.
#[derive(Clone)]
pub struct PullSubscription {
    shared: Arc<PullShared>,
}

impl PullSubscription {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_active(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stop the pull loop and destroy the consumer. Safe to call repeatedly.
    pub async fn unsubscribe(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "durable", consumer = %self.shared.name, "Unsubscribing");
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        let consumer = self.shared.consumer.lock().clone();
        if let Err(e) = consumer.destroy().await {
            warn!(target: "durable", consumer = %self.shared.name, error = %e, "Error destroying consumer");
        }
    }

    fn stop_in_background(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let this = self.clone();
            handle.spawn(async move { this.unsubscribe().await });
        } else {
            self.shared.stopped.store(true, Ordering::SeqCst);
            if let Some(task) = self.shared.task.lock().take() {
                task.abort();
            }
        }
    }
}

async fn run_pull_loop(
    bus: DurableBus,
    shared: Arc<PullShared>,
    handler: Arc<NavigationHandler>,
    error: Arc<ErrorState>,
) {
    let config = bus.config().clone();
    let mut ticker = tokio::time::interval(config.pull_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let consumer = shared.consumer.lock().clone();
        match consumer
            .fetch(config.pull_batch, config.pull_expires)
            .await
        {
            Ok(batch) => {
                clear_error(&error);
                for message in batch {
                    if shared.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    process(consumer.as_ref(), handler.as_ref(), message).await;
                }
            }
            Err(e) => {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                warn!(target: "durable", consumer = %shared.name, error = %e, "Pull failed");
                record_error(&error, e);
                // The durable consumer outlives the connection; rebind once
                // a connection is live again.
                if let Some(conn) = bus.live_connection() {
                    match conn.bind_consumer(&shared.name).await {
                        Ok(rebound) => {
                            debug!(target: "durable", consumer = %shared.name, "Rebound consumer");
                            *shared.consumer.lock() = rebound;
                        }
                        Err(e) => {
                            error!(target: "durable", consumer = %shared.name, error = %e, "Subscription error");
                            record_error(&error, e);
                        }
                    }
                }
            }
        }
    }
    debug!(target: "durable", consumer = %shared.name, "Pull loop stopped");
}

async fn process(consumer: &dyn PullConsumer, handler: &NavigationHandler, message: DeliveredMessage) {
    let seq = message.stream_seq;
    let decoded: NavigationMessage = match serde_json::from_slice(&message.payload) {
        Ok(m) => m,
        Err(e) => {
            error!(target: "durable", seq, error = %e, "Undecodable message, terminating");
            if let Err(e) = consumer.term(seq).await {
                warn!(target: "durable", seq, error = %e, "Term failed");
            }
            return;
        }
    };
    debug!(target: "durable", seq, action = %decoded.action, page = %decoded.page, "Received");

    let outcome = match catch_unwind(AssertUnwindSafe(|| handler(decoded))) {
        Ok(result) => result,
        Err(_) => Err(CallbackError::from("callback panicked")),
    };
    let acked = match outcome {
        Ok(()) => consumer.ack(seq).await,
        Err(e) => {
            error!(
                target: "durable",
                seq,
                delivery = message.delivery_count,
                error = %e,
                "Error in callback, requesting redelivery"
            );
            consumer.nak(seq).await
        }
    };
    if let Err(e) = acked {
        warn!(target: "durable", seq, error = %e, "Acknowledgment failed");
    }
}
