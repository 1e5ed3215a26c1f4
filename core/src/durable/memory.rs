//! In-memory durable transport.
//!
//! Behaves like a single-stream JetStream server: publishes get sequence
//! acknowledgments, durable consumers keep their position across client
//! reconnects, and unacknowledged deliveries come back until `max_deliver`.
//! It also lets callers sever links or refuse connections, which is how the
//! reconnect paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{
    ConnectOptions, ConnectionError, ConsumerConfig, DeliveredMessage, DurableConnection,
    DurableTransport, PubAck, PullConsumer, SubscriptionError,
};

pub const DEFAULT_STREAM: &str = "NAVIGATION";

/// A message persisted in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub seq: u64,
    pub subject: String,
    pub payload: Bytes,
}

struct ConsumerState {
    config: ConsumerConfig,
    // Index of the next never-delivered stream entry.
    cursor: usize,
    pending: HashMap<u64, Instant>,
    deliveries: HashMap<u64, u32>,
    redeliver: VecDeque<u64>,
}

impl ConsumerState {
    fn accepts(&self, subject: &str) -> bool {
        self.config.filter_subject.is_empty() || self.config.filter_subject == subject
    }
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn consumer(&mut self, name: &str) -> Result<&mut ConsumerState, SubscriptionError> {
        self.consumers
            .get_mut(name)
            .ok_or_else(|| SubscriptionError::ConsumerNotFound(name.to_string()))
    }

    fn take_batch(
        &mut self,
        name: &str,
        batch: usize,
        now: Instant,
    ) -> Result<Vec<DeliveredMessage>, SubscriptionError> {
        let StreamState { entries, consumers } = self;
        let consumer = consumers
            .get_mut(name)
            .ok_or_else(|| SubscriptionError::ConsumerNotFound(name.to_string()))?;

        let expired: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            consumer.pending.remove(&seq);
            consumer.redeliver.push_back(seq);
        }

        let mut out = Vec::new();
        while out.len() < batch {
            let seq = if let Some(seq) = consumer.redeliver.pop_front() {
                seq
            } else if consumer.cursor < entries.len() {
                let entry = &entries[consumer.cursor];
                consumer.cursor += 1;
                if !consumer.accepts(&entry.subject) {
                    continue;
                }
                entry.seq
            } else {
                break;
            };

            let max_deliver = consumer.config.max_deliver;
            let count = consumer.deliveries.entry(seq).or_insert(0);
            if max_deliver > 0 && *count >= max_deliver {
                consumer.deliveries.remove(&seq);
                warn!(target: "durable", consumer = %name, seq, "Max deliveries reached; dropping message");
                continue;
            }
            *count += 1;
            let delivery_count = *count;

            consumer.pending.insert(seq, now + consumer.config.ack_wait);
            let entry = &entries[(seq - 1) as usize];
            out.push(DeliveredMessage {
                subject: entry.subject.clone(),
                payload: entry.payload.clone(),
                stream_seq: seq,
                delivery_count,
            });
        }
        Ok(out)
    }
}

struct MemoryServer {
    stream: String,
    state: Mutex<StreamState>,
    activity: Notify,
    reachable: AtomicBool,
    connect_delay: Mutex<Duration>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    connects: AtomicUsize,
    next_id: AtomicU64,
}

/// In-process durable transport. Clones share one server.
#[derive(Clone)]
pub struct MemoryTransport {
    server: Arc<MemoryServer>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_stream(DEFAULT_STREAM)
    }

    pub fn with_stream(stream: impl Into<String>) -> Self {
        Self {
            server: Arc::new(MemoryServer {
                stream: stream.into(),
                state: Mutex::new(StreamState::default()),
                activity: Notify::new(),
                reachable: AtomicBool::new(true),
                connect_delay: Mutex::new(Duration::ZERO),
                connections: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Refuse (false) or accept (true) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.server.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay applied to every connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.server.connect_delay.lock() = delay;
    }

    /// Sever every open client link, as a server restart would.
    pub fn drop_connections(&self, reason: &str) {
        let conns: Vec<Arc<MemoryConnection>> = self
            .server
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for conn in conns {
            conn.sever(reason);
        }
        self.server.activity.notify_waiters();
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.server.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.server
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .count()
    }

    pub fn entries(&self) -> Vec<StreamEntry> {
        self.server.state.lock().entries.clone()
    }

    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.server.state.lock().consumers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unacknowledged deliveries for a consumer.
    pub fn pending(&self, consumer: &str) -> Option<usize> {
        self.server
            .state
            .lock()
            .consumers
            .get(consumer)
            .map(|c| c.pending.len() + c.redeliver.len())
    }
}

#[async_trait]
impl DurableTransport for MemoryTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn DurableConnection>, ConnectionError> {
        let delay = *self.server.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.server.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                server: options.server.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let id = self.server.next_id.fetch_add(1, Ordering::SeqCst);
        let (link, _) = watch::channel(LinkState::Open);
        let conn = Arc::new_cyclic(|me| MemoryConnection {
            id,
            me: me.clone(),
            server: self.server.clone(),
            link,
        });

        let mut conns = self.server.connections.lock();
        conns.retain(|w| w.strong_count() > 0);
        conns.push(Arc::downgrade(&conn));
        self.server.connects.fetch_add(1, Ordering::SeqCst);

        info!(target: "durable", conn = id, client = %options.name, "Memory transport accepted connection");
        Ok(conn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    ClosedByClient,
    Dropped(String),
}

pub struct MemoryConnection {
    id: u64,
    me: Weak<MemoryConnection>,
    server: Arc<MemoryServer>,
    link: watch::Sender<LinkState>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match &*self.link.borrow() {
            LinkState::Open => Ok(()),
            LinkState::ClosedByClient => Err(ConnectionError::Closed("closed by client".into())),
            LinkState::Dropped(reason) => Err(ConnectionError::Closed(reason.clone())),
        }
    }

    fn sever(&self, reason: &str) {
        let severed = self.link.send_if_modified(|state| {
            if *state == LinkState::Open {
                *state = LinkState::Dropped(reason.to_string());
                true
            } else {
                false
            }
        });
        if severed {
            debug!(target: "durable", conn = self.id, reason, "Connection severed");
        }
    }

    fn handle(&self, name: &str) -> Result<Arc<dyn PullConsumer>, SubscriptionError> {
        let conn = self
            .me
            .upgrade()
            .ok_or_else(|| ConnectionError::Closed("connection released".into()))?;
        Ok(Arc::new(MemoryConsumer {
            name: name.to_string(),
            conn,
        }))
    }
}

#[async_trait]
impl DurableConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, ConnectionError> {
        self.ensure_open()?;
        let seq = {
            let mut state = self.server.state.lock();
            let seq = state.entries.len() as u64 + 1;
            state.entries.push(StreamEntry {
                seq,
                subject: subject.to_string(),
                payload,
            });
            seq
        };
        self.server.activity.notify_waiters();
        Ok(PubAck {
            stream: self.server.stream.clone(),
            seq,
        })
    }

    async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn PullConsumer>, SubscriptionError> {
        self.ensure_open()?;
        let name = config.durable_name.clone();
        {
            let mut state = self.server.state.lock();
            let cursor = state.entries.len();
            state
                .consumers
                .entry(name.clone())
                .or_insert_with(|| ConsumerState {
                    config,
                    cursor,
                    pending: HashMap::new(),
                    deliveries: HashMap::new(),
                    redeliver: VecDeque::new(),
                });
        }
        debug!(target: "durable", conn = self.id, consumer = %name, "Consumer created");
        self.handle(&name)
    }

    async fn bind_consumer(&self, name: &str) -> Result<Arc<dyn PullConsumer>, SubscriptionError> {
        self.ensure_open()?;
        self.server.state.lock().consumer(name)?;
        self.handle(name)
    }

    fn is_closed(&self) -> bool {
        *self.link.borrow() != LinkState::Open
    }

    async fn closed(&self) -> Option<ConnectionError> {
        let mut rx = self.link.subscribe();
        let state = match rx.wait_for(|s| *s != LinkState::Open).await {
            Ok(state) => (*state).clone(),
            Err(_) => LinkState::ClosedByClient,
        };
        match state {
            LinkState::Dropped(reason) => Some(ConnectionError::Closed(reason)),
            _ => None,
        }
    }

    async fn close(&self) {
        self.link.send_if_modified(|state| {
            if *state == LinkState::Open {
                *state = LinkState::ClosedByClient;
                true
            } else {
                false
            }
        });
        self.server.activity.notify_waiters();
    }
}

struct MemoryConsumer {
    name: String,
    conn: Arc<MemoryConnection>,
}

impl MemoryConsumer {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ConsumerState) -> T,
    ) -> Result<T, SubscriptionError> {
        self.conn.ensure_open()?;
        let mut state = self.conn.server.state.lock();
        Ok(f(state.consumer(&self.name)?))
    }
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<DeliveredMessage>, SubscriptionError> {
        let deadline = Instant::now() + expires;
        let mut link = self.conn.link.subscribe();
        loop {
            self.conn.ensure_open()?;

            let notified = self.conn.server.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let out = self
                .conn
                .server
                .state
                .lock()
                .take_batch(&self.name, batch, Instant::now())?;
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = link.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn ack(&self, seq: u64) -> Result<(), SubscriptionError> {
        self.with_state(|c| {
            c.pending.remove(&seq);
            c.deliveries.remove(&seq);
        })
    }

    async fn nak(&self, seq: u64) -> Result<(), SubscriptionError> {
        let requeued = self.with_state(|c| {
            let was_pending = c.pending.remove(&seq).is_some();
            if was_pending {
                c.redeliver.push_back(seq);
            }
            was_pending
        })?;
        if requeued {
            self.conn.server.activity.notify_waiters();
        }
        Ok(())
    }

    async fn term(&self, seq: u64) -> Result<(), SubscriptionError> {
        self.with_state(|c| {
            c.pending.remove(&seq);
            c.deliveries.remove(&seq);
        })
    }

    async fn destroy(&self) -> Result<(), SubscriptionError> {
        self.conn.ensure_open()?;
        let removed = self
            .conn
            .server
            .state
            .lock()
            .consumers
            .remove(&self.name)
            .is_some();
        if removed {
            debug!(target: "durable", consumer = %self.name, "Consumer destroyed");
            Ok(())
        } else {
            Err(SubscriptionError::ConsumerNotFound(self.name.clone()))
        }
    }
}
