//! In-process message bus: subject/wildcard pub/sub, bounded history and
//! request/reply on top of publish/subscribe.

mod message;
mod registry;

pub use message::{Callback, CallbackError, Message, PublishOptions};

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

use registry::SubjectTrie;

/// Prefix of the subjects used for request/reply correlation.
pub const REPLY_PREFIX: &str = "_REPLY";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("subject must not be empty")]
    EmptySubject,

    #[error("Request timeout for subject: {subject} after {timeout_ms}ms")]
    RequestTimeout { subject: String, timeout_ms: u64 },
}

/// Bus configuration
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub history_capacity: usize,
    pub default_history_limit: usize,
    pub request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            default_history_limit: 50,
            request_timeout: Duration::from_millis(5000),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            history_capacity: std::env::var("MOSAIC_BUS_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.history_capacity),
            default_history_limit: default.default_history_limit,
            request_timeout: std::env::var("MOSAIC_BUS_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.request_timeout),
        }
    }
}

struct BusInner {
    registry: RwLock<SubjectTrie>,
    history: Mutex<VecDeque<Arc<Message>>>,
    config: BusConfig,
}

/// Process-wide in-process bus. Clones share the same registry and history.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        debug!(target: "bus", capacity = config.history_capacity, "Message bus initialized");
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(SubjectTrie::default()),
                history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish `data` on `subject` and deliver it synchronously.
    ///
    /// Subscriber failures are logged and never interrupt delivery to the
    /// remaining subscribers. Returns the message id.
    pub fn publish(
        &self,
        subject: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        if subject.is_empty() {
            return Err(BusError::EmptySubject);
        }

        let message = Arc::new(Message {
            subject: subject.to_string(),
            data,
            timestamp: Utc::now(),
            id: new_id(),
            source: options.source.unwrap_or_else(|| "unknown".to_string()),
            reply_to: options.reply_to,
        });

        {
            let mut history = self.inner.history.lock();
            history.push_front(message.clone());
            history.truncate(self.inner.config.history_capacity);
        }

        // Snapshot so callbacks may (un)subscribe without holding the lock.
        let callbacks = self.inner.registry.read().matches(subject);
        debug!(target: "bus", subject, id = %message.id, subscribers = callbacks.len(), "Publishing");

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback.invoke(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(target: "bus", subject, error = %e, "Error in subscriber")
                }
                Err(_) => error!(target: "bus", subject, "Subscriber panicked"),
            }
        }

        Ok(message.id.clone())
    }

    /// Register `callback` under `pattern`.
    pub fn subscribe(&self, pattern: &str, callback: Callback) -> Subscription {
        if self.inner.registry.write().insert(pattern, callback.clone()) {
            debug!(target: "bus", pattern, "Subscribed");
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            pattern: pattern.to_string(),
            callback,
            done: AtomicBool::new(false),
        }
    }

    /// Remove a (pattern, callback) pair. Unknown pairs are ignored.
    pub fn unsubscribe(&self, pattern: &str, callback: &Callback) {
        remove(&self.inner, pattern, callback);
    }

    /// Publish a request and wait for the first reply, using the configured
    /// default timeout.
    pub async fn request(&self, subject: &str, data: Value) -> Result<Message, BusError> {
        self.request_with_timeout(subject, data, self.inner.config.request_timeout)
            .await
    }

    /// Publish a request carrying a fresh reply subject and wait for the
    /// first message on it. The reply subscription is always removed.
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let reply_subject = format!("{}.{}", REPLY_PREFIX, new_id());
        let (tx, rx) = oneshot::channel::<Message>();
        let slot = Mutex::new(Some(tx));

        // First of {reply, timeout} wins; the sender can only be taken once.
        let on_reply = Callback::infallible(move |m| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(m.clone());
            }
        });
        let _guard = ReplyGuard(self.subscribe(&reply_subject, on_reply));

        self.publish(
            subject,
            data,
            PublishOptions::default().reply_to(reply_subject.clone()),
        )?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => Err(BusError::RequestTimeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Answer a request message on its reply subject. Returns `None` when the
    /// message carries no reply subject.
    pub fn reply(&self, request: &Message, data: Value) -> Result<Option<String>, BusError> {
        match &request.reply_to {
            Some(subject) => self.publish(subject, data, PublishOptions::default()).map(Some),
            None => Ok(None),
        }
    }

    /// Most recent messages first, up to `limit`.
    pub fn event_history(&self, limit: usize) -> Vec<Arc<Message>> {
        self.inner
            .history
            .lock()
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// History with the configured default limit.
    pub fn recent(&self) -> Vec<Arc<Message>> {
        self.event_history(self.inner.config.default_history_limit)
    }

    pub fn clear_event_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    /// The in-process bus has no link to lose.
    pub fn is_connected(&self) -> bool {
        true
    }

    /// Number of patterns with at least one subscriber.
    pub fn pattern_count(&self) -> usize {
        self.inner.registry.read().pattern_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.read().callback_count()
    }
}

fn remove(inner: &BusInner, pattern: &str, callback: &Callback) {
    if inner.registry.write().remove(pattern, callback) {
        debug!(target: "bus", pattern, "Unsubscribed");
    }
}

/// Handle returned by [`MessageBus::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    pattern: String,
    callback: Callback,
    done: AtomicBool,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Remove this (pattern, callback) pair. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            remove(&inner, &self.pattern, &self.callback);
        }
    }
}

struct ReplyGuard(Subscription);

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
