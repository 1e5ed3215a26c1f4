//! Debug event log: a match-all bus subscriber keeping the latest messages.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bus::{Callback, MessageBus, Subscription};

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub subject: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

pub struct EventLog {
    bus: MessageBus,
    capacity: usize,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl EventLog {
    pub fn new(bus: MessageBus) -> Self {
        Self::with_capacity(bus, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(bus: MessageBus, capacity: usize) -> Self {
        Self {
            bus,
            capacity,
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            subscription: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Start recording every bus message. No-op when already enabled.
    pub fn enable(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let entries = self.entries.clone();
        let capacity = self.capacity;
        let callback = Callback::infallible(move |m| {
            let mut entries = entries.lock();
            entries.push_front(LogEntry {
                subject: m.subject.clone(),
                source: m.source.clone(),
                timestamp: m.timestamp,
                data: m.data.clone(),
            });
            entries.truncate(capacity);
        });
        *subscription = Some(self.bus.subscribe("*", callback));
        debug!(target: "bus", "Event log enabled");
    }

    /// Stop recording. Keeps the entries collected so far.
    pub fn disable(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            debug!(target: "bus", "Event log disabled");
        }
    }

    /// Returns whether the log is enabled afterwards.
    pub fn toggle(&self) -> bool {
        if self.is_enabled() {
            self.disable();
            false
        } else {
            self.enable();
            true
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.lock().iter() {
            let _ = writeln!(
                out,
                "{} {} [{}] {}",
                entry.timestamp.format("%H:%M:%S%.3f"),
                entry.subject,
                entry.source,
                entry.data
            );
        }
        out
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.disable();
    }
}
