//! Message and callback types shared by the in-process bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The unit exchanged on the bus. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub subject: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Optional publish metadata.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub source: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }
}

/// Error raised by a subscriber callback. Caught at the dispatch boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<&str> for CallbackError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

type Handler = dyn Fn(&Message) -> Result<(), CallbackError> + Send + Sync;

/// Subscriber callback handle.
///
/// Identity is the handle itself: clones of one `Callback` are the same
/// callback, so registering a clone under a pattern it already has is a no-op.
#[derive(Clone)]
pub struct Callback {
    handler: Arc<Handler>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(f),
        }
    }

    /// Wraps a callback that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self::new(move |m| {
            f(m);
            Ok(())
        })
    }

    /// True when both handles refer to the same callback.
    pub fn same(&self, other: &Callback) -> bool {
        // Compare data pointers only; vtable pointers are not stable across codegen units.
        std::ptr::eq(
            Arc::as_ptr(&self.handler) as *const (),
            Arc::as_ptr(&other.handler) as *const (),
        )
    }

    pub(crate) fn invoke(&self, message: &Message) -> Result<(), CallbackError> {
        (self.handler)(message)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.handler) as *const ())
    }
}
