//! Capabilities the host exposes to mounted remotes.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::mount::FrameworkAdapter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("runtime '{0}' is already installed")]
    RuntimeAlreadyInstalled(String),

    #[error("host navigation channel is closed")]
    NavigationClosed,
}

/// Handed to remotes at mount time. Replaces the host globals remotes would
/// otherwise reach for: a navigate function and shared framework runtimes.
#[derive(Clone)]
pub struct HostContext {
    navigator: mpsc::UnboundedSender<String>,
    runtimes: Arc<DashMap<String, Arc<dyn FrameworkAdapter>>>,
}

impl HostContext {
    /// Returns the context and the receiving end of navigation requests.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                navigator: tx,
                runtimes: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    /// Ask the host router to navigate to `path`.
    pub fn navigate_to(&self, path: &str) -> Result<(), HostError> {
        debug!(target: "shell", path, "Navigation requested by remote");
        self.navigator
            .send(path.to_string())
            .map_err(|_| HostError::NavigationClosed)
    }

    /// Install a shared framework runtime. Each runtime is installed once
    /// per host.
    pub fn install_runtime(
        &self,
        name: &str,
        adapter: Arc<dyn FrameworkAdapter>,
    ) -> Result<(), HostError> {
        match self.runtimes.entry(name.to_string()) {
            Entry::Occupied(_) => Err(HostError::RuntimeAlreadyInstalled(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(adapter);
                info!(target: "shell", runtime = name, "Runtime installed");
                Ok(())
            }
        }
    }

    pub fn runtime(&self, name: &str) -> Option<Arc<dyn FrameworkAdapter>> {
        self.runtimes.get(name).map(|r| r.clone())
    }

    pub fn runtime_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runtimes.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}
