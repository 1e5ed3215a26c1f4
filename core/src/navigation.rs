//! Navigation telemetry: entering/leaving events on the durable bus, and a
//! relay that mirrors them onto the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{CallbackError, MessageBus, PublishOptions};
use crate::durable::{DurableClient, NavigationMessage, PullSubscription};
use crate::routes::RouteTable;

pub const ENTERING: &str = "entering";
pub const LEAVING: &str = "leaving";

/// In-process subject prefix used by the relay.
pub const RELAY_SUBJECT_PREFIX: &str = "app.navigation";
pub const RELAY_SOURCE: &str = "durable-relay";

/// What a path change published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// App left and time spent in it.
    pub left: Option<(String, Duration)>,
    /// App entered, if the new path belongs to one.
    pub entered: Option<String>,
}

struct Visit {
    path: String,
    app: Option<String>,
    since: Instant,
}

/// Publishes `leaving` (with dwell time) for the app owning the previous
/// path, then `entering` for the app owning the new one, on every path
/// change. Paths outside the route table publish nothing.
pub struct NavigationTracker {
    client: Arc<DurableClient>,
    routes: RouteTable,
    current: Mutex<Option<Visit>>,
}

impl NavigationTracker {
    pub fn new(client: Arc<DurableClient>, routes: RouteTable) -> Self {
        Self {
            client,
            routes,
            current: Mutex::new(None),
        }
    }

    pub fn current_path(&self) -> Option<String> {
        self.current.lock().as_ref().map(|v| v.path.clone())
    }

    /// Record a navigation to `path`. Returns `None` when the path did not
    /// change. Publish failures are logged by the client and do not stop
    /// tracking.
    pub async fn on_path_change(&self, path: &str) -> Option<Transition> {
        let app = self.routes.app_for_path(path).map(String::from);
        let previous = {
            let mut current = self.current.lock();
            if current.as_ref().map(|v| v.path.as_str()) == Some(path) {
                return None;
            }
            current.replace(Visit {
                path: path.to_string(),
                app: app.clone(),
                since: Instant::now(),
            })
        };

        let left = match previous {
            Some(Visit {
                app: Some(page),
                since,
                ..
            }) => {
                let dwell = since.elapsed();
                self.client
                    .publish_message(LEAVING, &page, Some(dwell))
                    .await;
                Some((page, dwell))
            }
            _ => None,
        };
        if let Some(page) = &app {
            self.client.publish_message(ENTERING, page, None).await;
        }
        debug!(target: "shell", path, app = ?app, "Navigation tracked");

        Some(Transition { left, entered: app })
    }

    /// Publish `leaving` for the current app, if any.
    pub async fn finish(&self) -> Option<(String, Duration)> {
        let visit = self.current.lock().take()?;
        let page = visit.app?;
        let dwell = visit.since.elapsed();
        self.client
            .publish_message(LEAVING, &page, Some(dwell))
            .await;
        Some((page, dwell))
    }
}

/// Subject a relayed navigation message is republished on.
pub fn relay_subject(message: &NavigationMessage) -> String {
    format!("{}.{}", RELAY_SUBJECT_PREFIX, message.action)
}

/// Republish every durable navigation message on `bus` under
/// `app.navigation.<action>`.
pub async fn start_relay(client: &DurableClient, bus: MessageBus) -> Option<PullSubscription> {
    let subscription = client
        .subscribe_to_messages(move |message| {
            let data = serde_json::to_value(&message).map_err(|e| CallbackError(e.to_string()))?;
            bus.publish(
                &relay_subject(&message),
                data,
                PublishOptions::default().source(RELAY_SOURCE),
            )
            .map(|_| ())
            .map_err(|e| CallbackError(e.to_string()))
        })
        .await;
    if subscription.is_none() {
        warn!(target: "shell", "Navigation relay not started");
    }
    subscription
}
