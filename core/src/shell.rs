//! Composition root: wires the buses, resolver, bridge and styles into the
//! page layout (navbar, routed main area, footer).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusConfig, MessageBus};
use crate::dom::{Container, ContainerContent, Document};
use crate::durable::{
    ConnectionState, DurableBus, DurableClient, DurableConfig, DurableTransport, PullSubscription,
};
use crate::event_log::EventLog;
use crate::host::HostContext;
use crate::mount::{FrameworkAdapter, MountBridge, MountOutcome, MountRequest, DEFAULT_EXPORT};
use crate::navigation::{start_relay, NavigationTracker, Transition};
use crate::remote::{Framework, ModuleFetcher, RemoteResolver};
use crate::routes::RouteTable;
use crate::styles::{StyleConfig, StyleCoordinator};
use crate::{MosaicError, Result};

/// A remote known to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteApp {
    pub name: String,
    pub url: String,
    #[serde(default = "native")]
    pub framework: Framework,
    #[serde(default = "default_export")]
    pub export_key: String,
}

fn native() -> Framework {
    Framework::Native
}

fn default_export() -> String {
    DEFAULT_EXPORT.to_string()
}

impl RemoteApp {
    pub fn new(name: &str, url: &str, framework: Framework, export_key: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            framework,
            export_key: export_key.to_string(),
        }
    }

    fn request(&self) -> MountRequest {
        MountRequest::new(&self.name, &self.url, self.framework.clone())
            .export_key(&self.export_key)
            .placeholder(&format!("Loading {}...", self.name))
    }
}

/// The seven site remotes served locally on ports 5001-5007.
pub fn default_remotes() -> Vec<RemoteApp> {
    let entry = |port: u16| format!("http://localhost:{}/assets/remoteEntry.json", port);
    let vue = || Framework::Foreign("vue".to_string());
    vec![
        RemoteApp::new("navbarApp", &entry(5001), Framework::Native, "./Navbar"),
        RemoteApp::new("footerApp", &entry(5002), Framework::Native, "./Footer"),
        RemoteApp::new("homeApp", &entry(5003), vue(), DEFAULT_EXPORT),
        RemoteApp::new("serviceApp", &entry(5004), vue(), DEFAULT_EXPORT),
        RemoteApp::new("aboutApp", &entry(5005), vue(), DEFAULT_EXPORT),
        RemoteApp::new("blogApp", &entry(5006), Framework::Native, DEFAULT_EXPORT),
        RemoteApp::new("contactApp", &entry(5007), Framework::Native, DEFAULT_EXPORT),
    ]
}

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub bus: BusConfig,
    pub durable: DurableConfig,
    pub styles: StyleConfig,
    pub remotes: Vec<RemoteApp>,
    pub routes: RouteTable,
    pub navbar: Option<String>,
    pub footer: Option<String>,
    pub event_log: bool,
    pub relay_navigation: bool,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            durable: DurableConfig::default(),
            styles: StyleConfig::default(),
            remotes: default_remotes(),
            routes: RouteTable::default(),
            navbar: Some("navbarApp".to_string()),
            footer: Some("footerApp".to_string()),
            event_log: false,
            relay_navigation: true,
        }
    }
}

impl ShellOptions {
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            durable: DurableConfig::from_env(),
            styles: StyleConfig::from_env(),
            ..Self::default()
        }
    }
}

/// Result of [`Shell::navigate`].
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationReport {
    pub path: String,
    pub app: Option<String>,
    pub transition: Option<Transition>,
    /// `None` when the path matches no app and the main area was cleared.
    pub main: Option<MountOutcome>,
}

pub struct Shell {
    options: ShellOptions,
    bus: MessageBus,
    durable: DurableBus,
    client: Arc<DurableClient>,
    tracker: NavigationTracker,
    relay: Arc<Mutex<Option<PullSubscription>>>,
    relay_watch: Mutex<Option<JoinHandle<()>>>,
    document: Document,
    bridge: MountBridge,
    host: HostContext,
    navigation_requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    event_log: EventLog,
    navbar: Container,
    main: Container,
    footer: Container,
}

impl Shell {
    pub fn new(
        options: ShellOptions,
        transport: Arc<dyn DurableTransport>,
        fetcher: Arc<dyn ModuleFetcher>,
        native: Arc<dyn FrameworkAdapter>,
    ) -> Self {
        let bus = MessageBus::new(options.bus.clone());
        let durable = DurableBus::new(transport, options.durable.clone());
        let client = Arc::new(durable.attach());
        let tracker = NavigationTracker::new(client.clone(), options.routes.clone());

        let document = Document::new();
        let resolver = Arc::new(RemoteResolver::new(fetcher.clone()));
        let styles = Arc::new(StyleCoordinator::new(
            document.clone(),
            fetcher,
            options.styles.clone(),
        ));
        let (host, navigation_requests) = HostContext::new();
        let bridge = MountBridge::new(resolver, styles, host.clone(), native);

        let event_log = EventLog::new(bus.clone());
        let navbar = document.create_container();
        let main = document.create_container();
        let footer = document.create_container();

        Self {
            options,
            bus,
            durable,
            client,
            tracker,
            relay: Arc::new(Mutex::new(None)),
            relay_watch: Mutex::new(None),
            document,
            bridge,
            host,
            navigation_requests: tokio::sync::Mutex::new(navigation_requests),
            event_log,
            navbar,
            main,
            footer,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn durable(&self) -> &DurableBus {
        &self.durable
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn bridge(&self) -> &MountBridge {
        &self.bridge
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn main_container(&self) -> &Container {
        &self.main
    }

    pub fn navbar_container(&self) -> &Container {
        &self.navbar
    }

    pub fn footer_container(&self) -> &Container {
        &self.footer
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteApp> {
        self.options.remotes.iter().find(|r| r.name == name)
    }

    /// Validate the layout, start the relay and mount the footer.
    pub async fn start(&self) -> Result<()> {
        for name in [&self.options.navbar, &self.options.footer]
            .into_iter()
            .flatten()
        {
            if self.remote(name).is_none() {
                return Err(MosaicError::Config(format!(
                    "layout references unknown remote '{}'",
                    name
                )));
            }
        }
        for route in self.options.routes.routes() {
            if self.remote(&route.app).is_none() {
                warn!(target: "shell", app = %route.app, path = %route.path, "Route targets unknown remote");
            }
        }

        if self.options.event_log {
            self.event_log.enable();
        }

        if self.options.relay_navigation {
            let relay = start_relay(&self.client, self.bus.clone()).await;
            *self.relay.lock() = relay;
            *self.relay_watch.lock() = Some(self.spawn_relay_watch());
        }

        if let Some(footer) = self.options.footer.as_deref().and_then(|n| self.remote(n)) {
            self.bridge.mount(&self.footer, footer.request()).await;
        }

        info!(
            target: "shell",
            remotes = self.options.remotes.len(),
            durable = ?self.durable.state(),
            "Shell started"
        );
        Ok(())
    }

    // Restarts the relay whenever the durable bus comes up without one, so a
    // bus that was unreachable at startup still gets relayed later.
    fn spawn_relay_watch(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let bus = self.bus.clone();
        let slot = self.relay.clone();
        let mut state = self.durable.watch_state();
        tokio::spawn(async move {
            loop {
                let connected = *state.borrow_and_update() == ConnectionState::Connected;
                let active = slot.lock().as_ref().is_some_and(|r| r.is_active());
                if connected && !active {
                    info!(target: "shell", "Durable bus connected, starting navigation relay");
                    if let Some(relay) = start_relay(&client, bus.clone()).await {
                        *slot.lock() = Some(relay);
                    }
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Whether relayed navigation events are currently flowing.
    pub fn relay_active(&self) -> bool {
        self.relay.lock().as_ref().is_some_and(|r| r.is_active())
    }

    /// The durable subscription's error state, `Ok` while it is healthy.
    pub fn relay_status(&self) -> Result<()> {
        match self.client.last_error() {
            Some(e) => Err(MosaicError::Subscription(e)),
            None => Ok(()),
        }
    }

    /// Route to `path`: track the transition, remount the navbar and mount
    /// the owning app into the main area.
    pub async fn navigate(&self, path: &str) -> NavigationReport {
        let app = self.options.routes.app_for_path(path).map(String::from);
        let transition = self.tracker.on_path_change(path).await;

        // The navbar follows the path so its active link stays current.
        if transition.is_some() {
            if let Some(navbar) = self.options.navbar.as_deref().and_then(|n| self.remote(n)) {
                self.bridge
                    .mount(
                        &self.navbar,
                        navbar
                            .request()
                            .prop("currentPath", serde_json::Value::from(path)),
                    )
                    .await;
            }
        }

        let unchanged = transition.is_none()
            && app.is_some()
            && self.bridge.live_app(&self.main).await == app;

        let main = match app.as_deref().and_then(|a| self.remote(a)) {
            Some(_) if unchanged => {
                debug!(target: "shell", path, "Already showing path");
                Some(MountOutcome::Mounted)
            }
            Some(remote) => {
                let outcome = self
                    .bridge
                    .mount(
                        &self.main,
                        remote
                            .request()
                            .prop("path", serde_json::Value::from(path)),
                    )
                    .await;
                Some(outcome)
            }
            None => {
                warn!(target: "shell", path, "No app for path");
                self.bridge.unmount(&self.main).await;
                self.main.set_content(ContainerContent::Placeholder {
                    text: format!("Not found: {}", path),
                });
                None
            }
        };

        NavigationReport {
            path: path.to_string(),
            app,
            transition,
            main,
        }
    }

    /// Next navigation requested by a mounted remote through the host
    /// context.
    pub async fn next_navigation_request(&self) -> Option<String> {
        self.navigation_requests.lock().await.recv().await
    }

    /// Retry the last failed mount in the main area.
    pub async fn retry_main(&self) -> MountOutcome {
        self.bridge.retry(&self.main).await
    }

    /// Wait up to `timeout` for the durable bus to report connected.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.durable.watch_state();
        tokio::time::timeout(timeout, async {
            while *state.borrow_and_update() != ConnectionState::Connected {
                if state.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        self.tracker.finish().await;
        if let Some(watch) = self.relay_watch.lock().take() {
            watch.abort();
        }
        let relay = self.relay.lock().take();
        if let Some(relay) = relay {
            relay.unsubscribe().await;
        }
        for container in [&self.navbar, &self.main, &self.footer] {
            self.bridge.unmount(container).await;
        }
        self.event_log.disable();
        self.durable.shutdown();
        info!(target: "shell", "Shell stopped");
    }
}
