//! Cross-framework mount bridge.
//!
//! Mounts resolved remote modules into containers, either through the host's
//! native renderer or through a foreign runtime installed on the
//! [`HostContext`]. A container holds at most one live instance; when mounts
//! race, the latest request wins.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dom::{Container, ContainerContent, MICROAPP_ATTR};
use crate::host::HostContext;
use crate::remote::{Framework, ModuleLoadError, RemoteModule, RemoteResolver};
use crate::styles::StyleCoordinator;

/// Properties forwarded verbatim to the mounted component.
pub type Props = serde_json::Map<String, Value>;

pub const DEFAULT_EXPORT: &str = "./App";
pub const DEFAULT_PLACEHOLDER: &str = "Loading...";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error(transparent)]
    Load(#[from] ModuleLoadError),

    #[error("{adapter} failed to mount {app}: {reason}")]
    Adapter {
        adapter: String,
        app: String,
        reason: String,
    },

    #[error("nothing to retry in container {0}")]
    NothingToRetry(u64),
}

/// Renders a component into a container. Implemented by the native renderer
/// and by every foreign runtime.
pub trait FrameworkAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn mount(
        &self,
        component: &str,
        props: &Props,
        container: &Container,
        host: &HostContext,
    ) -> Result<Box<dyn MountedInstance>, MountError>;
}

/// A live component. Consumed by unmounting.
pub trait MountedInstance: Send + Sync {
    fn component(&self) -> &str;

    fn unmount(self: Box<Self>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Mounted { component: String, props: Props },
    Unmounted { component: String },
}

#[derive(Default)]
struct HeadlessState {
    live: AtomicUsize,
    events: Mutex<Vec<AdapterEvent>>,
    failing: Mutex<Vec<String>>,
}

/// Adapter without a rendering target: records mounts and unmounts.
#[derive(Clone)]
pub struct HeadlessAdapter {
    name: String,
    state: Arc<HeadlessState>,
}

impl HeadlessAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(HeadlessState::default()),
        }
    }

    /// Make mounting `component` fail.
    pub fn fail_on(&self, component: &str) {
        self.state.failing.lock().push(component.to_string());
    }

    pub fn live_instances(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<AdapterEvent> {
        self.state.events.lock().clone()
    }
}

impl FrameworkAdapter for HeadlessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn mount(
        &self,
        component: &str,
        props: &Props,
        _container: &Container,
        _host: &HostContext,
    ) -> Result<Box<dyn MountedInstance>, MountError> {
        if self.state.failing.lock().iter().any(|c| c == component) {
            return Err(MountError::Adapter {
                adapter: self.name.clone(),
                app: component.to_string(),
                reason: "render failed".to_string(),
            });
        }
        self.state.live.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().push(AdapterEvent::Mounted {
            component: component.to_string(),
            props: props.clone(),
        });
        Ok(Box::new(HeadlessInstance {
            component: component.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct HeadlessInstance {
    component: String,
    state: Arc<HeadlessState>,
}

impl MountedInstance for HeadlessInstance {
    fn component(&self) -> &str {
        &self.component
    }

    fn unmount(self: Box<Self>) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.events.lock().push(AdapterEvent::Unmounted {
            component: self.component,
        });
    }
}

/// What to mount into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct MountRequest {
    pub app: String,
    pub url: String,
    pub export_key: String,
    pub framework: Framework,
    pub props: Props,
    pub placeholder: String,
}

impl MountRequest {
    pub fn new(app: &str, url: &str, framework: Framework) -> Self {
        Self {
            app: app.to_string(),
            url: url.to_string(),
            export_key: DEFAULT_EXPORT.to_string(),
            framework,
            props: Props::new(),
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }

    pub fn export_key(mut self, key: &str) -> Self {
        self.export_key = key.to_string();
        self
    }

    pub fn prop(mut self, key: &str, value: Value) -> Self {
        self.props.insert(key.to_string(), value);
        self
    }

    pub fn placeholder(mut self, text: &str) -> Self {
        self.placeholder = text.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MountOutcome {
    Mounted,
    /// A later request for the same container took over.
    Superseded,
    Failed(MountError),
}

impl MountOutcome {
    pub fn is_mounted(&self) -> bool {
        matches!(self, MountOutcome::Mounted)
    }
}

struct LiveInstance {
    app: String,
    instance: Box<dyn MountedInstance>,
}

#[derive(Default)]
struct Slot {
    generation: AtomicU64,
    live: tokio::sync::Mutex<Option<LiveInstance>>,
    last: Mutex<Option<MountRequest>>,
}

pub struct MountBridge {
    resolver: Arc<RemoteResolver>,
    styles: Arc<StyleCoordinator>,
    host: HostContext,
    native: Arc<dyn FrameworkAdapter>,
    slots: DashMap<u64, Arc<Slot>>,
}

impl MountBridge {
    pub fn new(
        resolver: Arc<RemoteResolver>,
        styles: Arc<StyleCoordinator>,
        host: HostContext,
        native: Arc<dyn FrameworkAdapter>,
    ) -> Self {
        Self {
            resolver,
            styles,
            host,
            native,
            slots: DashMap::new(),
        }
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    // The bump happens under the map entry so `unmount` cannot release the
    // slot between lookup and claim.
    fn claim(&self, container: &Container) -> (Arc<Slot>, u64) {
        let slot = self.slots.entry(container.id()).or_default();
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (slot.clone(), generation)
    }

    /// Resolve and mount `request` into `container`, replacing whatever is
    /// there. The container shows the placeholder while the module loads and
    /// an error view if it fails.
    pub async fn mount(&self, container: &Container, request: MountRequest) -> MountOutcome {
        let (slot, generation) = self.claim(container);
        *slot.last.lock() = Some(request.clone());

        {
            let mut live = slot.live.lock().await;
            if slot.generation.load(Ordering::SeqCst) != generation {
                return MountOutcome::Superseded;
            }
            if let Some(prior) = live.take() {
                teardown(prior);
            }
            container.remove_attribute(MICROAPP_ATTR);
            container.set_content(ContainerContent::Placeholder {
                text: request.placeholder.clone(),
            });
        }

        let loaded = self
            .resolver
            .load_remote_module(
                &request.url,
                &request.app,
                &request.export_key,
                request.framework.clone(),
            )
            .await;

        let mut live = slot.live.lock().await;
        if slot.generation.load(Ordering::SeqCst) != generation {
            debug!(target: "mount", app = %request.app, "Mount superseded");
            return MountOutcome::Superseded;
        }
        // Only the current request may touch the container from here on.
        if let Some(prior) = live.take() {
            teardown(prior);
        }

        let result = loaded
            .map_err(MountError::from)
            .and_then(|module| self.instantiate(container, &request, module));

        match result {
            Ok((instance, module)) => {
                container.set_content(ContainerContent::Mounted {
                    app: request.app.clone(),
                    component: instance.component().to_string(),
                });
                *live = Some(LiveInstance {
                    app: request.app.clone(),
                    instance,
                });
                info!(target: "mount", app = %request.app, framework = %module.framework, "Mounted");
                if matches!(module.framework, Framework::Foreign(_)) {
                    self.load_styles(module);
                }
                MountOutcome::Mounted
            }
            Err(e) => {
                error!(target: "mount", app = %request.app, error = %e, "Failed to load remote");
                container.set_content(ContainerContent::Failed {
                    app: request.app.clone(),
                    message: e.to_string(),
                });
                MountOutcome::Failed(e)
            }
        }
    }

    fn instantiate(
        &self,
        container: &Container,
        request: &MountRequest,
        module: RemoteModule,
    ) -> Result<(Box<dyn MountedInstance>, RemoteModule), MountError> {
        let component = module
            .export
            .component()
            .ok_or_else(|| ModuleLoadError::NoComponent {
                name: module.logical_name.clone(),
                export_key: module.export_key.clone(),
            })?
            .to_string();

        let adapter = match &module.framework {
            Framework::Native => self.native.clone(),
            Framework::Foreign(runtime) => {
                container.set_attribute(MICROAPP_ATTR, &request.app);
                self.host
                    .runtime(runtime)
                    .ok_or_else(|| ModuleLoadError::UnknownRuntime {
                        name: module.logical_name.clone(),
                        runtime: runtime.clone(),
                    })?
            }
        };

        let mounted = catch_unwind(AssertUnwindSafe(|| {
            adapter.mount(&component, &request.props, container, &self.host)
        }))
        .unwrap_or_else(|_| {
            Err(MountError::Adapter {
                adapter: adapter.name().to_string(),
                app: request.app.clone(),
                reason: "adapter panicked".to_string(),
            })
        })?;
        Ok((mounted, module))
    }

    fn load_styles(&self, module: RemoteModule) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let styles = self.styles.clone();
        handle.spawn(async move {
            styles
                .load_stylesheet(
                    &module.origin,
                    &module.logical_name,
                    module.stylesheet.as_deref(),
                )
                .await;
        });
    }

    /// Tear down the live instance, if any, and release the container.
    /// Cancels an in-flight mount for it.
    pub async fn unmount(&self, container: &Container) {
        let Some(slot) = self.slots.get(&container.id()).map(|s| s.clone()) else {
            return;
        };
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut live = slot.live.lock().await;
        if let Some(prior) = live.take() {
            teardown(prior);
        }
        container.remove_attribute(MICROAPP_ATTR);
        container.set_content(ContainerContent::Empty);
        drop(live);
        // A mount that claimed the slot meanwhile keeps it.
        self.slots.remove_if(&container.id(), |_, current| {
            Arc::ptr_eq(current, &slot) && current.generation.load(Ordering::SeqCst) == generation
        });
    }

    /// Re-issue the last request made for `container`.
    pub async fn retry(&self, container: &Container) -> MountOutcome {
        let last = self
            .slots
            .get(&container.id())
            .and_then(|slot| {
                let last = slot.last.lock().clone();
                last
            });
        match last {
            Some(request) => {
                info!(target: "mount", app = %request.app, "Retrying mount");
                self.mount(container, request).await
            }
            None => MountOutcome::Failed(MountError::NothingToRetry(container.id())),
        }
    }

    /// App currently live in `container`.
    pub async fn live_app(&self, container: &Container) -> Option<String> {
        let slot = self.slots.get(&container.id()).map(|s| s.clone())?;
        let live = slot.live.lock().await;
        live.as_ref().map(|l| l.app.clone())
    }
}

fn teardown(prior: LiveInstance) {
    let LiveInstance { app, instance } = prior;
    if catch_unwind(AssertUnwindSafe(|| instance.unmount())).is_err() {
        warn!(target: "mount", app = %app, "Unmount panicked");
    } else {
        debug!(target: "mount", app = %app, "Unmounted");
    }
}
