//! Headless document model.
//!
//! Stands in for the host page: the stylesheet links in its head, and the
//! containers remotes are mounted into.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Attribute marking elements owned by a microapp.
pub const MICROAPP_ATTR: &str = "data-microapp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StylesheetLink {
    pub id: String,
    pub href: String,
    /// Value of the `data-microapp` attribute, if any.
    pub microapp: Option<String>,
}

/// What a container currently shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ContainerContent {
    Empty,
    Placeholder { text: String },
    Mounted { app: String, component: String },
    /// Error view with a retry affordance.
    Failed { app: String, message: String },
}

#[derive(Debug)]
struct ContainerState {
    content: ContainerContent,
    attributes: BTreeMap<String, String>,
    classes: BTreeSet<String>,
    class_adds: HashMap<String, usize>,
}

/// A mount target. Clones refer to the same element.
#[derive(Debug, Clone)]
pub struct Container {
    id: u64,
    state: Arc<RwLock<ContainerState>>,
}

impl Container {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(RwLock::new(ContainerState {
                content: ContainerContent::Empty,
                attributes: BTreeMap::new(),
                classes: BTreeSet::new(),
                class_adds: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn content(&self) -> ContainerContent {
        self.state.read().content.clone()
    }

    pub fn set_content(&self, content: ContainerContent) {
        self.state.write().content = content;
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.state.read().attributes.get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        self.state
            .write()
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove_attribute(&self, name: &str) {
        self.state.write().attributes.remove(name);
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.state.read().classes.contains(class)
    }

    pub fn add_class(&self, class: &str) {
        let mut state = self.state.write();
        if state.classes.insert(class.to_string()) {
            *state.class_adds.entry(class.to_string()).or_default() += 1;
        }
    }

    pub fn remove_class(&self, class: &str) {
        self.state.write().classes.remove(class);
    }

    /// How many times `class` went from absent to present.
    pub fn times_added(&self, class: &str) -> usize {
        self.state
            .read()
            .class_adds
            .get(class)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct DocumentState {
    links: Vec<StylesheetLink>,
    containers: Vec<Container>,
}

/// The host document. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Document {
    state: Arc<RwLock<DocumentState>>,
    next_container: Arc<AtomicU64>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document that already carries the host's own stylesheets.
    pub fn with_host_stylesheets<I, S>(hrefs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let doc = Self::new();
        {
            let mut state = doc.state.write();
            for (i, href) in hrefs.into_iter().enumerate() {
                state.links.push(StylesheetLink {
                    id: format!("host-css-{}", i),
                    href: href.into(),
                    microapp: None,
                });
            }
        }
        doc
    }

    pub fn create_container(&self) -> Container {
        let container = Container::new(self.next_container.fetch_add(1, Ordering::SeqCst));
        self.state.write().containers.push(container.clone());
        container
    }

    pub fn stylesheets(&self) -> Vec<StylesheetLink> {
        self.state.read().links.clone()
    }

    pub fn has_stylesheet(&self, id: &str) -> bool {
        self.state.read().links.iter().any(|l| l.id == id)
    }

    /// Insert `link` right after the first existing stylesheet so host
    /// styles keep the lowest precedence; append if there is none.
    /// Returns false when a link with the same id is already present.
    pub fn insert_stylesheet(&self, link: StylesheetLink) -> bool {
        let mut state = self.state.write();
        if state.links.iter().any(|l| l.id == link.id) {
            return false;
        }
        if state.links.is_empty() {
            state.links.push(link);
        } else {
            state.links.insert(1, link);
        }
        true
    }

    /// Remove the link with `id`. Returns whether one was present.
    pub fn remove_stylesheet(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.links.len();
        state.links.retain(|l| l.id != id);
        state.links.len() != before
    }

    /// Containers currently tagged as owned by `app`.
    pub fn containers_for(&self, app: &str) -> Vec<Container> {
        self.state
            .read()
            .containers
            .iter()
            .filter(|c| c.attribute(MICROAPP_ATTR).as_deref() == Some(app))
            .cloned()
            .collect()
    }
}
