//! Stylesheet coordinator: one injected stylesheet per remote, then a forced
//! reflow of that remote's containers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::dom::{Document, StylesheetLink};
use crate::remote::{asset_url, ModuleFetcher};

#[derive(Clone, Debug)]
pub struct StyleConfig {
    /// Probed in order when the manifest declares no stylesheet.
    pub candidates: Vec<String>,
    pub reflow_delay: Duration,
    pub reflow_hold: Duration,
    pub reflow_class: String,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            candidates: [
                "assets/index.css",
                "dist/assets/index.css",
                "assets/style.css",
                "dist/style.css",
                "style.css",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            reflow_delay: Duration::from_millis(100),
            reflow_hold: Duration::from_millis(10),
            reflow_class: "microapp-force-render".to_string(),
        }
    }
}

impl StyleConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            candidates: std::env::var("MOSAIC_STYLE_CANDIDATES")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .filter(|c| !c.is_empty())
                .unwrap_or(default.candidates),
            reflow_delay: std::env::var("MOSAIC_STYLE_REFLOW_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.reflow_delay),
            reflow_hold: default.reflow_hold,
            reflow_class: default.reflow_class,
        }
    }
}

/// Id of the link element injected for `app`.
pub fn stylesheet_id(app: &str) -> String {
    format!("css-{}", app)
}

pub struct StyleCoordinator {
    document: Document,
    fetcher: Arc<dyn ModuleFetcher>,
    config: StyleConfig,
    // Latest load per app; older loads finishing late are discarded.
    generations: DashMap<String, u64>,
}

impl StyleCoordinator {
    pub fn new(document: Document, fetcher: Arc<dyn ModuleFetcher>, config: StyleConfig) -> Self {
        Self {
            document,
            fetcher,
            config,
            generations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StyleConfig {
        &self.config
    }

    /// Inject the stylesheet for `app`, served from `base_url`.
    ///
    /// A `declared` path from the manifest is used as is; otherwise the
    /// candidate paths are probed. Returns the injected href, or `None` when
    /// nothing was found (the remote stays unstyled) or a newer load for the
    /// same app took over.
    pub async fn load_stylesheet(
        &self,
        base_url: &str,
        app: &str,
        declared: Option<&str>,
    ) -> Option<String> {
        let generation = {
            let mut entry = self.generations.entry(app.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let id = stylesheet_id(app);
        if self.document.remove_stylesheet(&id) {
            debug!(target: "styles", app, "Removed previous stylesheet");
        }

        let href = match declared {
            Some(path) => Some(asset_url(base_url, path)),
            None => self.probe(base_url, app).await,
        };

        if !self.is_current(app, generation) {
            debug!(target: "styles", app, "Stylesheet load superseded");
            return None;
        }

        let Some(href) = href else {
            warn!(target: "styles", app, base_url, "No stylesheet found");
            return None;
        };

        self.document.remove_stylesheet(&id);
        self.document.insert_stylesheet(StylesheetLink {
            id,
            href: href.clone(),
            microapp: Some(app.to_string()),
        });
        info!(target: "styles", app, href = %href, "Stylesheet injected");

        self.schedule_reflow(app);
        Some(href)
    }

    async fn probe(&self, base_url: &str, app: &str) -> Option<String> {
        for candidate in &self.config.candidates {
            let url = asset_url(base_url, candidate);
            if self.fetcher.exists(&url).await {
                debug!(target: "styles", app, url = %url, "Stylesheet candidate found");
                return Some(url);
            }
        }
        None
    }

    fn is_current(&self, app: &str, generation: u64) -> bool {
        self.generations
            .get(app)
            .map(|g| *g == generation)
            .unwrap_or(false)
    }

    /// Toggle the reflow class on the app's containers after the configured
    /// delay. Needs a tokio runtime; skipped otherwise.
    fn schedule_reflow(&self, app: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let document = self.document.clone();
        let class = self.config.reflow_class.clone();
        let delay = self.config.reflow_delay;
        let hold = self.config.reflow_hold;
        let app = app.to_string();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let containers = document.containers_for(&app);
            for container in &containers {
                container.add_class(&class);
            }
            tokio::time::sleep(hold).await;
            for container in &containers {
                container.remove_class(&class);
            }
            debug!(target: "styles", app = %app, containers = containers.len(), "Forced reflow");
        });
    }
}
