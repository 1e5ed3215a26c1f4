use std::fs;
use std::path::Path;
use std::time::Duration;

use mosaic_core::remote::Framework;
use mosaic_core::routes::{Route, RouteTable};
use mosaic_core::shell::{RemoteApp, ShellOptions};

/// Configuration for the headless shell
#[derive(Clone, Debug)]
pub struct ShellConfig {
    pub options: ShellOptions,
    /// Timeout for manifest and stylesheet requests
    pub fetch_timeout: Duration,
    /// Foreign runtimes installed on the host context at startup
    pub runtimes: Vec<String>,
    /// Path navigated to before reading the script
    pub initial_path: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        // Core defaults already consider MOSAIC_* env vars
        let options = ShellOptions::from_env();
        let runtimes = runtimes_for(&options.remotes);
        Self {
            options,
            fetch_timeout: std::env::var("MOSAIC_FETCH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(5)),
            runtimes,
            initial_path: Some("/".to_string()),
        }
    }
}

fn runtimes_for(remotes: &[RemoteApp]) -> Vec<String> {
    let mut names: Vec<String> = remotes
        .iter()
        .filter_map(|r| match &r.framework {
            Framework::Foreign(runtime) => Some(runtime.clone()),
            Framework::Native => None,
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

impl ShellConfig {
    /// Load configuration from a TOML file (path via MOSAIC_CONFIG or ./mosaic.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("MOSAIC_CONFIG").unwrap_or_else(|_| "mosaic.toml".into());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(p: &Path) -> Self {
        let default = Self::default();
        if !p.exists() {
            tracing::info!(target: "shell", path = %p.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::parse(&s, default.clone()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "shell", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "shell", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn parse(s: &str, base: ShellConfig) -> Result<Self, toml::de::Error> {
        toml::from_str::<ShellToml>(s).map(|t| t.overlay(base))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ShellToml {
    pub event_log: Option<bool>,
    pub relay_navigation: Option<bool>,
    pub fetch_timeout_ms: Option<u64>,
    pub runtimes: Option<Vec<String>>,
    pub initial_path: Option<String>,
    pub bus: Option<BusToml>,
    pub durable: Option<DurableToml>,
    pub styles: Option<StylesToml>,
    pub layout: Option<LayoutToml>,
    pub remotes: Option<Vec<RemoteApp>>,
    pub routes: Option<Vec<Route>>,
}

impl ShellToml {
    fn overlay(self, mut base: ShellConfig) -> ShellConfig {
        let o = &mut base.options;
        if let Some(v) = self.event_log {
            o.event_log = v;
        }
        if let Some(v) = self.relay_navigation {
            o.relay_navigation = v;
        }
        if let Some(b) = self.bus {
            b.apply(o);
        }
        if let Some(d) = self.durable {
            d.apply(o);
        }
        if let Some(s) = self.styles {
            s.apply(o);
        }
        if let Some(l) = self.layout {
            l.apply(o);
        }
        let remotes_changed = self.remotes.is_some();
        if let Some(r) = self.remotes {
            o.remotes = r;
        }
        if let Some(r) = self.routes {
            o.routes = RouteTable::new(r);
        }
        if let Some(v) = self.fetch_timeout_ms {
            base.fetch_timeout = Duration::from_millis(v);
        }
        match self.runtimes {
            Some(r) => base.runtimes = r,
            None if remotes_changed => base.runtimes = runtimes_for(&base.options.remotes),
            None => {}
        }
        if let Some(p) = self.initial_path {
            base.initial_path = Some(p).filter(|p| !p.is_empty());
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct BusToml {
    pub history: Option<usize>,
    pub request_timeout_ms: Option<u64>,
}
impl BusToml {
    fn apply(self, o: &mut ShellOptions) {
        if let Some(v) = self.history {
            o.bus.history_capacity = v;
        }
        if let Some(v) = self.request_timeout_ms {
            o.bus.request_timeout = Duration::from_millis(v);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct DurableToml {
    pub server: Option<String>,
    pub stream: Option<String>,
    pub subject: Option<String>,
    pub consumer_base: Option<String>,
    pub reconnect_ms: Option<u64>,
    pub pull_batch: Option<usize>,
    pub pull_expires_ms: Option<u64>,
    pub pull_interval_ms: Option<u64>,
    pub max_deliver: Option<u32>,
}
impl DurableToml {
    fn apply(self, o: &mut ShellOptions) {
        let d = &mut o.durable;
        if let Some(x) = self.server {
            d.server = x;
        }
        if let Some(x) = self.stream {
            d.stream = x;
        }
        if let Some(x) = self.subject {
            d.subject = x;
        }
        if let Some(x) = self.consumer_base {
            d.consumer_base = x;
        }
        if let Some(x) = self.reconnect_ms {
            d.reconnect_wait = Duration::from_millis(x);
        }
        if let Some(x) = self.pull_batch {
            d.pull_batch = x.max(1);
        }
        if let Some(x) = self.pull_expires_ms {
            d.pull_expires = Duration::from_millis(x);
        }
        if let Some(x) = self.pull_interval_ms {
            d.pull_interval = Duration::from_millis(x);
        }
        if let Some(x) = self.max_deliver {
            d.max_deliver = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct StylesToml {
    pub candidates: Option<Vec<String>>,
    pub reflow_delay_ms: Option<u64>,
    pub reflow_class: Option<String>,
}
impl StylesToml {
    fn apply(self, o: &mut ShellOptions) {
        if let Some(mut x) = self.candidates {
            o.styles.candidates = x.drain(..).filter(|c| !c.is_empty()).collect();
        }
        if let Some(x) = self.reflow_delay_ms {
            o.styles.reflow_delay = Duration::from_millis(x);
        }
        if let Some(x) = self.reflow_class {
            o.styles.reflow_class = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LayoutToml {
    pub navbar: Option<String>,
    pub footer: Option<String>,
}
impl LayoutToml {
    fn apply(self, o: &mut ShellOptions) {
        // Empty string disables the slot
        if let Some(x) = self.navbar {
            o.navbar = Some(x).filter(|n| !n.is_empty());
        }
        if let Some(x) = self.footer {
            o.footer = Some(x).filter(|n| !n.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_remotes_and_derives_runtimes() {
        let toml = r#"
            event_log = true

            [durable]
            subject = "site.navigation"
            pull_interval_ms = 500

            [layout]
            footer = ""

            [[remotes]]
            name = "homeApp"
            url = "http://cdn.example/home/remoteEntry.json"
            framework = "foreign:svelte"

            [[remotes]]
            name = "navbarApp"
            url = "http://cdn.example/nav/remoteEntry.json"
            export_key = "./Navbar"

            [[routes]]
            path = "/"
            app = "homeApp"
            match = "exact"
        "#;
        let cfg = ShellConfig::parse(toml, ShellConfig::default()).unwrap();
        let o = &cfg.options;

        assert!(o.event_log);
        assert_eq!(o.durable.subject, "site.navigation");
        assert_eq!(o.durable.pull_interval, Duration::from_millis(500));
        assert_eq!(o.footer, None);
        assert_eq!(o.navbar.as_deref(), Some("navbarApp"));
        assert_eq!(o.remotes.len(), 2);
        assert_eq!(o.remotes[1].framework, Framework::Native);
        assert_eq!(o.remotes[1].export_key, "./Navbar");
        assert_eq!(cfg.runtimes, vec!["svelte".to_string()]);
        assert_eq!(o.routes.app_for_path("/"), Some("homeApp"));
        assert_eq!(o.routes.app_for_path("/blog"), None);
    }

    #[test]
    fn defaults_install_vue_runtime() {
        let cfg = ShellConfig::parse("", ShellConfig::default()).unwrap();
        assert_eq!(cfg.runtimes, vec!["vue".to_string()]);
        assert_eq!(cfg.options.remotes.len(), 7);
    }

    #[test]
    fn invalid_framework_is_rejected() {
        let toml = r#"
            [[remotes]]
            name = "x"
            url = "http://x/remoteEntry.json"
            framework = "react"
        "#;
        assert!(ShellConfig::parse(toml, ShellConfig::default()).is_err());
    }
}
