//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mosaic_core::remote::{FetchError, ModuleFetcher};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// In-memory fetcher: serves registered bodies, answers existence checks
/// from a set of known asset urls, and records every request.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    assets: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    fetched: Mutex<Vec<String>>,
    probed: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.lock().insert(url.to_string(), body.into());
    }

    /// Serve a manifest exposing `./App` as `component`.
    pub fn serve_app(&self, url: &str, name: &str, component: &str, stylesheet: Option<&str>) {
        let mut manifest = json!({
            "name": name,
            "exposes": { "./App": { "default": component } }
        });
        if let Some(css) = stylesheet {
            manifest["stylesheet"] = json!(css);
        }
        self.serve(url, manifest.to_string());
    }

    pub fn add_asset(&self, url: &str) {
        self.assets.lock().insert(url.to_string());
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl ModuleFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetched.lock().push(url.to_string());
        let delay = self.delays.lock().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let body = self.bodies.lock().get(url).cloned();
        body.ok_or_else(|| FetchError {
            url: url.to_string(),
            reason: "404 Not Found".to_string(),
        })
    }

    async fn exists(&self, url: &str) -> bool {
        self.probed.lock().push(url.to_string());
        self.assets.lock().contains(url)
    }
}
