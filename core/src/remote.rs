//! Remote module resolver.
//!
//! Every remote publishes one entry manifest (`remoteEntry.json`) in a fixed
//! format regardless of the UI framework that built it:
//!
//! ```json
//! {
//!   "name": "homeApp",
//!   "framework": "foreign:vue",
//!   "exposes": {
//!     "./App": { "default": "HomeApp" },
//!     "./Badge": "Badge"
//!   },
//!   "stylesheet": "/assets/index.css"
//! }
//! ```
//!
//! An export is either a directly invocable component id or a namespace
//! object with a `default` component.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// UI framework a remote was authored in, relative to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Framework {
    Native,
    /// Mounted through the foreign runtime registered under this name.
    Foreign(String),
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framework::Native => write!(f, "native"),
            Framework::Foreign(runtime) => write!(f, "foreign:{}", runtime),
        }
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "native" => Ok(Framework::Native),
            Some(("foreign", runtime)) if !runtime.is_empty() => {
                Ok(Framework::Foreign(runtime.to_string()))
            }
            _ => Err(format!(
                "invalid framework tag '{}' (expected 'native' or 'foreign:<runtime>')",
                s
            )),
        }
    }
}

impl TryFrom<String> for Framework {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Framework> for String {
    fn from(f: Framework) -> Self {
        f.to_string()
    }
}

/// Packaging convention of a remote. There is only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRegistration {
    pub url: String,
    pub format: ModuleFormat,
    pub framework: Framework,
}

/// Module object form of an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNamespace {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(flatten)]
    pub named: BTreeMap<String, Value>,
}

/// One exposed entry of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleExport {
    Component(String),
    Namespace(ExportNamespace),
}

impl ModuleExport {
    /// The component to render: the export itself when invocable, else its
    /// default export.
    pub fn component(&self) -> Option<&str> {
        match self {
            ModuleExport::Component(id) => Some(id),
            ModuleExport::Namespace(ns) => ns.default.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub name: String,
    /// Informational; the registration's framework tag decides how to mount.
    #[serde(default)]
    pub framework: Option<Framework>,
    #[serde(default)]
    pub exposes: HashMap<String, ModuleExport>,
    #[serde(default)]
    pub stylesheet: Option<String>,
}

/// A resolved export together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteModule {
    pub logical_name: String,
    pub url: String,
    /// Scheme, host and port of `url`, used to locate the remote's assets.
    pub origin: String,
    pub export_key: String,
    pub framework: Framework,
    pub export: ModuleExport,
    pub stylesheet: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleLoadError {
    #[error("failed to fetch {name} from {url}: {reason}")]
    Network {
        name: String,
        url: String,
        reason: String,
    },

    #[error("malformed manifest for {name} at {url}: {reason}")]
    Malformed {
        name: String,
        url: String,
        reason: String,
    },

    #[error("{name} does not expose '{export_key}' (available: {available:?})")]
    MissingExport {
        name: String,
        export_key: String,
        available: Vec<String>,
    },

    #[error("No valid component found in module {name} ({export_key})")]
    NoComponent { name: String, export_key: String },

    #[error("no runtime '{runtime}' installed for {name}")]
    UnknownRuntime { name: String, runtime: String },

    #[error("remote '{0}' is not registered")]
    NotRegistered(String),

    #[error("invalid remote url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Network seam used by the resolver and the stylesheet coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Lightweight existence check.
    async fn exists(&self, url: &str) -> bool;
}

/// HTTP fetcher: GET for manifests, HEAD for existence checks.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let fail = |e: reqwest::Error| FetchError {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(fail)?
            .error_for_status()
            .map_err(fail)?;
        Ok(resp.bytes().await.map_err(fail)?.to_vec())
    }

    async fn exists(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(target: "remote", url, error = %e, "HEAD failed");
                false
            }
        }
    }
}

/// Scheme, host and port of `url`.
pub fn origin_of(url: &str) -> Result<String, ModuleLoadError> {
    let parsed = Url::parse(url).map_err(|e| ModuleLoadError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(parsed.origin().ascii_serialization())
}

/// Join an asset path onto a remote origin.
pub fn asset_url(origin: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        origin.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Registry of remotes plus export resolution.
pub struct RemoteResolver {
    fetcher: Arc<dyn ModuleFetcher>,
    registry: DashMap<String, RemoteRegistration>,
}

impl RemoteResolver {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self {
            fetcher,
            registry: DashMap::new(),
        }
    }

    pub fn fetcher(&self) -> Arc<dyn ModuleFetcher> {
        self.fetcher.clone()
    }

    /// Register a remote; re-registering a name replaces it (a redeployed
    /// remote may move). Returns the previous registration.
    pub fn register(
        &self,
        logical_name: &str,
        url: &str,
        framework: Framework,
    ) -> Option<RemoteRegistration> {
        let registration = RemoteRegistration {
            url: url.to_string(),
            format: ModuleFormat::Manifest,
            framework,
        };
        let previous = self
            .registry
            .insert(logical_name.to_string(), registration);
        match &previous {
            Some(prev) if prev.url != url => {
                info!(target: "remote", name = logical_name, from = %prev.url, to = url, "Remote relocated")
            }
            Some(_) => {}
            None => info!(target: "remote", name = logical_name, url, "Remote registered"),
        }
        previous
    }

    pub fn registration(&self, logical_name: &str) -> Option<RemoteRegistration> {
        self.registry.get(logical_name).map(|r| r.clone())
    }

    /// Register `url` under `logical_name`, then resolve `export_key` from it.
    pub async fn load_remote_module(
        &self,
        url: &str,
        logical_name: &str,
        export_key: &str,
        framework: Framework,
    ) -> Result<RemoteModule, ModuleLoadError> {
        self.register(logical_name, url, framework);
        self.load(logical_name, export_key).await
    }

    /// Resolve `export_key` from the current registration of `logical_name`.
    /// No retries; a failed load is reported to the caller.
    pub async fn load(
        &self,
        logical_name: &str,
        export_key: &str,
    ) -> Result<RemoteModule, ModuleLoadError> {
        let registration = self
            .registration(logical_name)
            .ok_or_else(|| ModuleLoadError::NotRegistered(logical_name.to_string()))?;
        let url = registration.url.clone();
        let origin = origin_of(&url)?;

        debug!(target: "remote", name = logical_name, export_key, url = %url, "Loading remote module");
        let body = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(|e| ModuleLoadError::Network {
                name: logical_name.to_string(),
                url: url.clone(),
                reason: e.reason,
            })?;

        let manifest: RemoteManifest =
            serde_json::from_slice(&body).map_err(|e| ModuleLoadError::Malformed {
                name: logical_name.to_string(),
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if manifest.name != logical_name {
            warn!(
                target: "remote",
                name = logical_name,
                manifest_name = %manifest.name,
                "Manifest name differs from logical name"
            );
        }
        if let Some(declared) = manifest.framework.as_ref() {
            if *declared != registration.framework {
                warn!(
                    target: "remote",
                    name = logical_name,
                    declared = %declared,
                    registered = %registration.framework,
                    "Manifest framework differs from registration"
                );
            }
        }

        let export = manifest.exposes.get(export_key).cloned().ok_or_else(|| {
            let mut available: Vec<String> = manifest.exposes.keys().cloned().collect();
            available.sort();
            ModuleLoadError::MissingExport {
                name: logical_name.to_string(),
                export_key: export_key.to_string(),
                available,
            }
        })?;

        info!(target: "remote", name = logical_name, export_key, "Loaded remote module");
        Ok(RemoteModule {
            logical_name: logical_name.to_string(),
            url,
            origin,
            export_key: export_key.to_string(),
            framework: registration.framework,
            export,
            stylesheet: manifest.stylesheet,
        })
    }
}
