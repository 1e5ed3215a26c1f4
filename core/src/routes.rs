//! Path to application routing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub app: String,
    #[serde(default = "default_kind", rename = "match")]
    pub kind: MatchKind,
}

fn default_kind() -> MatchKind {
    MatchKind::Prefix
}

impl Route {
    pub fn exact(path: &str, app: &str) -> Self {
        Self {
            path: path.to_string(),
            app: app.to_string(),
            kind: MatchKind::Exact,
        }
    }

    pub fn prefix(path: &str, app: &str) -> Self {
        Self {
            path: path.to_string(),
            app: app.to_string(),
            kind: MatchKind::Prefix,
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self.kind {
            MatchKind::Exact => path == self.path,
            MatchKind::Prefix => path.starts_with(&self.path),
        }
    }
}

/// Ordered route list; the first matching route wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(vec![
            Route::exact("/", "homeApp"),
            Route::prefix("/about", "aboutApp"),
            Route::prefix("/service", "serviceApp"),
            Route::prefix("/blog", "blogApp"),
            Route::prefix("/contact", "contactApp"),
        ])
    }
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Application owning `path`, if any. Query strings and fragments are
    /// ignored.
    pub fn app_for_path(&self, path: &str) -> Option<&str> {
        let path = path
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or(path);
        self.routes
            .iter()
            .find(|r| r.matches(path))
            .map(|r| r.app.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_maps_site_sections() {
        let table = RouteTable::default();
        assert_eq!(table.app_for_path("/"), Some("homeApp"));
        assert_eq!(table.app_for_path("/blog/42"), Some("blogApp"));
        assert_eq!(table.app_for_path("/contact?ref=nav"), Some("contactApp"));
        assert_eq!(table.app_for_path("/services"), Some("serviceApp"));
        assert_eq!(table.app_for_path("/pricing"), None);
        assert_eq!(table.app_for_path("/?x=1"), Some("homeApp"));
    }

    #[test]
    fn routes_deserialize_with_prefix_default() {
        let route: Route = serde_json::from_str(r#"{"path": "/docs", "app": "docsApp"}"#).unwrap();
        assert_eq!(route.kind, MatchKind::Prefix);
        let route: Route =
            serde_json::from_str(r#"{"path": "/", "app": "homeApp", "match": "exact"}"#).unwrap();
        assert_eq!(route.kind, MatchKind::Exact);
    }
}
