mod common;

use common::FakeFetcher;
use mosaic_core::dom::{Document, MICROAPP_ATTR};
use mosaic_core::styles::{StyleConfig, StyleCoordinator};
use std::sync::Arc;
use std::time::Duration;

const ORIGIN: &str = "http://localhost:5004";

fn coordinator(fetcher: Arc<FakeFetcher>, document: &Document) -> StyleCoordinator {
    StyleCoordinator::new(
        document.clone(),
        fetcher,
        StyleConfig {
            reflow_delay: Duration::from_millis(20),
            reflow_hold: Duration::from_millis(10),
            ..StyleConfig::default()
        },
    )
}

#[tokio::test]
async fn probes_candidates_in_order() {
    let fetcher = FakeFetcher::new();
    fetcher.add_asset("http://localhost:5004/assets/style.css");
    fetcher.add_asset("http://localhost:5004/style.css");
    let document = Document::with_host_stylesheets(["/shell.css", "/fonts.css"]);
    let styles = coordinator(fetcher.clone(), &document);

    let href = styles.load_stylesheet(ORIGIN, "serviceApp", None).await;
    assert_eq!(href.as_deref(), Some("http://localhost:5004/assets/style.css"));
    assert_eq!(
        fetcher.probed(),
        vec![
            "http://localhost:5004/assets/index.css",
            "http://localhost:5004/dist/assets/index.css",
            "http://localhost:5004/assets/style.css",
        ]
    );

    let links = document.stylesheets();
    assert_eq!(links[1].id, "css-serviceApp");
    assert_eq!(links[1].microapp.as_deref(), Some("serviceApp"));
}

#[tokio::test]
async fn reload_replaces_previous_stylesheet() {
    let fetcher = FakeFetcher::new();
    let document = Document::with_host_stylesheets(["/shell.css"]);
    let styles = coordinator(fetcher.clone(), &document);

    styles
        .load_stylesheet(ORIGIN, "serviceApp", Some("assets/v1.css"))
        .await;
    styles
        .load_stylesheet(ORIGIN, "serviceApp", Some("/assets/v2.css"))
        .await;

    let tagged: Vec<String> = document
        .stylesheets()
        .into_iter()
        .filter(|l| l.microapp.as_deref() == Some("serviceApp"))
        .map(|l| l.href)
        .collect();
    assert_eq!(tagged, vec!["http://localhost:5004/assets/v2.css"]);
}

#[tokio::test]
async fn missing_stylesheet_leaves_app_unstyled() {
    let fetcher = FakeFetcher::new();
    let document = Document::new();
    let styles = coordinator(fetcher.clone(), &document);

    assert_eq!(styles.load_stylesheet(ORIGIN, "aboutApp", None).await, None);
    assert_eq!(fetcher.probed().len(), 5);
    assert!(document.stylesheets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reflow_toggles_marker_class_on_tagged_containers() {
    let fetcher = FakeFetcher::new();
    let document = Document::new();
    let tagged = document.create_container();
    tagged.set_attribute(MICROAPP_ATTR, "homeApp");
    let other = document.create_container();
    let styles = coordinator(fetcher, &document);

    styles
        .load_stylesheet(ORIGIN, "homeApp", Some("assets/index.css"))
        .await;
    assert!(!tagged.has_class("microapp-force-render"));

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(tagged.has_class("microapp-force-render"));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!tagged.has_class("microapp-force-render"));
    assert_eq!(tagged.times_added("microapp-force-render"), 1);
    assert_eq!(other.times_added("microapp-force-render"), 0);
}
