mod common;

use common::FakeFetcher;
use mosaic_core::dom::ContainerContent;
use mosaic_core::durable::{ConnectionState, MemoryTransport};
use mosaic_core::mount::{HeadlessAdapter, MountOutcome};
use mosaic_core::shell::{default_remotes, Shell, ShellOptions};
use mosaic_core::{MosaicError, Result};
use std::sync::Arc;
use std::time::Duration;

struct Site {
    shell: Shell,
    transport: MemoryTransport,
    native: HeadlessAdapter,
    vue: HeadlessAdapter,
}

fn site(options: ShellOptions) -> Site {
    let fetcher = FakeFetcher::new();
    for remote in default_remotes() {
        let component = remote.name.trim_end_matches("App").to_string();
        let mut exposes = serde_json::Map::new();
        exposes.insert(remote.export_key.clone(), serde_json::json!({ "default": component }));
        let manifest = serde_json::json!({
            "name": remote.name,
            "framework": remote.framework.to_string(),
            "exposes": exposes
        });
        fetcher.serve(&remote.url, manifest.to_string());
    }

    let transport = MemoryTransport::new();
    let native = HeadlessAdapter::new("native");
    let shell = Shell::new(
        options,
        Arc::new(transport.clone()),
        fetcher,
        Arc::new(native.clone()),
    );
    let vue = HeadlessAdapter::new("vue");
    shell
        .host()
        .install_runtime("vue", Arc::new(vue.clone()))
        .expect("install vue");
    Site {
        shell,
        transport,
        native,
        vue,
    }
}

#[tokio::test]
async fn navigation_mounts_routed_apps() -> Result<()> {
    let s = site(ShellOptions::default());
    s.shell.start().await?;
    assert!(s.shell.wait_connected(Duration::from_secs(1)).await);
    assert!(matches!(
        s.shell.footer_container().content(),
        ContainerContent::Mounted { .. }
    ));

    let home = s.shell.navigate("/").await;
    assert_eq!(home.app.as_deref(), Some("homeApp"));
    assert_eq!(home.main, Some(MountOutcome::Mounted));
    assert_eq!(s.vue.live_instances(), 1);

    let blog = s.shell.navigate("/blog/7").await;
    assert_eq!(blog.main, Some(MountOutcome::Mounted));
    assert_eq!(s.vue.live_instances(), 0);
    // navbar + footer + blog
    assert_eq!(s.native.live_instances(), 3);

    let missing = s.shell.navigate("/pricing").await;
    assert_eq!(missing.app, None);
    assert_eq!(missing.main, None);
    assert_eq!(
        s.shell.main_container().content(),
        ContainerContent::Placeholder {
            text: "Not found: /pricing".into()
        }
    );
    assert_eq!(s.native.live_instances(), 2);

    s.shell.shutdown().await;
    assert_eq!(s.native.live_instances(), 0);
    assert_eq!(s.shell.durable().state(), ConnectionState::Closed);
    // entering home, leaving home, entering blog, leaving blog
    assert_eq!(s.transport.entries().len(), 4);
    Ok(())
}

#[tokio::test]
async fn remotes_can_request_navigation() -> Result<()> {
    let s = site(ShellOptions::default());
    s.shell.start().await?;

    s.shell.host().navigate_to("/contact")?;
    let requested = tokio::time::timeout(Duration::from_secs(1), s.shell.next_navigation_request())
        .await
        .expect("request delivered");
    assert_eq!(requested.as_deref(), Some("/contact"));

    let report = s.shell.navigate("/contact").await;
    assert_eq!(report.app.as_deref(), Some("contactApp"));
    s.shell.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn relayed_navigation_reaches_the_event_log() -> Result<()> {
    let s = site(ShellOptions {
        event_log: true,
        durable: mosaic_core::DurableConfig {
            pull_interval: Duration::from_millis(10),
            pull_expires: Duration::from_millis(50),
            ..Default::default()
        },
        ..ShellOptions::default()
    });
    s.shell.start().await?;
    s.shell.navigate("/about").await;

    let relayed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let hit = s
                .shell
                .event_log()
                .entries()
                .iter()
                .any(|e| e.subject == "app.navigation.entering");
            if hit {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(relayed.is_ok(), "entering event should be relayed");
    s.shell.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_layout_remote_is_a_config_error() {
    let s = site(ShellOptions {
        navbar: Some("megaMenuApp".into()),
        ..ShellOptions::default()
    });
    let err = s.shell.start().await.unwrap_err();
    assert!(matches!(err, MosaicError::Config(_)));
}

fn fast_durable() -> mosaic_core::DurableConfig {
    mosaic_core::DurableConfig {
        reconnect_wait: Duration::from_millis(50),
        pull_interval: Duration::from_millis(10),
        pull_expires: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn relay_starts_once_a_late_connection_comes_up() -> Result<()> {
    let s = site(ShellOptions {
        event_log: true,
        durable: fast_durable(),
        ..ShellOptions::default()
    });
    s.transport.set_reachable(false);

    s.shell.start().await?;
    assert!(!s.shell.relay_active());
    assert!(matches!(
        s.shell.relay_status(),
        Err(MosaicError::Subscription(_))
    ));

    s.transport.set_reachable(true);
    s.shell.navigate("/about").await;
    assert!(s.shell.wait_connected(Duration::from_secs(1)).await);
    assert!(eventually(Duration::from_secs(1), || s.shell.relay_active()).await);
    assert!(s.shell.relay_status().is_ok());

    s.shell.navigate("/blog").await;
    let relayed = eventually(Duration::from_secs(1), || {
        s.shell.event_log().entries().iter().any(|e| {
            e.subject == "app.navigation.entering" && e.data["page"] == "blogApp"
        })
    })
    .await;
    assert!(relayed, "navigation after a late connect should be relayed");

    s.shell.shutdown().await;
    assert!(!s.shell.relay_active());
    Ok(())
}

#[tokio::test]
async fn navigating_to_the_current_path_keeps_the_mounted_app() -> Result<()> {
    let s = site(ShellOptions::default());
    s.shell.start().await?;

    let first = s.shell.navigate("/").await;
    assert_eq!(first.main, Some(MountOutcome::Mounted));
    let again = s.shell.navigate("/").await;
    assert_eq!(again.transition, None);
    assert_eq!(again.main, Some(MountOutcome::Mounted));

    let mounts = s
        .vue
        .events()
        .iter()
        .filter(|e| matches!(e, mosaic_core::mount::AdapterEvent::Mounted { .. }))
        .count();
    assert_eq!(mounts, 1);
    assert_eq!(s.vue.live_instances(), 1);

    s.shell.shutdown().await;
    Ok(())
}
