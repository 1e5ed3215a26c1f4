mod config;

use std::sync::Arc;

use config::ShellConfig;
use mosaic_core::bus::Callback;
use mosaic_core::mount::{HeadlessAdapter, MountOutcome};
use mosaic_core::durable::DurableTransport;
use mosaic_core::{HttpFetcher, MosaicError, Shell};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    mosaic_core::telemetry::init_tracing()?;

    // Defaults + env + optional TOML overlay
    let cfg = ShellConfig::load();
    info!(
        target: "shell",
        remotes = cfg.options.remotes.len(),
        server = %cfg.options.durable.server,
        "Starting Mosaic shell"
    );

    let fetcher = HttpFetcher::new(cfg.fetch_timeout).map_err(|e| MosaicError::Config(e.to_string()))?;
    let shell = Shell::new(
        cfg.options.clone(),
        durable_transport(&cfg),
        Arc::new(fetcher),
        Arc::new(HeadlessAdapter::new("native")),
    );
    for runtime in &cfg.runtimes {
        shell
            .host()
            .install_runtime(runtime, Arc::new(HeadlessAdapter::new(runtime)))?;
    }

    // Relayed navigation telemetry, for visibility
    let relay_log = shell.bus().subscribe(
        "app.navigation.*",
        Callback::infallible(|m| info!(target: "shell", subject = %m.subject, data = %m.data, "Navigation event")),
    );

    shell.start().await?;
    if let Some(path) = cfg.initial_path.as_deref() {
        report(&shell.navigate(path).await);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&shell, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(target: "shell", error = %e, "Failed to read input");
                        break;
                    }
                }
            }
            Some(path) = shell.next_navigation_request() => {
                report(&shell.navigate(&path).await);
            }
            _ = signal::ctrl_c() => {
                info!(target: "shell", "Interrupted");
                break;
            }
        }
    }

    relay_log.unsubscribe();
    shell.shutdown().await;
    Ok(())
}

#[cfg(feature = "nats")]
fn durable_transport(cfg: &ShellConfig) -> Arc<dyn DurableTransport> {
    info!(target: "shell", server = %cfg.options.durable.server, "Using NATS JetStream transport");
    Arc::new(mosaic_core::durable::NatsTransport::from_config(&cfg.options.durable))
}

// Without the `nats` feature navigation telemetry stays in this process.
#[cfg(not(feature = "nats"))]
fn durable_transport(_cfg: &ShellConfig) -> Arc<dyn DurableTransport> {
    info!(target: "shell", "Using in-process durable transport");
    Arc::new(mosaic_core::MemoryTransport::new())
}

/// Returns false when the shell should stop.
async fn handle_line(shell: &Shell, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some(":quit") | Some(":q") => return false,
        Some(":history") => {
            let limit = parts
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(shell.bus().config().default_history_limit);
            for m in shell.bus().event_history(limit) {
                println!("{} {} [{}] {}", m.timestamp.to_rfc3339(), m.subject, m.source, m.data);
            }
        }
        Some(":log") => match parts.next() {
            Some("on") => shell.event_log().enable(),
            Some("off") => shell.event_log().disable(),
            Some("clear") => shell.event_log().clear(),
            Some("toggle") => {
                let enabled = shell.event_log().toggle();
                println!("event log {}", if enabled { "enabled" } else { "disabled" });
            }
            _ => print!("{}", shell.event_log().render()),
        },
        Some(":retry") => match shell.retry_main().await {
            MountOutcome::Failed(e) => println!("retry failed: {}", e),
            outcome => println!("retry: {:?}", outcome),
        },
        Some(":status") => {
            println!("durable: {:?}", shell.durable().state());
            match shell.relay_status() {
                Ok(()) => println!("relay: {}", if shell.relay_active() { "active" } else { "idle" }),
                Err(e) => println!("relay: {}", e),
            }
            match serde_json::to_string(&shell.main_container().content()) {
                Ok(content) => println!("main: {}", content),
                Err(e) => warn!(target: "shell", error = %e, "Failed to encode container state"),
            }
            for link in shell.document().stylesheets() {
                println!("stylesheet {} {}", link.id, link.href);
            }
        }
        Some(path) if path.starts_with('/') => report(&shell.navigate(path).await),
        Some(other) => warn!(target: "shell", command = other, "Unknown command"),
    }
    true
}

fn report(report: &mosaic_core::shell::NavigationReport) {
    match (&report.app, &report.main) {
        (Some(app), Some(MountOutcome::Mounted)) => println!("{} -> {}", report.path, app),
        (Some(app), Some(MountOutcome::Failed(e))) => {
            println!("{} -> {} failed: {} (:retry to try again)", report.path, app, e)
        }
        (Some(app), _) => println!("{} -> {} (superseded)", report.path, app),
        (None, _) => println!("{} -> not found", report.path),
    }
}
