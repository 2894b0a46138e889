//! Scanner daemon entry point.

use screen_scanner::backend::XcapBackend;
use screen_scanner::click::LogInjector;
use screen_scanner::{Config, ScanEvent, ScanOrchestrator};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

#[tokio::main]
async fn main() {
    // Logging comes up before the config is read so load-time messages are
    // not lost; the configured level is applied right after, and RUST_LOG
    // wins over it when set.
    let (filter, filter_handle) = reload::Layer::new(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();
    if std::env::var("RUST_LOG").is_err() {
        let _ = filter_handle.reload(EnvFilter::new(&config.general.log_level));
    }

    info!("screen-scanner starting");

    if !config.general.enabled {
        info!("Scanner disabled in config, exiting");
        return;
    }

    let (mut orchestrator, mut events) = ScanOrchestrator::new(
        config,
        Box::new(XcapBackend::new()),
        Box::new(LogInjector),
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Status(status) => info!("status: {}", status),
                ScanEvent::Hit {
                    confidence,
                    screen_x,
                    screen_y,
                    timestamp,
                } => info!(
                    "hit: {:.3} at ({}, {}) [{}]",
                    confidence,
                    screen_x,
                    screen_y,
                    timestamp.to_rfc3339()
                ),
                ScanEvent::Log(line) => info!("{}", line),
            }
        }
    });

    if let Err(e) = orchestrator.start().await {
        error!("Failed to start scan pipeline: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        _ = orchestrator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    orchestrator.shutdown().await;
    info!("screen-scanner exited");
}
