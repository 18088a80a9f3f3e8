use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use holdfast::config::Config;
use holdfast::engine::Engine;
use holdfast::reclaimer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    holdfast::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::with_system_clock(
        config.wal_path(),
        config.hold_duration_ms,
    )?);

    info!("holdfast started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  events: {}", engine.list_events().await.len());
    info!("  hold_duration: {}ms", config.hold_duration_ms);
    info!("  reclaim_interval: {:?}", config.reclaim_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = CancellationToken::new();
    let reclaimer = tokio::spawn(reclaimer::run_reclaimer(
        engine.clone(),
        config.reclaim_interval,
        shutdown.clone(),
    ));
    let compactor = tokio::spawn(reclaimer::run_compactor(
        engine.clone(),
        config.compact_interval,
        config.compact_threshold,
        shutdown.clone(),
    ));

    wait_for_signal().await?;
    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();

    // A reclaim pass in progress finishes its current holds first.
    let drain = async {
        let _ = reclaimer.await;
        let _ = compactor.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("background tasks did not stop within 10s");
    }

    if let Err(e) = engine.audit().await {
        tracing::error!("final audit failed: {e}");
    }
    engine.shutdown().await;
    info!("holdfast stopped");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}
