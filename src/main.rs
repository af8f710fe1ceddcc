use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use slotguard::broker::{CommandLog, OffsetStore};
use slotguard::config::Config;
use slotguard::engine::{BookingStore, Engine};
use slotguard::processor::{ProcessorGroup, ShutdownOutcome};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotguard::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path(), config.store)?);
    let log = Arc::new(CommandLog::open(&config.command_log_dir(), config.partitions)?);
    let offsets = Arc::new(OffsetStore::open(&config.offsets_dir())?);

    info!("slotguard processor starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  partitions: {}", config.partitions);
    info!("  workers: {}", config.processor.workers);
    info!("  consumer_group: {}", config.processor.consumer_group);
    info!("  ownership: {:?}", config.store.ownership);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let store: Arc<dyn BookingStore> = engine.clone();
    let group = ProcessorGroup::start(log.clone(), offsets, store, config.processor.clone());

    let compactor_cancel = CancellationToken::new();
    let compactor = tokio::spawn(slotguard::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
        compactor_cancel.clone(),
    ));

    // Graceful shutdown: stop the processor on SIGTERM/ctrl-c, let in-flight batches checkpoint
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining partitions");

    let outcome = group.shutdown(config.shutdown_grace).await;
    compactor_cancel.cancel();
    compactor.await.ok();
    log.close();

    match outcome {
        ShutdownOutcome::Clean => info!("slotguard stopped"),
        ShutdownOutcome::Forced { aborted } => {
            tracing::warn!("slotguard stopped after aborting {aborted} workers")
        }
    }
    Ok(())
}
