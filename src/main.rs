use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};

use loratrace::pipeline::{spawn_reader, Pipeline};
use loratrace::store::writer::Writer;
use loratrace::{init_logger, AppConfig, Broadcaster, OperatorMatcher, Store, TraceError};

#[derive(Parser)]
#[command(name = "loratrace")]
#[command(about = "Passive LoRaWAN traffic analyzer")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "loratrace.toml")]
    config: PathBuf,

    /// Apply schema migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), TraceError> {
    init_logger();

    let cli = Cli::parse();
    let config = AppConfig::from_file(&cli.config)?;

    let store = Store::connect(&config.postgres.url).await?;
    store.migrate().await?;
    if cli.migrate_only {
        return Ok(());
    }

    // custom operators from config are persisted, then the merged set
    // (config + previously stored) builds the live ruleset
    let custom_operators = store.sync_custom_operators(&config.custom_operators()).await?;
    let matcher = Arc::new(OperatorMatcher::new(&custom_operators));
    store.sync_hide_rules(&config.hide_rules).await?;

    let broadcaster = Arc::new(Broadcaster::new());
    match store.load_gateway_text().await {
        Ok(rows) => broadcaster.seed_gateways(rows),
        Err(e) => log::warn!("gateway cache seed failed: {e}"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (writer, writer_handle) = Writer::new(
        store.clone(),
        broadcaster.clone(),
        config.tuning.batch_size,
        std::time::Duration::from_millis(config.tuning.flush_interval_ms),
    );
    let writer_task = tokio::spawn(writer.run(shutdown_rx.clone()));

    let (inbound_tx, inbound_rx) = mpsc::channel(8192);
    let pipeline = Pipeline::new(
        matcher.clone(),
        broadcaster.clone(),
        writer_handle,
        chrono::Duration::days(config.tuning.session_sweep_days),
    );
    let pipeline_task = tokio::spawn(pipeline.run(inbound_rx, shutdown_rx.clone()));

    let mut reader_tasks = Vec::new();
    for broker in config.all_brokers() {
        reader_tasks.push(spawn_reader(broker, inbound_tx.clone(), shutdown_rx.clone()));
    }
    // the pipeline's channel closes when the last reader drops its sender
    drop(inbound_tx);

    log::info!(
        "loratrace running: {} broker(s), api contract bound at {}",
        reader_tasks.len(),
        config.api.bind
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| TraceError::Other(format!("signal handler: {e}")))?;
    log::info!("shutdown signal received");

    // stop readers first so the pipeline drains, then flush the writer
    let _ = shutdown_tx.send(true);
    for task in reader_tasks {
        let _ = task.await;
    }
    let _ = pipeline_task.await;
    match tokio::time::timeout(std::time::Duration::from_secs(10), writer_task).await {
        Ok(_) => log::info!("writer drained"),
        Err(_) => log::error!("writer did not drain within 10s, exiting anyway"),
    }

    Ok(())
}
