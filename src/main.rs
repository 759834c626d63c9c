// src/main.rs

//! The main entry point for the QueueFill controller.

use anyhow::Result;
use queuefill::config::Config;
use queuefill::core::reconciler::QueueFiller;
use queuefill::core::taskbuffer::pg::PgTaskBuffer;
use queuefill::core::tasks::queue_filler::QueueFillerTask;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("QueueFill version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; without one the built-in defaults are used.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Initialize logging, letting RUST_LOG override the configured filter.
    let log_filter =
        env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter))
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting QueueFill {VERSION} (vo '{}', dry_run {})", config.vo, config.dry_run);

    // Connect to the shared workload database.
    let buffer = Arc::new(
        PgTaskBuffer::connect(&config.database_url, config.database_max_connections).await?,
    );

    let filler = Arc::new(QueueFiller::new(
        buffer,
        &config.vo,
        config.prod_source_labels.clone(),
        config.dry_run,
    ));

    // Run the reconciliation loop until a shutdown signal arrives.
    let (shutdown_tx, _) = broadcast::channel(1);
    let task = QueueFillerTask::new(filler, config.tick_interval);
    let handle = tokio::spawn(task.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    let _ = shutdown_tx.send(());
    let _ = handle.await;

    Ok(())
}
