//! One-shot maintenance run: sweep abandoned uploads and retry queued blob deletions.
//!
//! Configuration comes from the environment (and `.env`); see `EngineConfig::from_env`.

use document_lifecycle_core::{DocumentEngine, EngineConfig, HostRegistry};
use log::{error, info};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("document_sweep failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_env()?;
    let retention = config.temp_retention;
    info!("Using database {}", config.database_url);

    // Swept documents are temporary, so they have no host references to clear
    let engine = DocumentEngine::connect(config, |_pool| Ok(HostRegistry::new())).await?;
    let worker = engine.file_deletion_worker();

    let sweep = worker.run_sweep().await?;
    let queue = worker.process_deletion_queue().await?;

    println!(
        "Swept documents older than {} hours: {} removed, {} failed",
        retention.num_hours(),
        sweep.removed.len(),
        sweep.failed.len()
    );
    for (id, reason) in &sweep.failed {
        println!("  {}: {}", id, reason);
    }
    println!(
        "Deletion queue: {} blob(s) deleted, {} still pending",
        queue.completed, queue.failed
    );

    engine.pool().close().await;
    Ok(())
}
