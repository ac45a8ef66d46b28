//! spotterd - video inference daemon
//!
//! Loads configuration, opens the database, and serves the local JSON API.
//! Pipeline runs are hosted on background threads: creating or updating a
//! video source, or posting its infer task, schedules a run that decodes the
//! source, paces frames against wall-clock time, runs the detector, and
//! persists the detection timeline.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spotter::api::{ApiConfig, ApiServer};
use spotter::config::SpotterConfig;
use spotter::objectstore::ObjectStore;
use spotter::pipeline::{Pipeline, RunLimits};
use spotter::sources::SourceRegistry;
use spotter::store::SqliteInferenceStore;
use spotter::S3Presigner;

#[derive(Parser)]
#[command(name = "spotterd", about = "Object detection timelines for video")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "SPOTTER_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = SpotterConfig::load_from(args.config.as_deref())?;

    // Bootstrap the schema before anything else touches the database.
    SourceRegistry::open(&cfg.db_path)?;
    SqliteInferenceStore::open(&cfg.db_path)?;

    let object_store: Arc<dyn ObjectStore> = Arc::new(S3Presigner::new(&cfg.object_store)?);
    let pipeline = Pipeline::new(
        &cfg.db_path,
        object_store.clone(),
        RunLimits {
            max_runtime: Some(cfg.pipeline.max_runtime),
        },
    );

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        &cfg.db_path,
        &cfg.object_store.bucket,
        object_store,
        pipeline,
    )
    .spawn()?;

    log::info!("spotterd running. writing to {}", cfg.db_path);
    log::info!("api listening on {}", api_handle.addr);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })?;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    api_handle.stop()?;
    Ok(())
}
