//! DroneAid symbol detection.
//!
//! An image is resized into a `[1, H, W, 3]` tensor, run through a detection
//! model behind the [`engine::Engine`] trait, and the raw scores and boxes
//! are reduced to labeled detections by greedy non-maximum suppression.

pub mod engine;
pub mod error;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod types;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use crate::engine::{Engine, EngineFactory, ModelLoader};
pub use crate::error::DroneAidError;
pub use crate::pipeline::Pipeline;
pub use crate::preprocess::{ImageInput, Preprocessor};
pub use crate::types::{Config, Detection, Job, PostprocessOptions, Report, LABELS};

/// Installs the fmt subscriber. `RUST_LOG` replaces the default `info` filter
/// when set.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .with_writer(std::io::stderr)
        .init();
}

fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Pipeline for `cfg` with a fresh, not yet loaded model.
pub fn build_pipeline(cfg: &Config) -> Pipeline {
    let loader = Arc::new(ModelLoader::new(cfg.model.clone()));
    Pipeline::new(
        Preprocessor::new(cfg.preprocess.max_size),
        loader,
        cfg.postprocess,
    )
}

/// Runs detection over `images` with `cfg.runtime.workers` workers sharing
/// one model. Reports come back in input order; a failed image yields a
/// report with an error and no detections.
pub async fn run_batch(cfg: Config, images: Vec<PathBuf>) -> Result<Vec<Report>> {
    let workers = cfg.runtime.workers.max(1);
    info!(
        "detecting in {} images: backend={}, workers={}, max_size={}",
        images.len(),
        cfg.model.backend,
        workers,
        cfg.preprocess.max_size
    );

    let pipeline = build_pipeline(&cfg);
    pipeline.loader.load(cfg.model.warmup).await?;

    run_jobs(pipeline, workers, images).await
}

/// Deals `images` to `workers` tasks that share `pipeline`.
pub async fn run_jobs(pipeline: Pipeline, workers: usize, images: Vec<PathBuf>) -> Result<Vec<Report>> {
    let workers = workers.max(1);
    let (report_tx, mut report_rx) = mpsc::channel::<Report>(images.len().max(1));

    // one channel per worker, jobs dealt round-robin
    let mut senders = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (tx_w, rx_w) = mpsc::channel::<Job>(512);
        senders.push(tx_w);
        let pipeline_cl = pipeline.clone();
        let report_tx_cl = report_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = worker::run_worker(worker_id, pipeline_cl, rx_w, report_tx_cl).await {
                error!("[worker {}] error: {:?}", worker_id, e);
            }
        }));
    }
    drop(report_tx);

    let dispatcher = tokio::spawn(async move {
        for (id, path) in images.into_iter().enumerate() {
            let tx = &senders[id % senders.len()];
            if tx.send(Job { id, path }).await.is_err() {
                break;
            }
        }
    });

    let mut reports = Vec::new();
    while let Some(report) = report_rx.recv().await {
        reports.push(report);
    }

    dispatcher.await?;
    for h in handles {
        h.await?;
    }

    reports.sort_by_key(|r| r.id);
    Ok(reports)
}
