//! Batch worker.
//!
//! Each worker pulls jobs from its own channel and runs the full pipeline on
//! them. This is the outermost boundary: a failed image is logged and
//! reported with no detections, and the worker moves on to the next job.

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::pipeline::Pipeline;
use crate::preprocess::ImageInput;
use crate::types::{Job, Report};

/// Runs jobs until the input channel closes or the report receiver is gone.
///
/// # Arguments
///
/// * `worker_id` - Index used in log lines
/// * `pipeline` - Shared pipeline (all workers use the same model loader)
/// * `rx` - Incoming jobs
/// * `tx` - Outgoing reports, one per job
pub async fn run_worker(
    worker_id: usize,
    pipeline: Pipeline,
    mut rx: mpsc::Receiver<Job>,
    tx: mpsc::Sender<Report>,
) -> Result<()> {
    info!("worker {} started", worker_id);

    while let Some(job) = rx.recv().await {
        let report = process_job(&pipeline, job).await;
        if let Some(err) = &report.error {
            error!("[worker {}] {}: {}", worker_id, report.path.display(), err);
        } else {
            debug!(
                "[worker {}] {}: {} detections",
                worker_id,
                report.path.display(),
                report.detections.len()
            );
        }
        if tx.send(report).await.is_err() {
            break; // receiver dropped
        }
    }

    info!("worker {} finished", worker_id);
    Ok(())
}

/// Runs one job and folds a failure into the report.
pub async fn process_job(pipeline: &Pipeline, job: Job) -> Report {
    let result = pipeline
        .predict(ImageInput::Path(job.path.clone()), None)
        .await;

    let (detections, error) = match result {
        Ok(detections) => (detections, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    Report {
        id: job.id,
        path: job.path,
        timestamp: Utc::now(),
        detections,
        error,
    }
}
