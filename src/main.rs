//! droneaid CLI - detect DroneAid symbols in image files.
//!
//! Settings come from an optional TOML file; flags override it. One JSON
//! report per image is written to stdout, logs go to stderr.

use std::path::PathBuf;

use clap::Parser;
use droneaid::{init_tracing, run_batch, Config};

#[derive(Parser, Debug)]
#[command(name = "droneaid-cli", version, about = "Detect DroneAid symbols in images")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model file, overrides `model.model_path`
    #[arg(short, long)]
    model: Option<String>,

    /// Minimum score for a box to be considered
    #[arg(long)]
    score_threshold: Option<f64>,

    /// IoU above which the lower-scoring box is dropped
    #[arg(long)]
    iou_threshold: Option<f64>,

    /// Maximum number of detections per image
    #[arg(long)]
    max_boxes: Option<usize>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run a warm-up inference after loading the model
    #[arg(long)]
    warmup: bool,

    /// Images to process
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(model) = args.model {
        cfg.model.model_path = model;
    }
    if let Some(v) = args.score_threshold {
        cfg.postprocess.score_threshold = v;
    }
    if let Some(v) = args.iou_threshold {
        cfg.postprocess.iou_threshold = v;
    }
    if let Some(v) = args.max_boxes {
        cfg.postprocess.max_num_boxes = v;
    }
    if let Some(v) = args.workers {
        cfg.runtime.workers = v;
    }
    cfg.model.warmup |= args.warmup;
    cfg.postprocess.validate()?;

    for report in run_batch(cfg, args.images).await? {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}
