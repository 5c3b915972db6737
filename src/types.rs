use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::DroneAidError;

/// Longest side, in pixels, of the tensor handed to the model.
pub const DEFAULT_MAX_SIZE: u32 = 400;

/// Category names, indexed by the model's class index.
pub const LABELS: [&str; 8] = [
    "children", "ok", "water", "firstaid", "sos", "shelter", "elderly", "food",
];

/// Label for a class index, or `"unknown"` when the index is outside [`LABELS`].
pub fn label_for(class_index: i32) -> &'static str {
    usize::try_from(class_index)
        .ok()
        .and_then(|i| LABELS.get(i).copied())
        .unwrap_or("unknown")
}

/// NHWC image tensor with a batch of one: `[1, height, width, 3]`.
pub type InputTensor = Array4<f32>;

/// Raw tensors returned by the detection model.
#[derive(Debug, Clone)]
pub struct RawOutputs {
    /// Per-box class scores, `[1, num_boxes, num_classes]`.
    pub scores: ArrayD<f32>,
    /// Per-box `[y1, x1, y2, x2]` coordinates, `[1, num_boxes, 1, 4]`.
    pub boxes: ArrayD<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_index: i32,
    pub label: String,
    pub score: f32,
    /// `[y1, x1, y2, x2]`, normalized to the image, rounded to 4 decimals.
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessOptions {
    pub score_threshold: f64,
    pub iou_threshold: f64,
    pub max_num_boxes: usize,
}

impl Default for PostprocessOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.3,
            iou_threshold: 0.5,
            max_num_boxes: 10,
        }
    }
}

impl PostprocessOptions {
    pub fn with_score_threshold(mut self, value: f64) -> Self {
        self.score_threshold = value;
        self
    }

    pub fn with_iou_threshold(mut self, value: f64) -> Self {
        self.iou_threshold = value;
        self
    }

    pub fn with_max_num_boxes(mut self, value: usize) -> Self {
        self.max_num_boxes = value;
        self
    }

    pub fn validate(&self) -> Result<(), DroneAidError> {
        if !self.score_threshold.is_finite() {
            return Err(DroneAidError::InvalidOption {
                field: "score_threshold",
                value: self.score_threshold.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(DroneAidError::InvalidOption {
                field: "iou_threshold",
                value: self.iou_threshold.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelCfg {
    pub backend: String,
    pub model_path: String,
    /// Name of the model's image input slot.
    pub input_name: String,
    /// Scores then boxes. Empty means "take outputs by position".
    pub output_names: Vec<String>,
    pub warmup: bool,
    pub warmup_size: usize,
}

impl Default for ModelCfg {
    fn default() -> Self {
        Self {
            backend: "onnx".to_string(),
            model_path: "model_web/model.onnx".to_string(),
            input_name: "image_tensor".to_string(),
            output_names: Vec::new(),
            warmup: false,
            warmup_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessCfg {
    pub max_size: u32,
}

impl Default for PreprocessCfg {
    fn default() -> Self {
        Self { max_size: DEFAULT_MAX_SIZE }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeCfg {
    pub workers: usize,
}

impl Default for RuntimeCfg {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelCfg,
    pub preprocess: PreprocessCfg,
    pub postprocess: PostprocessOptions,
    pub runtime: RuntimeCfg,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        cfg.postprocess.validate()?;
        anyhow::ensure!(cfg.preprocess.max_size > 0, "preprocess.max_size must be positive");
        Ok(cfg)
    }
}

// Job/Report

#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub id: usize,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
