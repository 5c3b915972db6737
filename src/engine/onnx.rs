//! ONNX Runtime engine (CPU, optionally CUDA) for `ort = 2.0.0-rc.10`.
//!
//! - The image goes into the input named by `ModelCfg::input_name`
//!   (`image_tensor` for the exported DroneAid model).
//! - Outputs are read by `ModelCfg::output_names` (scores, then boxes), or
//!   by position when no names are configured.
//! - The CUDA provider is registered only with the `onnx-cuda` feature.

use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::{
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
    value::Tensor,
};

use crate::engine::Engine;
use crate::types::{InputTensor, ModelCfg, RawOutputs};

pub struct OnnxEngine {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
}

impl OnnxEngine {
    pub fn new(cfg: &ModelCfg) -> Result<Self> {
        let mut builder = SessionBuilder::new()
            .with_context(|| "failed to create ONNX session builder")?;
        builder = builder.with_optimization_level(GraphOptimizationLevel::Level3)?;

        #[cfg(feature = "onnx-cuda")]
        {
            builder = builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])?;
        }

        let session = builder
            .commit_from_file(&cfg.model_path)
            .with_context(|| format!("could not load ONNX model: {}", cfg.model_path))?;

        anyhow::ensure!(
            cfg.output_names.is_empty() || cfg.output_names.len() == 2,
            "output_names must name the scores and boxes outputs, got {:?}",
            cfg.output_names
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name: cfg.input_name.clone(),
            output_names: cfg.output_names.clone(),
        })
    }
}

impl Engine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn execute(&self, input: InputTensor) -> Result<RawOutputs> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;

        let input_tensor: Tensor<f32> = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => input_tensor
        ])?;

        let (scores_out, boxes_out) = match self.output_names.as_slice() {
            [scores, boxes] => (&outputs[scores.as_str()], &outputs[boxes.as_str()]),
            _ => (&outputs[0], &outputs[1]),
        };
        let scores = scores_out
            .try_extract_array::<f32>()
            .context("ONNX: scores output is not a f32 tensor")?
            .to_owned();
        let boxes = boxes_out
            .try_extract_array::<f32>()
            .context("ONNX: boxes output is not a f32 tensor")?
            .to_owned();

        Ok(RawOutputs { scores, boxes })
    }
}
