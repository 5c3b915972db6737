use anyhow::Result;

use crate::types::{InputTensor, ModelCfg, RawOutputs};

pub(crate) mod loader;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use loader::ModelLoader;

/// A loaded detection model.
///
/// `execute` takes the `[1, H, W, 3]` image tensor and returns the raw score
/// and box tensors. Implementations must tolerate concurrent callers.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, input: InputTensor) -> Result<RawOutputs>;
}

pub struct EngineFactory;

impl EngineFactory {
    pub fn create(cfg: &ModelCfg) -> Result<Box<dyn Engine>> {
        match cfg.backend.as_str() {
            #[cfg(feature = "onnx")]
            "onnx" => Ok(Box::new(crate::engine::onnx::OnnxEngine::new(cfg)?)),

            other => anyhow::bail!(
                "backend '{}' not supported (build with feature: onnx)",
                other
            ),
        }
    }
}
