//! Image in, detections out.
//!
//! `Pipeline` chains the three stages: preprocessing, inference through the
//! shared [`ModelLoader`], and postprocessing. Every stage error is returned
//! to the caller unchanged. Clones share the same loader.

use std::sync::Arc;

use tracing::debug;

use crate::engine::ModelLoader;
use crate::error::Result;
use crate::postprocess::process_raw_outputs;
use crate::preprocess::{ImageInput, Preprocessor};
use crate::types::{Detection, InputTensor, PostprocessOptions, RawOutputs};

#[derive(Clone)]
pub struct Pipeline {
    pub preprocessor: Preprocessor,
    pub loader: Arc<ModelLoader>,
    /// Used when a call passes no options of its own.
    pub options: PostprocessOptions,
}

impl Pipeline {
    pub fn new(preprocessor: Preprocessor, loader: Arc<ModelLoader>, options: PostprocessOptions) -> Self {
        Self {
            preprocessor,
            loader,
            options,
        }
    }

    /// Decodes and resizes the image into the model's input tensor.
    pub async fn process_input(&self, image: ImageInput) -> Result<InputTensor> {
        self.preprocessor.preprocess(image).await
    }

    /// Runs the model, loading it first if needed.
    pub async fn run_inference(&self, tensor: InputTensor) -> Result<RawOutputs> {
        self.loader.inference(Some(tensor)).await
    }

    /// Turns raw model outputs into ranked detections.
    pub async fn process_output(
        &self,
        raw: RawOutputs,
        options: Option<&PostprocessOptions>,
    ) -> Result<Vec<Detection>> {
        process_raw_outputs(&raw, options.unwrap_or(&self.options))
    }

    /// All three stages for one image.
    pub async fn predict(
        &self,
        image: ImageInput,
        options: Option<&PostprocessOptions>,
    ) -> Result<Vec<Detection>> {
        let tensor = self.process_input(image).await?;
        debug!("input tensor {:?}", tensor.shape());
        let raw = self.run_inference(tensor).await?;
        let detections = self.process_output(raw, options).await?;
        debug!("{} detections", detections.len());
        Ok(detections)
    }
}
