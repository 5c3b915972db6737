//! Error kinds surfaced by the detection pipeline.
//!
//! Every stage returns these unchanged to its caller. Only the batch worker
//! turns a failure into an empty result, and it logs the error when it does.

use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroneAidError {
    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("model not available: {0}")]
    ModelUnavailable(String),

    #[error("model could not be loaded from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("no image provided")]
    EmptyInput,

    #[error("inference failed on {engine}: {reason}")]
    Inference { engine: &'static str, reason: String },

    #[error("invalid option value: {field} = {value}")]
    InvalidOption { field: &'static str, value: String },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<image::ImageError> for DroneAidError {
    fn from(err: image::ImageError) -> Self {
        DroneAidError::Decode(err.to_string())
    }
}

impl DroneAidError {
    pub(crate) fn shape(what: &'static str, expected: impl Display, actual: impl Display) -> Self {
        DroneAidError::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DroneAidError>;
