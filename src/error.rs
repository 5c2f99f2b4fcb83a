//! Error types for SVDiff loading

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling spectral-shift models and grids
#[derive(Debug, Error)]
pub enum SvdiffError {
    /// The merged parameter collection lacks names the target model requires
    #[error(
        "cannot load model from {pretrained} because the following keys are missing: {}",
        .missing.join(", ")
    )]
    MissingKeys {
        pretrained: String,
        missing: Vec<String>,
    },

    /// The pretrained weights hold names the target model does not have
    #[error(
        "cannot load model from {pretrained} because the following keys are unexpected: {}",
        .unexpected.join(", ")
    )]
    UnexpectedKeys {
        pretrained: String,
        unexpected: Vec<String>,
    },

    /// The resolved spectral-shift checkpoint does not exist
    #[error("spectral shifts checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// No pretrained weight file was found for a model
    #[error("no pretrained weights found in {}", .0.display())]
    WeightsNotFound(PathBuf),

    /// A checkpoint entry names a parameter the model does not have
    #[error("unexpected parameter `{name}` in {}", .path.display())]
    UnexpectedParameter { name: String, path: PathBuf },

    /// A tensor does not have the shape the model declares for it
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Grid parameters disagree with the number of images
    #[error("image grid of {rows}x{cols} does not fit {actual} images")]
    GridShape {
        rows: u32,
        cols: u32,
        actual: usize,
    },

    #[error("unsupported tensor dtype {0:?}")]
    UnsupportedDtype(safetensors::Dtype),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for SVDiff operations
pub type Result<T> = std::result::Result<T, SvdiffError>;
