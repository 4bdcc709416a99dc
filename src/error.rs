use std::path::PathBuf;

use thiserror::Error;

use crate::registry::ModelKind;

/// A model artifact could not be turned into a usable handle.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("{kind} artifact not found at {}", path.display())]
    MissingArtifact { kind: ModelKind, path: PathBuf },
    #[error("failed to deserialize {kind} artifact {}: {source}", path.display())]
    Malformed {
        kind: ModelKind,
        path: PathBuf,
        #[source]
        source: ort::Error,
    },
    #[error("failed to read labels for {kind} from {}: {source}", path.display())]
    Labels {
        kind: ModelKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ONNX Runtime environment could not be initialised: {0}")]
    Environment(#[source] ort::Error),
    #[error("{kind} handle is invalid: {reason}")]
    Invalid { kind: ModelKind, reason: String },
}

/// The uploaded bytes are not an image we can decode.
#[derive(Error, Debug)]
#[error("uploaded bytes are not a decodable image: {0}")]
pub struct ImageDecodeError(#[from] pub image::ImageError);

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("{kind} forward pass failed: {source}")]
    Backend {
        kind: ModelKind,
        #[source]
        source: ort::Error,
    },
    #[error("{kind} produced an unexpected output: {detail}")]
    UnexpectedOutput { kind: ModelKind, detail: String },
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
    /// Activations or gradients were not captured; callers degrade to the
    /// unmodified image instead of failing.
    #[error("gradient capture failed: {0}")]
    GradientCapture(String),
}

impl InferenceError {
    pub fn backend(kind: ModelKind) -> impl FnOnce(ort::Error) -> Self {
        move |source| InferenceError::Backend { kind, source }
    }

    pub fn unexpected(kind: ModelKind, detail: impl Into<String>) -> Self {
        InferenceError::UnexpectedOutput {
            kind,
            detail: detail.into(),
        }
    }
}

/// Compositing a single region back into the full image failed. Recovered
/// locally: the region keeps its original pixels.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegionPasteError {
    #[error("composite is {actual:?} but region is {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("region at ({x}, {y}) size {width}x{height} exceeds image {image_width}x{image_height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// Umbrella error for one request through the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] ImageDecodeError),
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("failed to encode response image: {0}")]
    Encode(#[source] image::ImageError),
}

impl PipelineError {
    /// Model involved in the failure, when there is one.
    pub fn model_kind(&self) -> Option<ModelKind> {
        match self {
            PipelineError::ModelLoad(
                ModelLoadError::MissingArtifact { kind, .. }
                | ModelLoadError::Malformed { kind, .. }
                | ModelLoadError::Labels { kind, .. }
                | ModelLoadError::Invalid { kind, .. },
            ) => Some(*kind),
            PipelineError::Inference(
                InferenceError::Backend { kind, .. } | InferenceError::UnexpectedOutput { kind, .. },
            ) => Some(*kind),
            PipelineError::Inference(InferenceError::GradientCapture(_)) => Some(ModelKind::ExplanationSubstrate),
            _ => None,
        }
    }
}
