pub mod classification;
pub mod cli;
pub mod detection;
pub mod error;
pub mod explain;
pub mod helpers;
pub mod mapping;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod registry;
pub mod service;

pub use crate::classification::{Classification, ClassificationAdapter};
pub use crate::cli::Args;
pub use crate::detection::{BoundingBox, Detection, DetectionAdapter, DetectionPolicy};
pub use crate::error::{ImageDecodeError, InferenceError, ModelLoadError, PipelineError, RegionPasteError};
pub use crate::explain::{ExplanationEngine, SaliencyMap};
pub use crate::mapping::{ClassLabelTable, load_class_mapping};
pub use crate::model::{ExplanationSubstrate, GradientCapture, OnnxLoader, OnnxModel, Predictor};
pub use crate::pipeline::{DetectResponse, JpegImage, Pipeline};
pub use crate::preprocess::{PreprocessConfig, Processor, TensorLayout};
pub use crate::registry::{ModelHandle, ModelKind, ModelLoader, ModelRegistry, SlotStatus};
pub use crate::service::{AppState, router};
