use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array1, Array3, Array4, ArrayD, Axis, CowArray, Ix2, Ix4};
use ort::execution_providers::{
    ArenaExtendStrategy, CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{InferenceError, ModelLoadError};
use crate::mapping::{ClassLabelTable, parse_names_metadata};
use crate::postprocess::argmax_and_max;
use crate::preprocess::TensorLayout;
use crate::registry::{ModelHandle, ModelKind, ModelLoader};

/// Opaque black-box model: one input tensor in, output tensors out.
pub trait Predictor: Send + Sync {
    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError>;

    /// Class names shipped with the model itself, if any.
    fn labels(&self) -> Option<&ClassLabelTable> {
        None
    }
}

/// Result of one instrumented forward pass through the explanation model.
#[derive(Debug, Clone)]
pub struct GradientCapture {
    pub scores: Array1<f32>,
    /// Top predicted class of this pass; the gradients target this class.
    pub class_index: usize,
    /// Feature map of the designated layer, `(channels, height, width)`.
    pub activations: Array3<f32>,
    /// d score / d activation, same shape as `activations`.
    pub gradients: Array3<f32>,
}

/// Model instrumented for class activation mapping.
pub trait ExplanationSubstrate: Send + Sync {
    fn instrumented_forward(&self, input: Array4<f32>) -> Result<GradientCapture, InferenceError>;
}

/// Execution provider selection for every ONNX session of the process.
pub struct OnnxModel {
    providers: Vec<ExecutionProviderDispatch>,
}

impl OnnxModel {
    pub fn new(cuda: bool, memory_growth: bool) -> Self {
        let providers = if cuda {
            let mut provider = CUDAExecutionProvider::default();
            if memory_growth {
                provider = provider.with_arena_extend_strategy(ArenaExtendStrategy::SameAsRequested);
            }
            vec![provider.build().error_on_failure()]
        } else {
            vec![CPUExecutionProvider::default().build()]
        };
        Self { providers }
    }

    pub fn load_model(&self, model_path: &Path) -> Result<Session, ort::Error> {
        SessionBuilder::new()?
            .with_execution_providers(self.providers.clone())?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)
    }
}

/// A single ONNX session. Calls are serialized by the lock.
pub struct OnnxPredictor {
    kind: ModelKind,
    session: Mutex<Session>,
    labels: Option<ClassLabelTable>,
}

impl OnnxPredictor {
    pub fn new(kind: ModelKind, session: Session) -> Self {
        Self {
            kind,
            session: Mutex::new(session),
            labels: None,
        }
    }

    /// Reads the `names` entry of the model's custom metadata, as written by
    /// Ultralytics exports.
    pub fn with_metadata_labels(mut self) -> Self {
        let names = {
            let session = self.session.lock();
            session
                .metadata()
                .and_then(|metadata| metadata.custom("names"))
                .ok()
                .flatten()
        };
        self.labels = names.as_deref().and_then(parse_names_metadata);
        match &self.labels {
            Some(labels) => debug!(model = %self.kind, classes = labels.len(), "class names read from model metadata"),
            None => debug!(model = %self.kind, "model metadata carries no class names"),
        }
        self
    }
}

impl Predictor for OnnxPredictor {
    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let t = Instant::now();
        let xs = CowArray::from(input);
        let input_data = ort::inputs![xs.view()].map_err(InferenceError::backend(self.kind))?;
        let session = self.session.lock();
        let ys = session.run(input_data).map_err(InferenceError::backend(self.kind))?;
        let outputs = ys
            .iter()
            .map(|(_k, v)| {
                v.try_extract_tensor::<f32>()
                    .map(|v| v.into_owned())
                    .map_err(InferenceError::backend(self.kind))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(model = %self.kind, elapsed = ?t.elapsed(), "forward pass");
        Ok(outputs)
    }

    fn labels(&self) -> Option<&ClassLabelTable> {
        self.labels.as_ref()
    }
}

/// Explanation model split at the designated convolution layer into a
/// feature extractor and a classification head.
///
/// The head starts with global average pooling, so d score / d activation
/// is constant over each channel's grid. It is measured by central
/// differences of the head under a uniform shift of one channel at a time.
pub struct OnnxSubstrate {
    features: Box<dyn Predictor>,
    head: Box<dyn Predictor>,
    layout: TensorLayout,
    epsilon: f32,
    batch: usize,
}

impl OnnxSubstrate {
    pub fn new(
        features: Box<dyn Predictor>,
        head: Box<dyn Predictor>,
        layout: TensorLayout,
        epsilon: f32,
        batch: usize,
    ) -> Self {
        Self {
            features,
            head,
            layout,
            epsilon,
            batch: batch.max(1),
        }
    }

    fn channel_axis(&self) -> usize {
        match self.layout {
            TensorLayout::Nchw => 1,
            TensorLayout::Nhwc => 3,
        }
    }

    fn head_scores(&self, input: Array4<f32>) -> Result<ndarray::Array2<f32>, InferenceError> {
        let output = self
            .head
            .run(input)?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::GradientCapture("head returned no outputs".to_string()))?;
        let shape = output.shape().to_vec();
        output
            .into_dimensionality::<Ix2>()
            .map_err(|_| InferenceError::GradientCapture(format!("head output has shape {shape:?}, expected 2D")))
    }
}

impl ExplanationSubstrate for OnnxSubstrate {
    fn instrumented_forward(&self, input: Array4<f32>) -> Result<GradientCapture, InferenceError> {
        let t = Instant::now();
        let features = self
            .features
            .run(input)?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::GradientCapture("feature extractor returned no outputs".to_string()))?;
        let shape = features.shape().to_vec();
        let features = features
            .into_dimensionality::<Ix4>()
            .map_err(|_| InferenceError::GradientCapture(format!("feature map has shape {shape:?}, expected 4D")))?;

        let scores = self.head_scores(features.clone())?;
        if scores.nrows() != 1 {
            return Err(InferenceError::GradientCapture(format!(
                "head scored {} rows for one image",
                scores.nrows()
            )));
        }
        let scores = scores.row(0).to_owned();
        let (class_index, _) = argmax_and_max(scores.view());

        let base = features.index_axis(Axis(0), 0);
        let channel_axis = self.channel_axis() - 1;
        let channels = base.len_of(Axis(channel_axis));
        let cells = (base.len() / channels.max(1)).max(1) as f32;

        let mut weights = Array1::<f32>::zeros(channels);
        let channel_ids: Vec<usize> = (0..channels).collect();
        for chunk in channel_ids.chunks(self.batch) {
            let views = vec![base.view(); chunk.len() * 2];
            let mut batch = ndarray::stack(Axis(0), &views)
                .map_err(|e| InferenceError::GradientCapture(format!("perturbation batch: {e}")))?;
            for (i, &k) in chunk.iter().enumerate() {
                let mut plus = batch.index_axis_mut(Axis(0), 2 * i);
                plus.index_axis_mut(Axis(channel_axis), k).mapv_inplace(|v| v + self.epsilon);
                let mut minus = batch.index_axis_mut(Axis(0), 2 * i + 1);
                minus.index_axis_mut(Axis(channel_axis), k).mapv_inplace(|v| v - self.epsilon);
            }

            let out = self.head_scores(batch)?;
            if out.nrows() != chunk.len() * 2 || class_index >= out.ncols() {
                return Err(InferenceError::GradientCapture(format!(
                    "head returned {:?} for a perturbation batch of {}",
                    out.shape(),
                    chunk.len() * 2
                )));
            }
            for (i, &k) in chunk.iter().enumerate() {
                let slope = (out[[2 * i, class_index]] - out[[2 * i + 1, class_index]]) / (2.0 * self.epsilon);
                weights[k] = slope / cells;
            }
        }

        let activations = match self.layout {
            TensorLayout::Nchw => base.to_owned(),
            TensorLayout::Nhwc => base.permuted_axes([2, 0, 1]).as_standard_layout().into_owned(),
        };
        let gradients = Array3::from_shape_fn(activations.raw_dim(), |(k, _, _)| weights[k]);

        if !activations.iter().chain(gradients.iter()).all(|v| v.is_finite()) {
            return Err(InferenceError::GradientCapture("non-finite activations or gradients".to_string()));
        }
        debug!(class_index, channels, elapsed = ?t.elapsed(), "instrumented forward pass");

        Ok(GradientCapture {
            scores,
            class_index,
            activations,
            gradients,
        })
    }
}

/// Where each model artifact lives on disk.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub classifier: PathBuf,
    pub explainer_features: PathBuf,
    pub explainer_head: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SubstrateOptions {
    pub layout: TensorLayout,
    pub epsilon: f32,
    pub batch: usize,
}

/// Builds ONNX Runtime handles for the registry.
pub struct OnnxLoader {
    model: OnnxModel,
    paths: ModelPaths,
    substrate: SubstrateOptions,
    environment: Mutex<bool>,
}

impl OnnxLoader {
    pub fn new(model: OnnxModel, paths: ModelPaths, substrate: SubstrateOptions) -> Self {
        Self {
            model,
            paths,
            substrate,
            environment: Mutex::new(false),
        }
    }

    /// Commits the process-wide ONNX Runtime environment once; retried
    /// until it succeeds.
    fn ensure_environment(&self) -> Result<(), ModelLoadError> {
        let mut committed = self.environment.lock();
        if !*committed {
            ort::init()
                .with_name("leafsight")
                .commit()
                .map_err(ModelLoadError::Environment)?;
            info!("ONNX Runtime environment committed");
            *committed = true;
        }
        Ok(())
    }

    fn session(&self, kind: ModelKind, path: &Path) -> Result<OnnxPredictor, ModelLoadError> {
        if !path.is_file() {
            return Err(ModelLoadError::MissingArtifact {
                kind,
                path: path.to_path_buf(),
            });
        }
        let session = self.model.load_model(path).map_err(|source| ModelLoadError::Malformed {
            kind,
            path: path.to_path_buf(),
            source,
        })?;
        debug!(model = %kind, path = %path.display(), "session created");
        Ok(OnnxPredictor::new(kind, session))
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
        self.ensure_environment()?;
        let handle = match kind {
            ModelKind::Detector => ModelHandle::Detector(std::sync::Arc::new(
                self.session(kind, &self.paths.detector)?.with_metadata_labels(),
            )),
            ModelKind::Classifier => {
                ModelHandle::Classifier(std::sync::Arc::new(self.session(kind, &self.paths.classifier)?))
            }
            ModelKind::ExplanationSubstrate => {
                let features = self.session(kind, &self.paths.explainer_features)?;
                let head = self.session(kind, &self.paths.explainer_head)?;
                ModelHandle::ExplanationSubstrate(std::sync::Arc::new(OnnxSubstrate::new(
                    Box::new(features),
                    Box::new(head),
                    self.substrate.layout,
                    self.substrate.epsilon,
                    self.substrate.batch,
                )))
            }
        };
        Ok(handle)
    }
}
