use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cli::Args;
use crate::classification::{Classification, ClassificationAdapter};
use crate::detection::{Detection, DetectionAdapter};
use crate::error::{ImageDecodeError, ModelLoadError, PipelineError};
use crate::explain::ExplanationEngine;
use crate::helpers::{Annotator, encode_jpeg};
use crate::mapping::{ClassLabelTable, load_class_mapping};
use crate::preprocess::{PreprocessConfig, Processor};
use crate::registry::{ModelKind, ModelRegistry};

/// Body of `POST /detect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    pub yolo_detections: Vec<Detection>,
    pub mobilenet_classification: Classification,
}

/// Encoded JPEG body of the visual endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegImage(pub Vec<u8>);

impl JpegImage {
    pub const CONTENT_TYPE: &'static str = "image/jpeg";

    fn encode(img: image::RgbImage) -> Result<Self, PipelineError> {
        encode_jpeg(img).map(JpegImage).map_err(PipelineError::Encode)
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ImageDecodeError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Request-time inference over the shared model registry. Every method is
/// blocking and handles one image.
pub struct Pipeline {
    registry: Arc<ModelRegistry>,
    detection: DetectionAdapter,
    classification: ClassificationAdapter,
    explanation: ExplanationEngine,
    annotator: Annotator,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ModelRegistry>,
        detection: DetectionAdapter,
        classification: ClassificationAdapter,
        explanation: ExplanationEngine,
        annotator: Annotator,
    ) -> Self {
        Self {
            registry,
            detection,
            classification,
            explanation,
            annotator,
        }
    }

    /// Wires adapters, labels and the annotator from the command line.
    pub fn from_args(args: &Args, registry: Arc<ModelRegistry>) -> anyhow::Result<Self> {
        let detector_labels = args.resolve(&args.detector_labels);
        let detector_labels = if detector_labels.is_file() {
            Some(load_class_mapping(&detector_labels).map_err(|source| ModelLoadError::Labels {
                kind: ModelKind::Detector,
                path: detector_labels.clone(),
                source,
            })?)
        } else {
            info!(path = %detector_labels.display(), "no detector label file, using the model's own class names");
            None
        };
        let classifier_labels = match &args.classifier_labels {
            Some(path) => {
                let path = args.resolve(path);
                load_class_mapping(&path).map_err(|source| ModelLoadError::Labels {
                    kind: ModelKind::Classifier,
                    path,
                    source,
                })?
            }
            None => ClassLabelTable::citrus(),
        };
        let annotator = match &args.font {
            Some(font) => Annotator::with_font_file(font)?,
            None => Annotator::new(),
        };

        let classifier_config = PreprocessConfig::classifier().with_layout(args.classifier_layout);
        let explainer_config = PreprocessConfig::classifier().with_layout(args.explainer_layout);
        Ok(Self::new(
            registry,
            DetectionAdapter::new(
                Processor::new(PreprocessConfig::detector()),
                args.detection_policy(),
                detector_labels,
            ),
            ClassificationAdapter::new(Processor::new(classifier_config), classifier_labels),
            ExplanationEngine::new(Processor::new(explainer_config), args.min_region),
            annotator,
        ))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, PipelineError> {
        let detector = self.registry.detector()?;
        Ok(self.detection.detect(detector.as_ref(), image)?)
    }

    pub fn classify(&self, image: &DynamicImage) -> Result<Classification, PipelineError> {
        let classifier = self.registry.classifier()?;
        Ok(self.classification.classify(classifier.as_ref(), image)?)
    }

    /// Detections and the whole-image classification in one response.
    pub fn detect_and_classify(&self, image: &DynamicImage) -> Result<DetectResponse, PipelineError> {
        let t = Instant::now();
        let yolo_detections = self.detect(image)?;
        let mobilenet_classification = self.classify(image)?;
        debug!(elapsed = ?t.elapsed(), detections = yolo_detections.len(), "detect and classify");
        Ok(DetectResponse {
            yolo_detections,
            mobilenet_classification,
        })
    }

    /// Whole-image Grad-CAM composite.
    pub fn gradcam(&self, image: &DynamicImage) -> Result<JpegImage, PipelineError> {
        let substrate = self.registry.substrate()?;
        let composite = self.explanation.explain(substrate.as_ref(), &image.to_rgb8())?;
        JpegImage::encode(composite)
    }

    /// The image with the detector's boxes drawn on it.
    pub fn annotated(&self, image: &DynamicImage) -> Result<JpegImage, PipelineError> {
        let detections = self.detect(image)?;
        let mut canvas = image.to_rgb8();
        self.annotator.draw_boxes(&mut canvas, &detections);
        JpegImage::encode(canvas)
    }

    /// Per-region Grad-CAM composite with the detections outlined.
    pub fn combined_heatmap(&self, image: &DynamicImage) -> Result<JpegImage, PipelineError> {
        let detections = self.detect(image)?;
        let substrate = self.registry.substrate()?;
        let composite = self
            .explanation
            .explain_regions(substrate.as_ref(), &image.to_rgb8(), &detections, &self.annotator)?;
        JpegImage::encode(composite)
    }
}
