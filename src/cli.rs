use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::detection::DetectionPolicy;
use crate::model::{ModelPaths, SubstrateOptions};
use crate::preprocess::TensorLayout;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "LEAFSIGHT_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "LEAFSIGHT_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory relative model paths are resolved against
    #[arg(long, env = "LEAFSIGHT_MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    /// YOLO detector ONNX model
    #[arg(long, default_value = "yolo11n.onnx")]
    pub detector: PathBuf,

    /// Citrus leaf classifier ONNX model
    #[arg(long, default_value = "best_model_mobilenet.onnx")]
    pub classifier: PathBuf,

    /// Grad-CAM feature extractor, image to late convolution feature map
    #[arg(long, default_value = "gradcam_features.onnx")]
    pub explainer_features: PathBuf,

    /// Grad-CAM head, feature map to class scores
    #[arg(long, default_value = "gradcam_head.onnx")]
    pub explainer_head: PathBuf,

    /// Detector labels, one per line; without the file the names stored in
    /// the model metadata are used
    #[arg(long, default_value = "detector-labels.txt")]
    pub detector_labels: PathBuf,

    /// Classifier labels, one per line; defaults to the built-in citrus labels
    #[arg(long)]
    pub classifier_labels: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = TensorLayout::Nhwc)]
    pub classifier_layout: TensorLayout,

    /// Layout of both the explainer input and its feature map
    #[arg(long, value_enum, default_value_t = TensorLayout::Nhwc)]
    pub explainer_layout: TensorLayout,

    #[arg(long, default_value_t = 0.25)]
    pub confidence: f32,

    #[arg(long, default_value_t = 0.7)]
    pub iou: f32,

    #[arg(long, default_value_t = 5)]
    pub max_detections: usize,

    /// Regions narrower or shorter than this many pixels are not explained
    #[arg(long, default_value_t = 10)]
    pub min_region: u32,

    /// Finite difference step for head gradients
    #[arg(long, default_value_t = 0.01)]
    pub gradient_epsilon: f32,

    /// Feature channels perturbed per head run
    #[arg(long, default_value_t = 64)]
    pub gradient_batch: usize,

    /// Request timeout in seconds
    #[arg(long, env = "LEAFSIGHT_REQUEST_TIMEOUT", default_value_t = 120)]
    pub request_timeout: u64,

    /// Concurrent inference calls
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Maximum upload size in bytes
    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    pub body_limit: usize,

    /// TrueType font for box captions
    #[arg(long)]
    pub font: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub cuda: bool,

    /// Let the CUDA arena grow only as requested
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub gpu_memory_growth: bool,

    /// Load every model before accepting requests
    #[arg(long, default_value_t = false)]
    pub warm_up: bool,
}

impl Args {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.resolve(&self.detector),
            classifier: self.resolve(&self.classifier),
            explainer_features: self.resolve(&self.explainer_features),
            explainer_head: self.resolve(&self.explainer_head),
        }
    }

    pub fn substrate_options(&self) -> SubstrateOptions {
        SubstrateOptions {
            layout: self.explainer_layout,
            epsilon: self.gradient_epsilon,
            batch: self.gradient_batch,
        }
    }

    pub fn detection_policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            confidence_threshold: self.confidence,
            iou_threshold: self.iou,
            max_detections: self.max_detections,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let args = Args::try_parse_from(["leafsight"]).unwrap();

        let policy = args.detection_policy();
        assert_eq!(policy.confidence_threshold, 0.25);
        assert_eq!(policy.max_detections, 5);
        assert_eq!(args.port, 8000);
        assert_eq!(args.classifier_layout, TensorLayout::Nhwc);
        assert!(args.gpu_memory_growth);
        assert_eq!(args.model_paths().detector, PathBuf::from("models/yolo11n.onnx"));
    }

    #[test]
    fn absolute_paths_are_not_rebased() {
        let args = Args::try_parse_from(["leafsight", "--classifier", "/srv/leaf.onnx", "--models-dir", "/opt/m"]).unwrap();

        let paths = args.model_paths();
        assert_eq!(paths.classifier, PathBuf::from("/srv/leaf.onnx"));
        assert_eq!(paths.explainer_head, PathBuf::from("/opt/m/gradcam_head.onnx"));
    }

    #[test]
    fn memory_growth_can_be_switched_off() {
        let args = Args::try_parse_from(["leafsight", "--cuda", "--gpu-memory-growth", "false"]).unwrap();
        assert!(args.cuda);
        assert!(!args.gpu_memory_growth);
    }
}
