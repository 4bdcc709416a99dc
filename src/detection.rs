use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;
use crate::mapping::ClassLabelTable;
use crate::model::Predictor;
use crate::postprocess::{Candidate, decode_yolo, non_maximum_suppression};
use crate::preprocess::{Letterbox, Processor};
use crate::registry::ModelKind;

/// Axis-aligned box in source image pixels. Always `x1 <= x2`, `y1 <= y2`.
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Clipped to `[0, width] x [0, height]`.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::new(
            self.x1.clamp(0.0, w),
            self.y1.clamp(0.0, h),
            self.x2.clamp(0.0, w),
            self.y2.clamp(0.0, h),
        )
    }

    /// Integer pixel rectangle `(x, y, width, height)` covered by the box
    /// inside an image of the given size.
    pub fn pixel_rect(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clipped = self.clip(width, height);
        let x = clipped.x1.floor() as u32;
        let y = clipped.y1.floor() as u32;
        let right = (clipped.x2.ceil() as u32).min(width);
        let bottom = (clipped.y2.ceil() as u32).min(height);
        (x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(b: [f32; 4]) -> Self {
        BoundingBox::new(b[0], b[1], b[2], b[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    #[serde(rename = "class_id")]
    pub class_index: usize,
    #[serde(rename = "class_name")]
    pub class_label: String,
}

/// Fixed filtering policy applied to every detector run.
#[derive(Debug, Clone, Copy)]
pub struct DetectionPolicy {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
            max_detections: 5,
        }
    }
}

/// Turns the raw detector head into labelled detections.
///
/// Labels come from the configured table when there is one, else from the
/// names the detector carries, else they are synthesized from the index.
pub struct DetectionAdapter {
    processor: Processor,
    policy: DetectionPolicy,
    labels: Option<ClassLabelTable>,
}

impl DetectionAdapter {
    pub fn new(processor: Processor, policy: DetectionPolicy, labels: Option<ClassLabelTable>) -> Self {
        Self {
            processor,
            policy,
            labels,
        }
    }

    /// Runs the detector. No object above the threshold gives an empty list.
    pub fn detect(&self, detector: &dyn Predictor, image: &DynamicImage) -> Result<Vec<Detection>, InferenceError> {
        let (xs, letterbox) = self.processor.letterbox(image)?;
        let ys = detector.run(xs)?;
        let output = ys
            .first()
            .ok_or_else(|| InferenceError::unexpected(ModelKind::Detector, "no output tensors"))?;
        let candidates = decode_yolo(output, self.policy.confidence_threshold)
            .map_err(|detail| InferenceError::unexpected(ModelKind::Detector, detail))?;
        let raw = candidates.len();

        let mut kept = non_maximum_suppression(candidates, self.policy.iou_threshold);
        kept.truncate(self.policy.max_detections);
        debug!(raw, kept = kept.len(), "detections filtered");

        let unnamed = ClassLabelTable::empty();
        let labels = self.labels.as_ref().or(detector.labels()).unwrap_or(&unnamed);
        Ok(kept
            .into_iter()
            .map(|c| to_detection(c, labels, &letterbox, image.width(), image.height()))
            .collect())
    }
}

fn to_detection(
    candidate: Candidate,
    labels: &ClassLabelTable,
    letterbox: &Letterbox,
    width: u32,
    height: u32,
) -> Detection {
    let [x1, y1, x2, y2] = candidate.bbox;
    let (x1, y1) = letterbox.unmap(x1, y1);
    let (x2, y2) = letterbox.unmap(x2, y2);
    Detection {
        bounding_box: BoundingBox::new(x1, y1, x2, y2).clip(width, height),
        confidence: candidate.confidence,
        class_index: candidate.class_index,
        class_label: labels.label(candidate.class_index).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessConfig;
    use ndarray::{Array3, Array4, ArrayD};

    /// Replays a fixed `[1, 4 + nc, anchors]` head.
    struct Scripted(Vec<[f32; 6]>);

    impl Predictor for Scripted {
        fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
            assert_eq!(input.shape(), &[1, 3, 640, 640]);
            let anchors = self.0.len().max(8);
            let mut output = Array3::<f32>::zeros((1, 6, anchors));
            for (a, row) in self.0.iter().enumerate() {
                for (k, v) in row.iter().enumerate() {
                    output[[0, k, a]] = *v;
                }
            }
            Ok(vec![output.into_dyn()])
        }
    }

    /// Same head, carrying its own class names.
    struct Named(Scripted, ClassLabelTable);

    impl Predictor for Named {
        fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
            self.0.run(input)
        }

        fn labels(&self) -> Option<&ClassLabelTable> {
            Some(&self.1)
        }
    }

    fn adapter_with(labels: Option<ClassLabelTable>) -> DetectionAdapter {
        DetectionAdapter::new(Processor::new(PreprocessConfig::detector()), DetectionPolicy::default(), labels)
    }

    fn adapter() -> DetectionAdapter {
        adapter_with(Some(ClassLabelTable::new(["leaf", "fruit"])))
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::new(640, 480))
    }

    #[test]
    fn boxes_are_mapped_back_through_the_letterbox() {
        let detector = Scripted(vec![[320.0, 320.0, 100.0, 50.0, 0.9, 0.05]]);

        let detections = adapter().detect(&detector, &image()).unwrap();

        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.class_label, "leaf");
        assert_eq!(<[f32; 4]>::from(d.bounding_box), [270.0, 215.0, 370.0, 265.0]);
    }

    #[test]
    fn model_names_are_used_without_a_label_file() {
        let detector = Named(
            Scripted(vec![[320.0, 320.0, 100.0, 50.0, 0.0, 0.9]]),
            ClassLabelTable::new(["person", "bicycle"]),
        );

        let detections = adapter_with(None).detect(&detector, &image()).unwrap();
        assert_eq!(detections[0].class_label, "bicycle");

        // a configured table wins over the model's own names
        let detections = adapter().detect(&detector, &image()).unwrap();
        assert_eq!(detections[0].class_label, "fruit");
    }

    #[test]
    fn unnamed_classes_get_synthesized_labels() {
        let detector = Scripted(vec![[320.0, 320.0, 100.0, 50.0, 0.0, 0.9]]);

        let detections = adapter_with(None).detect(&detector, &image()).unwrap();

        assert_eq!(detections[0].class_label, "unknown class index: 1");
    }

    #[test]
    fn threshold_and_cap_are_enforced() {
        let rows = (0..9)
            .map(|i| [40.0 + 60.0 * i as f32, 300.0, 20.0, 20.0, 0.2 + 0.08 * i as f32, 0.0])
            .collect();

        let detections = adapter().detect(&Scripted(rows), &image()).unwrap();

        assert_eq!(detections.len(), 5);
        assert!(detections.iter().all(|d| d.confidence >= 0.25));
        assert!(detections.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }

    #[test]
    fn nothing_above_threshold_is_an_empty_list() {
        let detector = Scripted(vec![[320.0, 320.0, 100.0, 50.0, 0.1, 0.2]]);
        assert!(adapter().detect(&detector, &image()).unwrap().is_empty());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let detector = Scripted(vec![
            [100.0, 200.0, 30.0, 30.0, 0.5, 0.0],
            [400.0, 300.0, 30.0, 30.0, 0.0, 0.5],
        ]);
        let adapter = adapter();

        let first = adapter.detect(&detector, &image()).unwrap();
        let second = adapter.detect(&detector, &image()).unwrap();

        assert_eq!(first, second);
        // equal confidences fall back to class order
        assert_eq!(first[0].class_index, 0);
        assert_eq!(first[1].class_label, "fruit");
    }

    #[test]
    fn boxes_are_clipped_to_the_image() {
        let detector = Scripted(vec![[10.0, 100.0, 60.0, 60.0, 0.9, 0.0]]);

        let detections = adapter().detect(&detector, &image()).unwrap();

        let b = detections[0].bounding_box;
        assert_eq!(b.x1(), 0.0);
        assert_eq!(b.y1(), 0.0);
        assert!(b.x2() <= 640.0 && b.y2() <= 480.0);
    }

    #[test]
    fn detection_serializes_with_wire_names() {
        let detection = Detection {
            bounding_box: BoundingBox::new(10.0, 20.0, 5.0, 40.0),
            confidence: 0.5,
            class_index: 3,
            class_label: "scab".to_string(),
        };

        let json = serde_json::to_value(&detection).unwrap();

        assert_eq!(json["box"], serde_json::json!([5.0, 20.0, 10.0, 40.0]));
        assert_eq!(json["class_id"], 3);
        assert_eq!(json["class_name"], "scab");
        assert_eq!(json["confidence"], 0.5);
    }

    #[test]
    fn pixel_rect_covers_fractional_boxes() {
        let b = BoundingBox::new(10.4, 5.5, 30.2, 25.0);
        assert_eq!(b.pixel_rect(100, 100), (10, 5, 21, 20));
        assert_eq!(BoundingBox::new(90.0, 90.0, 120.0, 95.0).pixel_rect(100, 100), (90, 90, 10, 5));
    }
}
