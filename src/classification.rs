use image::DynamicImage;
use ndarray::{Axis, Ix2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;
use crate::mapping::ClassLabelTable;
use crate::model::Predictor;
use crate::postprocess::{argmax_and_max, is_probability_vector, softmax};
use crate::preprocess::Processor;
use crate::registry::ModelKind;

/// Top-1 prediction of the whole-image classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "class_id")]
    pub class_index: usize,
    #[serde(rename = "class_name")]
    pub class_label: String,
    pub confidence: f32,
}

pub struct ClassificationAdapter {
    processor: Processor,
    labels: ClassLabelTable,
}

impl ClassificationAdapter {
    pub fn new(processor: Processor, labels: ClassLabelTable) -> Self {
        Self { processor, labels }
    }

    pub fn classify(&self, classifier: &dyn Predictor, image: &DynamicImage) -> Result<Classification, InferenceError> {
        let xs = self.processor.stretch(image)?;
        let ys = classifier.run(xs)?;
        let output = ys
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::unexpected(ModelKind::Classifier, "no output tensors"))?;
        let shape = output.shape().to_vec();
        let output = output
            .into_dimensionality::<Ix2>()
            .map_err(|_| InferenceError::unexpected(ModelKind::Classifier, format!("expected [1, classes], got {shape:?}")))?;
        if output.nrows() != 1 || output.ncols() == 0 {
            return Err(InferenceError::unexpected(
                ModelKind::Classifier,
                format!("expected [1, classes], got {shape:?}"),
            ));
        }

        // Exports without a final softmax hand back logits
        let row = output.index_axis(Axis(0), 0);
        let probabilities = if is_probability_vector(row) { row.to_owned() } else { softmax(row) };
        let (class_index, confidence) = argmax_and_max(probabilities.view());
        if !confidence.is_finite() {
            return Err(InferenceError::unexpected(ModelKind::Classifier, "non-finite class scores"));
        }
        debug!(class_index, confidence, "classified");

        Ok(Classification {
            class_index,
            class_label: self.labels.label(class_index).into_owned(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessConfig;
    use ndarray::{Array1, Array4, ArrayD};

    struct Fixed(Vec<f32>);

    impl Predictor for Fixed {
        fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
            assert_eq!(input.shape(), &[1, 224, 224, 3]);
            let n = self.0.len();
            Ok(vec![Array1::from(self.0.clone()).into_shape_with_order((1, n)).unwrap().into_dyn()])
        }
    }

    fn adapter() -> ClassificationAdapter {
        ClassificationAdapter::new(Processor::new(PreprocessConfig::classifier()), ClassLabelTable::citrus())
    }

    fn leaf() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(640, 480, image::Rgb([40, 160, 60])))
    }

    #[test]
    fn probabilities_are_reported_unscaled() {
        let result = adapter().classify(&Fixed(vec![0.05, 0.1, 0.7, 0.1, 0.05]), &leaf()).unwrap();

        assert_eq!(result.class_index, 2);
        assert_eq!(result.class_label, "healthy");
        assert!((result.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn probabilities_not_summing_to_one_are_not_rescaled() {
        let result = adapter().classify(&Fixed(vec![0.6, 0.3, 0.05, 0.02, 0.02]), &leaf()).unwrap();

        assert_eq!(result.class_label, "black spot");
        assert!((result.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn logits_are_turned_into_probabilities() {
        let result = adapter().classify(&Fixed(vec![1.0, 4.0, -2.0, 0.0, 0.5]), &leaf()).unwrap();

        assert_eq!(result.class_label, "greening");
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn index_outside_label_table_gets_synthesized_label() {
        let result = adapter()
            .classify(&Fixed(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]), &leaf())
            .unwrap();

        assert_eq!(result.class_index, 6);
        assert_eq!(result.class_label, "unknown class index: 6");
    }

    #[test]
    fn empty_output_is_an_inference_error() {
        let err = adapter().classify(&Fixed(vec![]), &leaf()).unwrap_err();
        assert!(matches!(err, InferenceError::UnexpectedOutput { kind: ModelKind::Classifier, .. }));
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_value(Classification {
            class_index: 4,
            class_label: "thrips".to_string(),
            confidence: 0.25,
        })
        .unwrap();

        assert_eq!(json, serde_json::json!({"class_id": 4, "class_name": "thrips", "confidence": 0.25}));
    }
}
