//! Gradient-weighted class activation mapping (Grad-CAM).
//!
//! A saliency grid is formed from the feature map of a late convolution
//! layer weighted by the pooled gradients of the top class, normalized,
//! upscaled to the input, colour mapped and blended over the source pixels.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::detection::Detection;
use crate::error::{InferenceError, RegionPasteError};
use crate::helpers::Annotator;
use crate::model::{ExplanationSubstrate, GradientCapture};
use crate::preprocess::Processor;

/// Weight of the source pixels in the composite.
pub const ORIGINAL_WEIGHT: f32 = 0.7;
/// Weight of the colour-mapped heatmap in the composite.
pub const HEATMAP_WEIGHT: f32 = 0.3;

/// Single-channel saliency grid at feature map resolution, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    grid: Array2<f32>,
}

impl SaliencyMap {
    /// Channel weights are the spatial mean of the gradients; the map is
    /// the rectified weighted sum of the activation channels, divided by
    /// its maximum. An all-zero map is left as is.
    pub fn from_capture(capture: &GradientCapture) -> Self {
        let (_, height, width) = capture.activations.dim();
        let weights = capture
            .gradients
            .mean_axis(Axis(2))
            .and_then(|g| g.mean_axis(Axis(1)));

        let mut grid = Array2::<f32>::zeros((height, width));
        if let Some(weights) = weights {
            for (weight, channel) in weights.iter().zip(capture.activations.axis_iter(Axis(0))) {
                grid.scaled_add(*weight, &channel);
            }
        }
        grid.mapv_inplace(|v| v.max(0.0));

        let max = grid.iter().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            grid.mapv_inplace(|v| v / max);
        }
        Self { grid }
    }

    pub fn grid(&self) -> &Array2<f32> {
        &self.grid
    }

    /// True when nothing in the map is salient.
    pub fn is_blank(&self) -> bool {
        self.grid.iter().all(|v| *v <= 0.0)
    }

    /// Bilinear upscale to `width` x `height`.
    pub fn upscale(&self, width: u32, height: u32) -> ImageBuffer<Luma<f32>, Vec<f32>> {
        let (rows, cols) = self.grid.dim();
        let small = ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| Luma([self.grid[[y as usize, x as usize]]]));
        imageops::resize(&small, width, height, FilterType::Triangle)
    }

    /// Upscaled and colour mapped heatmap.
    pub fn colorize(&self, width: u32, height: u32) -> RgbImage {
        let up = self.upscale(width, height);
        RgbImage::from_fn(width, height, |x, y| jet(up.get_pixel(x, y)[0]))
    }
}

/// Jet colour ramp: dark blue at 0 through cyan, yellow to dark red at 1.
pub fn jet(value: f32) -> Rgb<u8> {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let ramp = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([ramp(3.0), ramp(2.0), ramp(1.0)])
}

/// `0.7 * original + 0.3 * heatmap` per channel, rounded into 8 bits.
pub fn blend(original: &RgbImage, heatmap: &RgbImage) -> RgbImage {
    RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let o = original.get_pixel(x, y);
        let h = heatmap.get_pixel(x, y);
        let mix = |c: usize| (ORIGINAL_WEIGHT * o[c] as f32 + HEATMAP_WEIGHT * h[c] as f32).round().clamp(0.0, 255.0) as u8;
        Rgb([mix(0), mix(1), mix(2)])
    })
}

/// Copies `patch` into `canvas` at `(x, y)` after checking it has exactly
/// the size of the region it replaces.
pub fn paste_region(
    canvas: &mut RgbImage,
    patch: &RgbImage,
    x: u32,
    y: u32,
    expected: (u32, u32),
) -> Result<(), RegionPasteError> {
    if patch.dimensions() != expected {
        return Err(RegionPasteError::SizeMismatch {
            expected,
            actual: patch.dimensions(),
        });
    }
    let (width, height) = expected;
    if x + width > canvas.width() || y + height > canvas.height() {
        return Err(RegionPasteError::OutOfBounds {
            x,
            y,
            width,
            height,
            image_width: canvas.width(),
            image_height: canvas.height(),
        });
    }
    imageops::replace(canvas, patch, x as i64, y as i64);
    Ok(())
}

pub struct ExplanationEngine {
    processor: Processor,
    min_region: u32,
}

impl ExplanationEngine {
    pub fn new(processor: Processor, min_region: u32) -> Self {
        Self { processor, min_region }
    }

    /// Whole-image explanation. When gradients cannot be captured, or the
    /// map has no salient cell, the original image comes back unmodified.
    pub fn explain(&self, substrate: &dyn ExplanationSubstrate, image: &RgbImage) -> Result<RgbImage, InferenceError> {
        let (width, height) = image.dimensions();
        let xs = self.processor.stretch_rgb(image)?;
        let capture = match substrate.instrumented_forward(xs) {
            Ok(capture) => capture,
            Err(InferenceError::GradientCapture(reason)) => {
                warn!(width, height, %reason, "gradient capture failed, returning the original image");
                return Ok(image.clone());
            }
            Err(e) => return Err(e),
        };

        let saliency = SaliencyMap::from_capture(&capture);
        if saliency.is_blank() {
            warn!(width, height, class_index = capture.class_index, "saliency map is blank, returning the original image");
            return Ok(image.clone());
        }
        debug!(width, height, class_index = capture.class_index, grid = ?saliency.grid().dim(), "saliency computed");

        Ok(blend(image, &saliency.colorize(width, height)))
    }

    /// Explains every detected region separately and pastes the results
    /// over a copy of the image, then outlines all detections. Without
    /// detections this is the whole-image explanation.
    pub fn explain_regions(
        &self,
        substrate: &dyn ExplanationSubstrate,
        image: &RgbImage,
        detections: &[Detection],
        annotator: &Annotator,
    ) -> Result<RgbImage, InferenceError> {
        if detections.is_empty() {
            debug!("no regions detected, explaining the whole image");
            return self.explain(substrate, image);
        }
        let (width, height) = image.dimensions();

        let regions: Vec<(u32, u32, u32, u32)> = detections
            .iter()
            .map(|d| d.bounding_box.pixel_rect(width, height))
            .filter(|&(x, y, w, h)| {
                let keep = w >= self.min_region && h >= self.min_region;
                if !keep {
                    debug!(x, y, w, h, min = self.min_region, "region too small, left unmodified");
                }
                keep
            })
            .collect();

        let patches = regions
            .par_iter()
            .map(|&(x, y, w, h)| {
                let crop = imageops::crop_imm(image, x, y, w, h).to_image();
                self.explain(substrate, &crop).map(|patch| ((x, y, w, h), patch))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut canvas = image.clone();
        for ((x, y, w, h), patch) in patches {
            if let Err(e) = paste_region(&mut canvas, &patch, x, y, (w, h)) {
                warn!(x, y, w, h, error = %e, "region paste failed, region left unmodified");
            }
        }

        annotator.draw_boxes(&mut canvas, detections);
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use crate::preprocess::PreprocessConfig;
    use ndarray::{Array1, Array3, Array4};

    /// Feature map with one hot cell in the top-left corner of channel 0.
    struct HotCorner {
        gradient: f32,
    }

    impl ExplanationSubstrate for HotCorner {
        fn instrumented_forward(&self, input: Array4<f32>) -> Result<GradientCapture, InferenceError> {
            assert_eq!(input.shape(), &[1, 224, 224, 3]);
            let mut activations = Array3::<f32>::zeros((2, 4, 4));
            activations[[0, 0, 0]] = 4.0;
            activations[[1, 3, 3]] = 4.0;
            let mut gradients = Array3::<f32>::zeros((2, 4, 4));
            gradients.index_axis_mut(Axis(0), 0).fill(self.gradient);
            gradients.index_axis_mut(Axis(0), 1).fill(-self.gradient);
            Ok(GradientCapture {
                scores: Array1::from(vec![0.2, 0.8]),
                class_index: 1,
                activations,
                gradients,
            })
        }
    }

    struct NoHooks;

    impl ExplanationSubstrate for NoHooks {
        fn instrumented_forward(&self, _input: Array4<f32>) -> Result<GradientCapture, InferenceError> {
            Err(InferenceError::GradientCapture("no feature map".to_string()))
        }
    }

    struct Broken;

    impl ExplanationSubstrate for Broken {
        fn instrumented_forward(&self, _input: Array4<f32>) -> Result<GradientCapture, InferenceError> {
            Err(InferenceError::Preprocess("backend down".to_string()))
        }
    }

    fn engine() -> ExplanationEngine {
        ExplanationEngine::new(Processor::new(PreprocessConfig::classifier()), 10)
    }

    fn grey(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
    }

    fn detection(b: [f32; 4]) -> Detection {
        Detection {
            bounding_box: BoundingBox::from(b),
            confidence: 0.8,
            class_index: 0,
            class_label: "leaf".to_string(),
        }
    }

    #[test]
    fn saliency_keeps_positive_evidence_only() {
        let capture = HotCorner { gradient: 0.5 }.instrumented_forward(Array4::zeros((1, 224, 224, 3))).unwrap();

        let map = SaliencyMap::from_capture(&capture);

        assert_eq!(map.grid()[[0, 0]], 1.0);
        assert_eq!(map.grid()[[3, 3]], 0.0);
        assert!(map.grid().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn zero_gradients_give_an_all_zero_map() {
        let capture = HotCorner { gradient: 0.0 }.instrumented_forward(Array4::zeros((1, 224, 224, 3))).unwrap();

        let map = SaliencyMap::from_capture(&capture);

        assert!(map.is_blank());
        assert!(map.grid().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn jet_runs_from_blue_to_red() {
        let cold = jet(0.0);
        let hot = jet(1.0);
        assert!(cold[2] > 100 && cold[0] == 0);
        assert!(hot[0] > 100 && hot[2] == 0);
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
        assert_eq!(jet(f32::NAN), jet(0.0));
    }

    #[test]
    fn blend_mixes_seventy_thirty() {
        let out = blend(&RgbImage::from_pixel(2, 2, Rgb([100, 0, 200])), &RgbImage::from_pixel(2, 2, Rgb([200, 250, 0])));
        assert_eq!(*out.get_pixel(1, 1), Rgb([130, 75, 140]));
    }

    #[test]
    fn upscale_matches_target_size_and_stays_in_range() {
        let map = SaliencyMap {
            grid: ndarray::array![[0.0, 1.0], [0.5, 0.25]],
        };
        let up = map.upscale(64, 48);
        assert_eq!(up.dimensions(), (64, 48));
        assert!(up.pixels().all(|p| (0.0..=1.0).contains(&p[0])));
    }

    #[test]
    fn explanation_tints_the_salient_corner() {
        let image = grey(64, 64);

        let out = engine().explain(&HotCorner { gradient: 1.0 }, &image).unwrap();

        assert_eq!(out.dimensions(), image.dimensions());
        assert_ne!(out, image);
        // hot corner leans red, cold corner leans blue
        let hot = out.get_pixel(0, 0);
        let cold = out.get_pixel(63, 63);
        assert!(hot[0] > hot[2]);
        assert!(cold[2] > cold[0]);
    }

    #[test]
    fn failed_capture_returns_the_original() {
        let image = grey(32, 32);
        assert_eq!(engine().explain(&NoHooks, &image).unwrap(), image);
    }

    #[test]
    fn blank_saliency_returns_the_original() {
        let image = grey(32, 32);
        assert_eq!(engine().explain(&HotCorner { gradient: 0.0 }, &image).unwrap(), image);
    }

    #[test]
    fn other_inference_errors_propagate() {
        assert!(engine().explain(&Broken, &grey(32, 32)).is_err());
    }

    #[test]
    fn no_detections_falls_back_to_whole_image() {
        let image = grey(48, 48);
        let substrate = HotCorner { gradient: 1.0 };

        let regions = engine().explain_regions(&substrate, &image, &[], &Annotator::new()).unwrap();

        assert_eq!(regions, engine().explain(&substrate, &image).unwrap());
    }

    #[test]
    fn regions_are_explained_in_place() {
        let image = grey(100, 100);

        let out = engine()
            .explain_regions(&HotCorner { gradient: 1.0 }, &image, &[detection([20.0, 20.0, 60.0, 60.0])], &Annotator::new())
            .unwrap();

        // inside the region: composited; outside: untouched
        assert_ne!(out.get_pixel(25, 25), image.get_pixel(25, 25));
        assert_eq!(out.get_pixel(80, 80), image.get_pixel(80, 80));
        assert_eq!(out.get_pixel(10, 10), image.get_pixel(10, 10));
    }

    #[test]
    fn narrow_region_is_left_unmodified() {
        let image = grey(100, 100);

        let out = engine()
            .explain_regions(
                &HotCorner { gradient: 1.0 },
                &image,
                &[detection([40.0, 10.0, 46.0, 90.0]), detection([60.0, 60.0, 90.0, 90.0])],
                &Annotator::new(),
            )
            .unwrap();

        // interior of the 6px wide box keeps the original pixels
        for y in 12..88 {
            assert_eq!(out.get_pixel(43, y), image.get_pixel(43, y));
        }
        assert_ne!(out.get_pixel(65, 65), image.get_pixel(65, 65));
    }

    #[test]
    fn paste_rejects_mismatched_patches() {
        let mut canvas = grey(20, 20);
        let patch = grey(5, 5);

        assert_eq!(
            paste_region(&mut canvas, &patch, 0, 0, (6, 5)),
            Err(RegionPasteError::SizeMismatch {
                expected: (6, 5),
                actual: (5, 5)
            })
        );
        assert!(matches!(
            paste_region(&mut canvas, &patch, 18, 0, (5, 5)),
            Err(RegionPasteError::OutOfBounds { .. })
        ));
        assert_eq!(canvas, grey(20, 20));

        assert!(paste_region(&mut canvas, &RgbImage::new(5, 5), 15, 15, (5, 5)).is_ok());
        assert_eq!(*canvas.get_pixel(19, 19), Rgb([0, 0, 0]));
    }
}
