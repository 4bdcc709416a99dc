use clap::ValueEnum;
use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::error::InferenceError;

/// Memory order of a 4D image or feature tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TensorLayout {
    /// batch, channels, height, width
    Nchw,
    /// batch, height, width, channels (Keras exports)
    Nhwc,
}

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub height: usize,
    pub width: usize,
    pub layout: TensorLayout,
    pub filter: FilterType,
    /// Grey level of letterbox padding.
    pub pad_value: u8,
}

impl PreprocessConfig {
    /// YOLO detector input: 640x640 letterbox, [0,1] scaling, NCHW.
    pub fn detector() -> Self {
        Self {
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            height: 640,
            width: 640,
            layout: TensorLayout::Nchw,
            filter: FilterType::Bilinear,
            pad_value: 114,
        }
    }

    /// MobileNet classifier input: 224x224 bicubic resize, [0,1] scaling, NHWC.
    pub fn classifier() -> Self {
        Self {
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            height: 224,
            width: 224,
            layout: TensorLayout::Nhwc,
            filter: FilterType::CatmullRom,
            pad_value: 0,
        }
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Where a letterboxed image sits inside the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Maps a point in model input coordinates back onto the source image.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Resizes an RGB image with the configured filter.
    pub fn resize(&self, image: &RgbImage, width: u32, height: u32) -> Result<RgbImage, InferenceError> {
        if image.width() == width && image.height() == height {
            return Ok(image.clone());
        }
        let src = ImageRef::new(image.width(), image.height(), image.as_raw(), PixelType::U8x3)
            .map_err(|e| InferenceError::Preprocess(format!("source buffer: {e}")))?;
        let mut dst = Image::new(width, height, PixelType::U8x3);

        let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(self.config.filter));
        let mut resizer = Resizer::new();
        resizer
            .resize(&src, &mut dst, &options)
            .map_err(|e| InferenceError::Preprocess(format!("resize to {width}x{height}: {e}")))?;

        RgbImage::from_raw(width, height, dst.buffer().to_vec())
            .ok_or_else(|| InferenceError::Preprocess("resized buffer has the wrong length".to_string()))
    }

    /// Resizes to exactly the model size, ignoring aspect ratio, and returns
    /// a batch of one.
    pub fn stretch(&self, image: &DynamicImage) -> Result<Array4<f32>, InferenceError> {
        self.stretch_rgb(&image.to_rgb8())
    }

    pub fn stretch_rgb(&self, image: &RgbImage) -> Result<Array4<f32>, InferenceError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::Preprocess("image has zero area".to_string()));
        }
        let resized = self.resize(image, self.config.width as u32, self.config.height as u32)?;
        Ok(self.to_tensor(&resized))
    }

    /// Scales the image to fit the model size keeping its aspect ratio and
    /// centres it on a padded canvas.
    pub fn letterbox(&self, image: &DynamicImage) -> Result<(Array4<f32>, Letterbox), InferenceError> {
        let rgb = image.to_rgb8();
        let (orig_width, orig_height) = rgb.dimensions();
        if orig_width == 0 || orig_height == 0 {
            return Err(InferenceError::Preprocess("image has zero area".to_string()));
        }
        let (width, height) = (self.config.width as u32, self.config.height as u32);
        let scale = (width as f32 / orig_width as f32).min(height as f32 / orig_height as f32);
        let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, width);
        let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, height);

        let resized = self.resize(&rgb, new_width, new_height)?;
        let pad = self.config.pad_value;
        let mut padded = RgbImage::from_pixel(width, height, image::Rgb([pad, pad, pad]));

        // Centre the resized image on the canvas
        let pad_x = (width - new_width) / 2;
        let pad_y = (height - new_height) / 2;
        image::imageops::overlay(&mut padded, &resized, pad_x as i64, pad_y as i64);

        Ok((self.to_tensor(&padded), Letterbox { scale, pad_x, pad_y }))
    }

    /// Normalizes pixels into a `[1, ...]` tensor in the configured layout.
    pub fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let mean = self.config.mean;
        let std = self.config.std;
        let value = |x: usize, y: usize, c: usize| {
            let pixel = image.get_pixel(x as u32, y as u32);
            (pixel[c] as f32 / 255.0 - mean[c]) / std[c]
        };
        match self.config.layout {
            TensorLayout::Nchw => Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| value(x, y, c)),
            TensorLayout::Nhwc => Array4::from_shape_fn((1, height, width, 3), |(_, y, x, c)| value(x, y, c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn stretch_produces_nhwc_batch_scaled_to_unit_range() {
        let processor = Processor::new(PreprocessConfig::classifier());
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([255, 0, 51])));

        let tensor = processor.stretch(&image).unwrap();

        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        assert!((tensor[[0, 10, 10, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 10, 10, 1]].abs() < 1e-6);
        assert!((tensor[[0, 100, 200, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let processor = Processor::new(PreprocessConfig::classifier());
        let rgba = image::RgbaImage::from_pixel(32, 32, image::Rgba([10, 20, 30, 0]));

        let tensor = processor.stretch(&DynamicImage::ImageRgba8(rgba)).unwrap();

        assert_eq!(tensor.shape()[3], 3);
        assert!((tensor[[0, 5, 5, 0]] - 10.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn mean_std_normalization_is_applied_per_channel() {
        let config = PreprocessConfig {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.25, 1.0],
            ..PreprocessConfig::classifier()
        }
        .with_layout(TensorLayout::Nchw);
        let processor = Processor::new(config);

        let tensor = processor.to_tensor(&RgbImage::from_pixel(4, 4, Rgb([255, 255, 0])));

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn letterbox_pads_short_side_and_unmaps_to_source() {
        let processor = Processor::new(PreprocessConfig::detector());
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([0, 0, 0])));

        let (tensor, letterbox) = processor.letterbox(&image).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(letterbox.pad_x, 0);
        assert_eq!(letterbox.pad_y, 80);
        assert!((letterbox.scale - 1.0).abs() < 1e-6);
        // padding rows are grey, content rows are black
        assert!((tensor[[0, 0, 10, 10]] - 114.0 / 255.0).abs() < 1e-6);
        assert!(tensor[[0, 0, 320, 10]].abs() < 1e-6);

        let (x, y) = letterbox.unmap(100.0, 180.0);
        assert!((x - 100.0).abs() < 1e-4);
        assert!((y - 100.0).abs() < 1e-4);
    }

    #[test]
    fn letterbox_scales_large_images_down() {
        let processor = Processor::new(PreprocessConfig::detector());
        let image = DynamicImage::ImageRgb8(RgbImage::new(1280, 640));

        let (_, letterbox) = processor.letterbox(&image).unwrap();

        assert!((letterbox.scale - 0.5).abs() < 1e-6);
        assert_eq!(letterbox.pad_y, 160);
        let (x, y) = letterbox.unmap(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 320.0).abs() < 1e-3);
    }
}
