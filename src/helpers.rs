use std::path::Path;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detection::Detection;

const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

/// Draws detections onto images: class-coloured boxes and, when a font is
/// available, a "label confidence" caption above each box.
#[derive(Clone, Default)]
pub struct Annotator {
    font: Option<Arc<FontVec>>,
}

impl Annotator {
    pub fn new() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self, anyhow::Error> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes)?;
        Ok(Self {
            font: Some(Arc::new(font)),
        })
    }

    pub fn draw_boxes(&self, img: &mut RgbImage, detections: &[Detection]) {
        let (width, height) = img.dimensions();
        for detection in detections {
            let color = Rgb(PALETTE[detection.class_index % PALETTE.len()]);
            let (x, y, w, h) = detection.bounding_box.pixel_rect(width, height);
            if w == 0 || h == 0 {
                continue;
            }

            // 2px outline
            draw_hollow_rect_mut(img, Rect::at(x as i32, y as i32).of_size(w, h), color);
            if w > 2 && h > 2 {
                draw_hollow_rect_mut(img, Rect::at(x as i32 + 1, y as i32 + 1).of_size(w - 2, h - 2), color);
            }

            if let Some(font) = &self.font {
                let font: &FontVec = font;
                let caption = format!("{} {:.2}", detection.class_label, detection.confidence);
                let scale = PxScale::from(16.0);
                let (text_w, text_h) = text_size(scale, font, &caption);
                let top = if y as i32 >= text_h as i32 + 2 { y as i32 - text_h as i32 - 2 } else { y as i32 };
                draw_filled_rect_mut(img, Rect::at(x as i32, top).of_size(text_w + 4, text_h + 2), color);
                draw_text_mut(img, Rgb([255, 255, 255]), x as i32 + 2, top, scale, font, &caption);
            }
        }
    }
}

const JPEG_QUALITY: u8 = 90;

/// Encodes an RGB image as JPEG bytes.
pub fn encode_jpeg(img: RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(&img)?;
    Ok(bytes)
}
