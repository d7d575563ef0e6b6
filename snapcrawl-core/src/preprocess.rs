//! Decoding and quality gates applied to fetched bytes.

use std::io::Cursor;

use image::{ColorType, DynamicImage, GrayImage, ImageDecoder, ImageFormat, ImageReader};
use thiserror::Error;

use crate::config::{ImageConfig, Orientation, WatermarkFilterConfig};

/// A decoded image with EXIF orientation already applied.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    /// Container format the bytes were decoded from.
    pub format: Option<ImageFormat>,
}

/// Why a fetched image was not kept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QualityRejection {
    #[error("undecodable image: {0}")]
    Undecodable(String),

    #[error("too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },

    #[error("grayscale image")]
    Grayscale,

    #[error("orientation mismatch: {width}x{height}")]
    Orientation { width: u32, height: u32 },

    #[error("watermark-like edges in border band")]
    Watermark,
}

/// Turns raw bytes into a decoded image or a rejection.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, bytes: &[u8]) -> Result<DecodedImage, QualityRejection>;
}

/// [`Preprocessor`] driven by the `image` section of the config.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    min_side: u32,
    accept_bw: bool,
    orientation: Orientation,
    watermark: WatermarkFilterConfig,
}

impl ImagePreprocessor {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            min_side: config.min_side,
            accept_bw: config.accept_bw,
            orientation: config.orientation,
            watermark: config.watermark_filter.clone(),
        }
    }

    fn decode(bytes: &[u8]) -> Result<(DynamicImage, Option<ImageFormat>), QualityRejection> {
        let undecodable = |e: image::ImageError| QualityRejection::Undecodable(e.to_string());

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| QualityRejection::Undecodable(e.to_string()))?;
        let format = reader.format();
        let mut decoder = reader.into_decoder().map_err(undecodable)?;
        let orientation = decoder.orientation().map_err(undecodable)?;
        let mut image = DynamicImage::from_decoder(decoder).map_err(undecodable)?;
        image.apply_orientation(orientation);
        Ok((image, format))
    }

    fn orientation_ok(&self, width: u32, height: u32) -> bool {
        let ratio = width as f32 / height.max(1) as f32;
        match self.orientation {
            Orientation::All => true,
            Orientation::Square => (0.9..=1.1).contains(&ratio),
            Orientation::Portrait => ratio < 0.9,
            Orientation::Landscape => ratio > 1.1,
        }
    }
}

/// Decode `bytes` with orientation applied and no quality gates.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, QualityRejection> {
    let (image, format) = ImagePreprocessor::decode(bytes)?;
    Ok(DecodedImage {
        width: image.width(),
        height: image.height(),
        image,
        format,
    })
}

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, bytes: &[u8]) -> Result<DecodedImage, QualityRejection> {
        let (image, format) = Self::decode(bytes)?;

        if is_grayscale(image.color()) && !self.accept_bw {
            return Err(QualityRejection::Grayscale);
        }

        let (width, height) = (image.width(), image.height());
        if width.min(height) < self.min_side {
            return Err(QualityRejection::TooSmall { width, height });
        }
        if !self.orientation_ok(width, height) {
            return Err(QualityRejection::Orientation { width, height });
        }
        if self.watermark.enable && has_watermark_band(&image.to_luma8(), &self.watermark) {
            return Err(QualityRejection::Watermark);
        }

        Ok(DecodedImage {
            image,
            width,
            height,
            format,
        })
    }
}

fn is_grayscale(color: ColorType) -> bool {
    matches!(
        color,
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16
    )
}

/// Fraction of neighbouring pixel pairs in rows `rows` whose luma differs by
/// more than `threshold`.
fn edge_density(luma: &GrayImage, rows: std::ops::Range<u32>, threshold: u8) -> f32 {
    let width = luma.width();
    let mut edges = 0u64;
    let mut total = 0u64;
    let px = |x: u32, y: u32| i16::from(luma.get_pixel(x, y).0[0]);

    for y in rows.clone() {
        for x in 0..width.saturating_sub(1) {
            total += 1;
            if (px(x + 1, y) - px(x, y)).unsigned_abs() > u16::from(threshold) {
                edges += 1;
            }
        }
    }
    for y in rows.start..rows.end.saturating_sub(1) {
        for x in 0..width {
            total += 1;
            if (px(x, y + 1) - px(x, y)).unsigned_abs() > u16::from(threshold) {
                edges += 1;
            }
        }
    }
    edges as f32 / total.max(1) as f32
}

/// Dense edges in the top or bottom band usually mean overlaid text.
fn has_watermark_band(luma: &GrayImage, config: &WatermarkFilterConfig) -> bool {
    let height = luma.height();
    if height == 0 {
        return false;
    }
    let band = ((height as f32 * config.band_ratio) as u32).clamp(1, height);
    let top = edge_density(luma, 0..band, config.edge_threshold);
    let bottom = edge_density(luma, height - band..height, config.edge_threshold);
    top.max(bottom) >= config.edge_density
}
