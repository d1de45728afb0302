//! Two-tier image compression.
//!
//! Incoming images produce two renditions: an **inference** tier capped at
//! 1200 px on the longest side (JPEG, fed to the model) and a **storage**
//! tier capped at 512 px re-encoded as WebP (kept in the continuum).
//! Aspect ratio is preserved and images are never upscaled; re-encoding
//! also strips metadata.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;

use crate::{Error, Result};

/// Longest-side cap for the inference tier.
pub const INFERENCE_MAX_DIM: u32 = 1200;
/// Longest-side cap for the storage tier.
pub const STORAGE_MAX_DIM: u32 = 512;
/// JPEG quality for the inference tier.
const INFERENCE_JPEG_QUALITY: u8 = 85;

/// One compressed rendition.
#[derive(Debug, Clone)]
pub struct CompressedImage {
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// Final width in pixels.
    pub width: u32,
    /// Final height in pixels.
    pub height: u32,
    /// Media type of the encoding.
    pub media_type: &'static str,
}

/// Both renditions of one input image.
#[derive(Debug, Clone)]
pub struct ImageTiers {
    /// Model-facing rendition (≤ 1200 px, JPEG).
    pub inference: CompressedImage,
    /// At-rest rendition (≤ 512 px, WebP).
    pub storage: CompressedImage,
}

/// Computes target dimensions that fit `max_dim`, preserving aspect ratio
/// and never upscaling.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn fit_dimensions(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dim {
        return (width, height);
    }
    let scale = f64::from(max_dim) / f64::from(longest);
    let fitted_w = ((f64::from(width) * scale).round() as u32).max(1);
    let fitted_h = ((f64::from(height) * scale).round() as u32).max(1);
    (fitted_w, fitted_h)
}

fn resize_to(image: &DynamicImage, max_dim: u32) -> DynamicImage {
    let (target_w, target_h) = fit_dimensions(image.width(), image.height(), max_dim);
    if (target_w, target_h) == (image.width(), image.height()) {
        image.clone()
    } else {
        image.resize_exact(target_w, target_h, FilterType::Lanczos3)
    }
}

fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), INFERENCE_JPEG_QUALITY);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| Error::op("jpeg_encode", e))?;
    Ok(bytes)
}

fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let encoder = WebPEncoder::new_lossless(Cursor::new(&mut bytes));
    image
        .to_rgba8()
        .write_with_encoder(encoder)
        .map_err(|e| Error::op("webp_encode", e))?;
    Ok(bytes)
}

/// Produces both compression tiers from raw image bytes.
pub fn compress_image(bytes: &[u8]) -> Result<ImageTiers> {
    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::InvalidInput(format!("unreadable image: {e}")))?
        .decode()
        .map_err(|e| Error::InvalidInput(format!("undecodable image: {e}")))?;

    let inference_image = resize_to(&image, INFERENCE_MAX_DIM);
    let storage_image = resize_to(&image, STORAGE_MAX_DIM);

    Ok(ImageTiers {
        inference: CompressedImage {
            bytes: encode_jpeg(&inference_image)?,
            width: inference_image.width(),
            height: inference_image.height(),
            media_type: "image/jpeg",
        },
        storage: CompressedImage {
            bytes: encode_webp(&storage_image)?,
            width: storage_image.width(),
            height: storage_image.height(),
            media_type: "image/webp",
        },
    })
}
