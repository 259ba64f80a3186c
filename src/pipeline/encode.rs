//! Image encoding helpers: resizing, JPEG previews and PNG payloads.
//!
//! Two different encodings are produced from the same rasters:
//!
//! * a tiny, lossy JPEG thumbnail embedded in [`crate::context::ImageMetadata`]
//!   as a `data:` URI, so JSON consumers can show the figure without a
//!   second file;
//! * a lossless PNG wrapped in [`ImageData`] for the vision model, where
//!   text crispness matters far more than size.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Prefix of every embedded preview.
pub const PREVIEW_PREFIX: &str = "data:image/jpeg;base64,";

/// Downscale so the longest side is at most `max_side`. Never upscales.
pub fn fit_longest_side(img: &DynamicImage, max_side: u32) -> DynamicImage {
    let max_side = max_side.max(1);
    if img.width() <= max_side && img.height() <= max_side {
        return img.clone();
    }
    img.resize(max_side, max_side, FilterType::Triangle)
}

/// Encode a JPEG thumbnail as a `data:image/jpeg;base64,` URI.
pub fn encode_preview(img: &DynamicImage, quality: u8) -> Result<String, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(&rgb)?;
    debug!(
        "Preview {}x{} → {} bytes JPEG (q={})",
        rgb.width(),
        rgb.height(),
        buf.len(),
        quality
    );
    Ok(format!("{PREVIEW_PREFIX}{}", STANDARD.encode(&buf)))
}

/// Encode an image as a base64 PNG ready for a vision model request.
pub fn encode_png(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([200, 30, 30, 255])))
    }

    #[test]
    fn fit_caps_longest_side_and_keeps_aspect() {
        let out = fit_longest_side(&solid(1120, 560), 560);
        assert_eq!(out.width(), 560);
        assert_eq!(out.height(), 280);
    }

    #[test]
    fn fit_never_upscales() {
        let out = fit_longest_side(&solid(40, 20), 560);
        assert_eq!((out.width(), out.height()), (40, 20));
    }

    #[test]
    fn preview_is_jpeg_data_uri() {
        let uri = encode_preview(&solid(16, 16), 20).expect("encode");
        let payload = uri.strip_prefix(PREVIEW_PREFIX).expect("prefix");
        let bytes = STANDARD.decode(payload).expect("valid base64");
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn png_payload_for_model() {
        let data = encode_png(&solid(10, 10)).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
