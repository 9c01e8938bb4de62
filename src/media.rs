//! Attachment handling
//!
//! Shrinks inbound images before they are embedded as data-URI content
//! parts, and summarises non-image attachments for history placeholders.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;

/// Longest edge allowed before an image is downscaled
const MAX_IMAGE_DIMENSION: u32 = 1568;

/// JPEG quality used when re-encoding shrunk images
const JPEG_QUALITY: u8 = 85;

/// Downscale an image above the pixel budget and re-encode as JPEG.
///
/// Images already within budget pass through untouched with their original
/// mime type.
pub fn shrink_image(data: &[u8], mime: &str) -> Result<(Vec<u8>, String)> {
    let img = image::load_from_memory(data).context("Unsupported image payload")?;

    let (w, h) = (img.width(), img.height());
    if w.max(h) <= MAX_IMAGE_DIMENSION {
        return Ok((data.to_vec(), mime.to_string()));
    }

    let scale = MAX_IMAGE_DIMENSION as f32 / w.max(h) as f32;
    let nw = ((w as f32 * scale) as u32).max(1);
    let nh = ((h as f32 * scale) as u32).max(1);
    let resized = img.resize(nw, nh, image::imageops::FilterType::Triangle);

    let mut out = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    resized
        .to_rgb8()
        .write_with_encoder(encoder)
        .context("Failed to re-encode image")?;

    debug!("Shrunk image {}x{} -> {}x{} ({} -> {} bytes)", w, h, nw, nh, data.len(), out.get_ref().len());
    Ok((out.into_inner(), "image/jpeg".to_string()))
}

/// Build a data URI for an image payload, shrinking it first
pub fn image_data_uri(data: &[u8], mime: &str) -> Result<String> {
    let (bytes, mime) = shrink_image(data, mime)?;
    Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
}

/// Wrap an uploaded text file's contents for inline embedding.
///
/// Binary files are rejected: the pipeline only embeds files it can read
/// back as UTF-8.
pub fn embed_file(data: &[u8], name: &str) -> Result<String> {
    let text = std::str::from_utf8(data)
        .map_err(|_| anyhow::anyhow!("Unsupported file type: {} is not a text file", name))?;
    Ok(format!("[Attached file: {}]\n{}", name, text))
}

/// Compact placeholder recorded in history for non-text content
pub fn placeholder_summary(kind: &str, detail: &str) -> String {
    if detail.is_empty() {
        format!("[{}]", kind)
    } else {
        format!("[{}: {}]", kind, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    #[test]
    fn small_image_passes_through() {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        let data = buf.into_inner();

        let (out, mime) = shrink_image(&data, "image/png").unwrap();
        assert_eq!(out, data);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn oversized_image_is_downscaled() {
        let img = image::RgbImage::from_pixel(2000, 1000, image::Rgb([200, 100, 50]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();

        let (out, mime) = shrink_image(&buf.into_inner(), "image/png").unwrap();
        assert_eq!(mime, "image/jpeg");
        let reloaded = image::load_from_memory(&out).unwrap();
        assert!(reloaded.width() <= MAX_IMAGE_DIMENSION);
        assert!(reloaded.height() <= MAX_IMAGE_DIMENSION);
    }

    #[test]
    fn embed_rejects_binary() {
        assert!(embed_file(&[0xff, 0xfe, 0x00, 0x80], "blob.bin").is_err());
        let embedded = embed_file(b"hello world", "notes.txt").unwrap();
        assert!(embedded.contains("notes.txt"));
        assert!(embedded.contains("hello world"));
    }

    #[test]
    fn placeholders() {
        assert_eq!(placeholder_summary("image", "photo.jpg"), "[image: photo.jpg]");
        assert_eq!(placeholder_summary("image", ""), "[image]");
    }
}
