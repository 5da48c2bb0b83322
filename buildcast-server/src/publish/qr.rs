//! QR codes for download links, so a phone can pick up a build directly.

use std::io::Cursor;

use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};

/// Minimum edge length of a download QR code, in pixels.
pub const DOWNLOAD_QR_SIZE: u32 = 400;

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("Cannot encode QR code: {0}")]
    Encode(String),
    #[error("Cannot write PNG: {0}")]
    Image(#[from] image::ImageError),
}

/// Render `content` as a PNG QR code at least `size` pixels square.
///
/// Uses the highest error correction level; presigned URLs are long but the
/// code stays readable when printed small or partly obscured.
pub fn render_png(content: &str, size: u32) -> Result<Vec<u8>, QrError> {
    let code = QrCode::with_error_correction_level(content.as_bytes(), EcLevel::H)
        .map_err(|e| QrError::Encode(e.to_string()))?;
    let image = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(size, size)
        .build();
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}
