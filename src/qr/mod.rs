//! QR image rendering.
//!
//! Pure payload-to-pixels helpers; nothing here touches the database or
//! the clock. The scan URL goes in, PNG bytes (or an inline data URL for
//! API responses) come out.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::Luma;
use qrcode::QrCode;
use std::io::Cursor;

/// Render a payload string as a PNG image, at least 300x300 pixels.
pub fn render_png(payload: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(payload.as_bytes()).context("Failed to encode QR payload")?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(300, 300)
        .build();

    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("Failed to encode QR image as PNG")?;
    Ok(bytes)
}

/// Wrap already-rendered PNG bytes in a `data:image/png;base64,...` URL
/// suitable for direct embedding in an `<img>` tag.
pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(png))
}

/// Render a payload string straight to a data URL.
pub fn render_data_url(payload: &str) -> Result<String> {
    let png = render_png(payload)?;
    Ok(png_data_url(&png))
}
