//! Image encoding: `DynamicImage` ⇄ PNG bytes, and PNG → base64 `ImageData`.
//!
//! Every artifact the pipeline stores is PNG. It is lossless, so a page that
//! goes through ten stages untouched is still the page pdfium rendered, and
//! text crispness survives for the VLM.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Decode PNG bytes.
pub fn decode_png(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
}

/// Wrap PNG bytes as a base64 image attachment for the VLM API.
///
/// `detail: "high"` asks GPT-4-class models for the full tile budget;
/// distortion and orientation judgments depend on fine structure.
pub fn to_image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
