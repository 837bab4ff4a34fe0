//! Page image encoding for the recognizers.
//!
//! Both engines take the preprocessed page as PNG: tesseract reads it from
//! stdin, the vision engine sends it base64-encoded inside the request body.
//! PNG is lossless; JPEG ringing around binarized glyph edges costs accuracy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a page as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// Encode a page as a base64 PNG attachment for a multimodal chat request.
///
/// `detail: "high"` asks the provider for full-resolution tiling; at low
/// detail body text is downsampled below legibility.
pub fn encode_image_data(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let png = encode_png(img)?;
    Ok(ImageData::new(STANDARD.encode(&png), "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn page() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(12, 8, Luma([255])))
    }

    #[test]
    fn png_has_signature() {
        let bytes = encode_png(&page()).unwrap();
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn image_data_is_base64_png() {
        let data = encode_image_data(&page()).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(decoded.starts_with(b"\x89PNG"));
    }
}
