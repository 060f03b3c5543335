//! Pairing code rendering.

use std::io::Cursor;

use {
    base64::Engine,
    image::{DynamicImage, ImageFormat, Luma},
    qrcode::QrCode,
};

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("cannot encode QR code: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("cannot render QR image: {0}")]
    Image(#[from] image::ImageError),
}

/// Render `code` as a PNG and return it as a `data:image/png;base64,` URL.
pub fn png_data_url(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    let img = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(256, 256)
        .build();

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(buf.into_inner());
    Ok(format!("data:image/png;base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_png_data_url() {
        let url = png_data_url("2@abc,def").unwrap();
        let payload = url.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

        let img = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert!(img.width() >= 256);
    }
}
