//! QR code rendering for instance pairing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zaprelay_core::error::RelayError;

/// Render pairing data as PNG bytes.
pub fn generate_qr_image(qr_data: &str) -> Result<Vec<u8>, RelayError> {
    use image::{ImageBuffer, Luma};
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(qr_data.as_bytes(), EcLevel::L)
        .map_err(|e| RelayError::Channel(format!("QR generation failed: {e}")))?;

    let module_size: u32 = 8;
    let quiet_zone: u32 = 2;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let (cx, cy) = (x / module_size, y / module_size);
        if cx < quiet_zone || cy < quiet_zone {
            return Luma([255u8]);
        }
        let (mx, my) = (cx - quiet_zone, cy - quiet_zone);
        if mx >= modules || my >= modules {
            return Luma([255u8]);
        }
        match code[(mx as usize, my as usize)] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| RelayError::Channel(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}

/// Render pairing data as a `data:image/png;base64,...` URL for dashboards.
///
/// Gateways that already hand us a data URL get it passed through.
pub fn qr_data_url(qr: &str) -> Result<String, RelayError> {
    if qr.starts_with("data:image/") {
        return Ok(qr.to_string());
    }
    let png = generate_qr_image(qr)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_signature() {
        let png = generate_qr_image("2@abc,def,ghi").unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_data_url() {
        let url = qr_data_url("2@abc").unwrap();
        assert!(url.starts_with("data:image/png;base64,iVBOR"));

        let passthrough = "data:image/png;base64,AAAA";
        assert_eq!(qr_data_url(passthrough).unwrap(), passthrough);
    }
}
