use super::{scan_luma, CodeDecoder, DecodedCode, PayloadFilter};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Crops wider or taller than this are also tried scaled down to fit.
const FIT_WIDTH: u32 = 1280;
const FIT_HEIGHT: u32 = 720;

/// Plain rqrr decoding: the crop as captured, then a downscaled copy for large crops.
pub struct RqrrDecoder {
    filter: PayloadFilter,
}

impl RqrrDecoder {
    pub fn new(filter: PayloadFilter) -> Self {
        Self { filter }
    }
}

/// Factor that fits `width` x `height` inside the downscale box, if it doesn't already.
fn fit_factor(width: u32, height: u32) -> Option<f32> {
    if width <= FIT_WIDTH && height <= FIT_HEIGHT {
        return None;
    }
    let factor = (FIT_WIDTH as f32 / width as f32).min(FIT_HEIGHT as f32 / height as f32);
    Some(factor)
}

impl CodeDecoder for RqrrDecoder {
    fn name(&self) -> &'static str {
        "base"
    }

    fn decode(&self, luma: &GrayImage) -> Option<DecodedCode> {
        if let Some(code) = scan_luma(luma, &self.filter, "raw") {
            return Some(code);
        }

        let (w, h) = luma.dimensions();
        let factor = fit_factor(w, h)?;
        let scaled = imageops::resize(
            luma,
            ((w as f32 * factor) as u32).max(1),
            ((h as f32 * factor) as u32).max(1),
            FilterType::Triangle,
        );
        let mut code = scan_luma(&scaled, &self.filter, "downscaled")?;
        code.bounds = code.bounds.scale(1.0 / factor);
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decode::test_support::render_qr;

    fn decoder() -> RqrrDecoder {
        RqrrDecoder::new(PayloadFilter::new(Some("KURO".to_string())))
    }

    #[test]
    fn decodes_clean_code() {
        let img = render_qr("G152#KURO#3f9a2c", 4, 4, 0, 255);
        let code = decoder().decode(&img).unwrap();
        assert_eq!(code.payload, "G152#KURO#3f9a2c");
        assert_eq!(code.pass, "raw");

        // bounds sit inside the quiet zone
        let side = img.width();
        assert!(code.bounds.x >= 8 && code.bounds.y >= 8);
        assert!(code.bounds.right() <= side - 8 && code.bounds.bottom() <= side - 8);
    }

    #[test]
    fn ignores_foreign_payloads() {
        let img = render_qr("https://example.com/not-a-ticket", 4, 4, 0, 255);
        assert!(decoder().decode(&img).is_none());
    }

    #[test]
    fn blank_and_degenerate_images_decode_nothing() {
        assert!(decoder().decode(&GrayImage::new(0, 0)).is_none());
        assert!(decoder().decode(&GrayImage::new(1, 1)).is_none());
        assert!(decoder()
            .decode(&GrayImage::from_pixel(300, 200, image::Luma([255])))
            .is_none());
    }

    #[test]
    fn fit_factor_only_for_large_crops() {
        assert_eq!(fit_factor(800, 800), Some(0.9));
        assert_eq!(fit_factor(1280, 720), None);
        assert_eq!(fit_factor(2560, 1440), Some(0.5));
        assert_eq!(fit_factor(640, 480), None);
    }
}
