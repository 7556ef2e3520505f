use super::model::EnhancementModel;
use super::{scan_bitmap, scan_luma, CodeDecoder, DecodedCode, PayloadFilter};
use image::GrayImage;
use imageproc::contrast::{self, adaptive_threshold, otsu_level};
use imageproc::stats::percentile;

/// Preprocessing cascade for small, washed out or blurry crops. Passes run in
/// order and the first decode wins.
pub struct EnhancedDecoder {
    model: EnhancementModel,
    block_radius: u32,
    filter: PayloadFilter,
}

impl EnhancedDecoder {
    pub fn new(model: EnhancementModel, block_radius: u32, filter: PayloadFilter) -> Self {
        Self {
            model,
            block_radius: block_radius.max(1),
            filter,
        }
    }

    fn upscaled(&self, mut code: DecodedCode) -> DecodedCode {
        code.bounds = code.bounds.scale(1.0 / self.model.upscale as f32);
        code
    }
}

/// Maps the 2nd..98th percentile range onto the full 0..255 range.
pub fn stretch_contrast(luma: &GrayImage) -> GrayImage {
    if luma.width() == 0 || luma.height() == 0 {
        return luma.clone();
    }
    let lo = percentile(luma, 2);
    let hi = percentile(luma, 98);
    if hi <= lo {
        return luma.clone();
    }
    contrast::stretch_contrast(luma, lo, hi, 0, 255)
}

impl CodeDecoder for EnhancedDecoder {
    fn name(&self) -> &'static str {
        "enhanced"
    }

    fn decode(&self, luma: &GrayImage) -> Option<DecodedCode> {
        if luma.width() == 0 || luma.height() == 0 {
            return None;
        }

        let stretched = stretch_contrast(luma);
        if let Some(code) = scan_luma(&stretched, &self.filter, "contrast_stretch") {
            return Some(code);
        }

        let binary = adaptive_threshold(&stretched, self.block_radius);
        if let Some(code) = scan_luma(&binary, &self.filter, "adaptive_threshold") {
            return Some(code);
        }

        let upscaled = self.model.apply(&stretched);
        if let Some(code) = scan_luma(&upscaled, &self.filter, "model_upscale") {
            return Some(self.upscaled(code));
        }

        let level = otsu_level(&upscaled);
        scan_bitmap(&upscaled, level, &self.filter, "model_otsu").map(|code| self.upscaled(code))
    }
}
