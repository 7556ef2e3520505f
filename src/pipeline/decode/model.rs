use crate::error::ModelError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::filter::filter3x3;
use imageproc::map::map_subpixels;
use serde::Deserialize;
use std::path::Path;

pub const MODEL_FILE: &str = "enhance.json";

/// Learned upscale-and-sharpen filter used by the enhanced decoder.
///
/// The artifact is `enhance.json`:
/// `{ "upscale": 2, "kernel": [9 weights, row major], "bias": 0.0 }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnhancementModel {
    pub upscale: u32,
    pub kernel: [f32; 9],
    #[serde(default)]
    pub bias: f32,
}

impl EnhancementModel {
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let path = dir.join(MODEL_FILE);
        if !path.is_file() {
            return Err(ModelError::Missing(path));
        }
        let raw = std::fs::read_to_string(&path)?;
        let model: Self = serde_json::from_str(&raw)?;
        model.validate()?;
        tracing::info!(
            "Loaded enhancement model from {} (x{} upscale)",
            path.display(),
            model.upscale
        );
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if !(1..=4).contains(&self.upscale) {
            return Err(ModelError::Invalid(format!(
                "upscale must be between 1 and 4, got {}",
                self.upscale
            )));
        }
        if self.kernel.iter().any(|w| !w.is_finite()) || !self.bias.is_finite() {
            return Err(ModelError::Invalid("non-finite weight".to_string()));
        }
        if self.kernel.iter().sum::<f32>().abs() < f32::EPSILON {
            return Err(ModelError::Invalid("kernel weights sum to zero".to_string()));
        }
        Ok(())
    }

    /// Upscales `luma` and runs the 3x3 kernel over it, replicating edges.
    pub fn apply(&self, luma: &GrayImage) -> GrayImage {
        let (w, h) = luma.dimensions();
        let upscaled = if self.upscale > 1 {
            imageops::resize(
                luma,
                w * self.upscale,
                h * self.upscale,
                FilterType::CatmullRom,
            )
        } else {
            luma.clone()
        };
        if upscaled.width() == 0 || upscaled.height() == 0 {
            return upscaled;
        }

        let filtered = filter3x3::<_, f32, f32>(&upscaled, &self.kernel);
        let bias = self.bias;
        map_subpixels(&filtered, |v: f32| (v + bias).round().clamp(0.0, 255.0) as u8)
    }
}
