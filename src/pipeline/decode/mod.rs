//! Code detection and decoding for one frame region.

pub mod base;
pub mod enhanced;
pub mod model;

pub use base::RqrrDecoder;
pub use enhanced::EnhancedDecoder;
pub use model::EnhancementModel;

use crate::common::{Frame, FrameOrigin, Region, Ticket};
use crate::config::DecodeSettings;
use crate::error::ModelError;
use chrono::{DateTime, Utc};
use image::GrayImage;
use imageproc::gradients::sobel_gradients;
use imageproc::stats::percentile;
use rqrr::PreparedImage;
use std::time::{Duration, Instant};

/// A payload found in a grayscale image, with its bounds in that image.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCode {
    pub payload: String,
    pub bounds: Region,
    pub pass: &'static str,
}

/// One decoding strategy. Implementations hold no per-call state, so a single
/// instance is shared by every worker.
pub trait CodeDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, luma: &GrayImage) -> Option<DecodedCode>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderVariant {
    Base,
    Enhanced(&'static str),
}

impl DecoderVariant {
    pub fn label(&self) -> &'static str {
        match self {
            DecoderVariant::Base => "base",
            DecoderVariant::Enhanced(pass) => pass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub seq: u64,
    pub origin: FrameOrigin,
    pub captured_at: DateTime<Utc>,
    pub ticket: Ticket,
    /// Frame coordinates.
    pub region: Region,
    pub latency: Duration,
    pub variant: DecoderVariant,
}

/// Accepts only payloads that carry the expected marker.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    marker: Option<String>,
}

impl PayloadFilter {
    pub fn new(marker: Option<String>) -> Self {
        Self {
            marker: marker.filter(|m| !m.is_empty()),
        }
    }

    pub fn accepts(&self, payload: &str) -> bool {
        match &self.marker {
            Some(marker) => payload.contains(marker.as_str()),
            None => !payload.is_empty(),
        }
    }
}

/// Picks the first decoded grid whose payload passes the filter.
/// Each candidate is (payload if the grid decoded, corner points).
pub(crate) fn first_accepted(
    candidates: impl IntoIterator<Item = (Option<String>, [(i64, i64); 4])>,
    filter: &PayloadFilter,
    pass: &'static str,
) -> Option<DecodedCode> {
    candidates.into_iter().find_map(|(payload, corners)| {
        let payload = payload?;
        if !filter.accepts(&payload) {
            tracing::debug!("Ignoring foreign code payload ({} bytes)", payload.len());
            return None;
        }
        Some(DecodedCode {
            payload,
            bounds: Region::bounding(&corners)?,
            pass,
        })
    })
}

pub(crate) fn scan_luma(
    luma: &GrayImage,
    filter: &PayloadFilter,
    pass: &'static str,
) -> Option<DecodedCode> {
    let (w, h) = luma.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let raw = luma.as_raw();
    let stride = w as usize;
    let mut prepared =
        PreparedImage::prepare_from_greyscale(w as usize, h as usize, |x, y| raw[y * stride + x]);
    let grids = prepared.detect_grids();
    first_accepted(
        grids.iter().map(|g| {
            (
                g.decode().ok().map(|(_, payload)| payload),
                g.bounds.map(|p| (p.x as i64, p.y as i64)),
            )
        }),
        filter,
        pass,
    )
}

/// Like [`scan_luma`] but binarizes at `threshold` first.
pub(crate) fn scan_bitmap(
    luma: &GrayImage,
    threshold: u8,
    filter: &PayloadFilter,
    pass: &'static str,
) -> Option<DecodedCode> {
    let (w, h) = luma.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let raw = luma.as_raw();
    let stride = w as usize;
    let mut prepared = PreparedImage::prepare_from_bitmap(w as usize, h as usize, |x, y| {
        raw[y * stride + x] < threshold
    });
    let grids = prepared.detect_grids();
    first_accepted(
        grids.iter().map(|g| {
            (
                g.decode().ok().map(|(_, payload)| payload),
                g.bounds.map(|p| (p.x as i64, p.y as i64)),
            )
        }),
        filter,
        pass,
    )
}

/// When the base decoder misses, the enhanced decoder only runs on crops
/// that look small, flat or blurry.
#[derive(Debug, Clone, Copy)]
pub struct ClarityThresholds {
    pub max_side: u32,
    pub min_contrast: u8,
    pub min_sharpness: f32,
}

impl From<&DecodeSettings> for ClarityThresholds {
    fn from(settings: &DecodeSettings) -> Self {
        Self {
            max_side: settings.enhance_max_side,
            min_contrast: settings.enhance_min_contrast,
            min_sharpness: settings.enhance_min_sharpness,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clarity {
    pub short_side: u32,
    /// Spread between the 5th and 95th luma percentiles.
    pub contrast: u8,
    /// Mean Sobel gradient magnitude.
    pub sharpness: f32,
}

impl Clarity {
    pub fn measure(luma: &GrayImage) -> Self {
        let (w, h) = luma.dimensions();
        if w == 0 || h == 0 {
            return Self {
                short_side: 0,
                contrast: 0,
                sharpness: 0.0,
            };
        }
        let contrast = percentile(luma, 95).saturating_sub(percentile(luma, 5));
        let gradients = sobel_gradients(luma);
        let energy: u64 = gradients.pixels().map(|p| p.0[0] as u64).sum();
        let sharpness = energy as f32 / (w as u64 * h as u64) as f32;

        Self {
            short_side: w.min(h),
            contrast,
            sharpness,
        }
    }

    pub fn is_degraded(&self, thresholds: &ClarityThresholds) -> bool {
        self.short_side < thresholds.max_side
            || self.contrast < thresholds.min_contrast
            || self.sharpness < thresholds.min_sharpness
    }
}

/// Base decoder first; the enhanced decoder for degraded crops.
pub struct DecodeEngine {
    base: Box<dyn CodeDecoder>,
    enhanced: Option<Box<dyn CodeDecoder>>,
    clarity: ClarityThresholds,
}

impl DecodeEngine {
    pub fn new(
        base: Box<dyn CodeDecoder>,
        enhanced: Option<Box<dyn CodeDecoder>>,
        clarity: ClarityThresholds,
    ) -> Self {
        Self {
            base,
            enhanced,
            clarity,
        }
    }

    /// Builds the engine, loading the enhancement model. If the model cannot be
    /// loaded the engine runs base-only and the error is handed back to report.
    pub fn from_settings(settings: &DecodeSettings) -> (Self, Option<ModelError>) {
        let filter = PayloadFilter::new(settings.payload_marker.clone());
        let base = Box::new(RqrrDecoder::new(filter.clone()));
        let (enhanced, error) = match EnhancementModel::load(&settings.model_dir) {
            Ok(model) => (
                Some(Box::new(EnhancedDecoder::new(
                    model,
                    settings.adaptive_block_radius,
                    filter,
                )) as Box<dyn CodeDecoder>),
                None,
            ),
            Err(e) => {
                tracing::warn!("Enhanced decoder disabled, running base decoder only: {}", e);
                (None, Some(e))
            }
        };
        (Self::new(base, enhanced, ClarityThresholds::from(settings)), error)
    }

    pub fn has_enhanced(&self) -> bool {
        self.enhanced.is_some()
    }

    /// Runs every decoder once on a blank image so first-frame latency isn't
    /// spent on lazy setup.
    pub fn warm_up(&self) {
        let start = Instant::now();
        let blank = GrayImage::from_pixel(64, 64, image::Luma([255]));
        let _ = self.base.decode(&blank);
        if let Some(enhanced) = &self.enhanced {
            let _ = enhanced.decode(&blank);
        }
        tracing::debug!("Decoder warm-up took {:?}", start.elapsed());
    }

    /// Looks for a code inside `region` of `frame`. `None` when nothing decodes.
    pub fn decode(&self, frame: &Frame, region: Region) -> Option<Detection> {
        let start = Instant::now();
        let region = region.clamp_to(frame.width(), frame.height())?;
        let luma = frame.luma_region(&region)?;
        let (code, variant) = self.decode_luma(&luma)?;
        let latency = start.elapsed();
        tracing::debug!(
            "Decoded code in frame {} via {} after {:?}",
            frame.seq(),
            variant.label(),
            latency
        );
        Some(Detection {
            seq: frame.seq(),
            origin: frame.origin(),
            captured_at: frame.captured_at(),
            ticket: Ticket::from(code.payload),
            region: code.bounds.offset(region.x, region.y).with_age(0),
            latency,
            variant,
        })
    }

    fn decode_luma(&self, luma: &GrayImage) -> Option<(DecodedCode, DecoderVariant)> {
        if let Some(code) = self.base.decode(luma) {
            return Some((code, DecoderVariant::Base));
        }
        let enhanced = self.enhanced.as_ref()?;
        let clarity = Clarity::measure(luma);
        if !clarity.is_degraded(&self.clarity) {
            return None;
        }
        tracing::trace!("Escalating degraded crop {:?}", clarity);
        let code = enhanced.decode(luma)?;
        let variant = DecoderVariant::Enhanced(code.pass);
        Some((code, variant))
    }
}
