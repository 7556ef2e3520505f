//! Predicts where the code will be in the next frame.
//!
//! The center is tracked per axis with a fixed-gain alpha-beta filter (a
//! steady-state constant-velocity Kalman filter). The search region is the last
//! known size padded by `margin`, widened toward the full frame as consecutive
//! misses pile up, and equal to the full frame after `max_misses` misses.

use crate::common::Region;
use crate::config::PredictorSettings;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct AxisFilter {
    position: f32,
    velocity: f32,
}

impl AxisFilter {
    fn new(position: f32) -> Self {
        Self {
            position,
            velocity: 0.0,
        }
    }

    fn predict(&self, steps: f32) -> f32 {
        self.position + self.velocity * steps
    }

    /// `steps` is the number of frames since the last correction.
    fn correct(&mut self, measurement: f32, steps: f32, alpha: f32, beta: f32) {
        let predicted = self.predict(steps);
        let residual = measurement - predicted;
        self.position = predicted + alpha * residual;
        self.velocity += beta * residual / steps;
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    x: AxisFilter,
    y: AxisFilter,
    width: f32,
    height: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictorStats {
    pub predictions: u64,
    pub detections: u64,
    pub misses: u64,
    /// Detections that fell inside the region predicted for their own frame.
    pub in_region: u64,
}

impl PredictorStats {
    pub fn accuracy(&self) -> f32 {
        if self.detections == 0 {
            0.0
        } else {
            self.in_region as f32 / self.detections as f32
        }
    }
}

pub struct RegionPredictor {
    settings: PredictorSettings,
    track: Option<Track>,
    misses: u32,
    margin_scale: f32,
    /// Regions handed out for frames that haven't completed yet.
    issued: BTreeMap<u64, Region>,
    stats: PredictorStats,
}

impl RegionPredictor {
    pub fn new(settings: PredictorSettings) -> Self {
        Self {
            settings,
            track: None,
            misses: 0,
            margin_scale: 1.0,
            issued: BTreeMap::new(),
            stats: PredictorStats::default(),
        }
    }

    /// Scales the margin by `1 + headroom`, with headroom clamped to [0, 1].
    /// Spare decode time buys a wider search.
    pub fn set_headroom(&mut self, headroom: f32) {
        self.margin_scale = 1.0 + headroom.clamp(0.0, 1.0);
    }

    pub fn is_tracking(&self) -> bool {
        self.track.is_some()
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn stats(&self) -> &PredictorStats {
        &self.stats
    }

    pub fn reset(&mut self) {
        self.track = None;
        self.misses = 0;
        self.issued.clear();
    }

    /// Forgets the region issued for `seq` and anything older, returning it.
    fn settle(&mut self, seq: u64) -> Option<Region> {
        let issued = self.issued.remove(&seq);
        self.issued = self.issued.split_off(&seq);
        issued
    }

    /// Feeds the detection made in frame `seq`, in frame coordinates.
    pub fn observe(&mut self, seq: u64, found: &Region) {
        self.stats.detections += 1;
        if self.settle(seq).is_some_and(|p| p.contains(found)) {
            self.stats.in_region += 1;
        }

        let (cx, cy) = found.center();
        let (w, h) = (found.width as f32, found.height as f32);
        let PredictorSettings { alpha, beta, .. } = self.settings;
        let steps = (self.misses + 1) as f32;

        self.track = Some(match self.track {
            None => Track {
                x: AxisFilter::new(cx),
                y: AxisFilter::new(cy),
                width: w,
                height: h,
            },
            Some(mut track) => {
                track.x.correct(cx, steps, alpha, beta);
                track.y.correct(cy, steps, alpha, beta);
                track.width += alpha * (w - track.width);
                track.height += alpha * (h - track.height);
                track
            }
        });
        self.misses = 0;
    }

    /// Records that nothing was found in frame `seq`.
    pub fn miss(&mut self, seq: u64) {
        self.settle(seq);
        self.stats.misses += 1;
        if self.track.is_some() {
            self.misses = (self.misses + 1).min(self.settings.max_misses);
        }
    }

    /// Region to search in frame `seq` of the given size.
    pub fn predict(&mut self, seq: u64, frame_width: u32, frame_height: u32) -> Region {
        self.stats.predictions += 1;
        let region = self.compute(frame_width, frame_height);
        self.issued.insert(seq, region);
        region
    }

    fn compute(&self, frame_width: u32, frame_height: u32) -> Region {
        let full = Region::full(frame_width, frame_height).with_age(self.misses);
        let Some(track) = self.track else {
            return full;
        };
        let max_misses = self.settings.max_misses.max(1);
        if self.misses >= max_misses || frame_width == 0 || frame_height == 0 {
            return full;
        }

        let steps = (self.misses + 1) as f32;
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let margin = self.settings.margin * self.margin_scale;
        let widen = self.misses as f32 / max_misses as f32;

        let base_w = track.width * (1.0 + 2.0 * margin);
        let base_h = track.height * (1.0 + 2.0 * margin);
        let w = (base_w + (fw - base_w).max(0.0) * widen).clamp(1.0, fw);
        let h = (base_h + (fh - base_h).max(0.0) * widen).clamp(1.0, fh);

        // Shift, don't shrink, to stay inside the frame.
        let x = (track.x.predict(steps) - w / 2.0).clamp(0.0, fw - w);
        let y = (track.y.predict(steps) - h / 2.0).clamp(0.0, fh - h);

        let width = (w.round() as u32).min(frame_width);
        let height = (h.round() as u32).min(frame_height);
        Region::new(
            (x.round() as u32).min(frame_width - width),
            (y.round() as u32).min(frame_height - height),
            width,
            height,
        )
        .with_age(self.misses)
    }
}
