use super::region::Region;
use crate::error::CaptureError;
use crate::intake::buffer_pool::PooledBuffer;
use chrono::{DateTime, Utc};
use image::GrayImage;

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Screen,
    Stream,
}

impl std::fmt::Display for FrameOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameOrigin::Screen => f.write_str("screen"),
            FrameOrigin::Stream => f.write_str("stream"),
        }
    }
}

/// An RGBA8 picture backed by pool storage. Moved into exactly one worker;
/// the storage goes back to the pool when the frame is dropped.
#[derive(Debug)]
pub struct Frame {
    seq: u64,
    origin: FrameOrigin,
    width: u32,
    height: u32,
    captured_at: DateTime<Utc>,
    pixels: PooledBuffer,
}

impl Frame {
    pub fn new(
        origin: FrameOrigin,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
        pixels: PooledBuffer,
    ) -> Result<Self, CaptureError> {
        let needed = Self::byte_len(width, height);
        if pixels.len() < needed {
            return Err(CaptureError::UnsupportedPicture(format!(
                "{}x{} frame needs {} bytes, buffer holds {}",
                width,
                height,
                needed,
                pixels.len()
            )));
        }
        Ok(Self {
            seq: 0,
            origin,
            width,
            height,
            captured_at,
            pixels,
        })
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Stamps the capture order. Done by the scheduler before dispatch.
    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn origin(&self) -> FrameOrigin {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn bounds(&self) -> Region {
        Region::full(self.width, self.height)
    }

    pub fn rgba(&self) -> &[u8] {
        &self.pixels.as_slice()[..Self::byte_len(self.width, self.height)]
    }

    /// Paints a region white so it can never produce a detection.
    pub fn mask_out(&mut self, region: &Region) {
        let Some(region) = region.clamp_to(self.width, self.height) else {
            return;
        };
        let stride = self.width as usize * BYTES_PER_PIXEL;
        let pixels = self.pixels.as_mut_slice();
        for row in region.y..region.bottom() {
            let start = row as usize * stride + region.x as usize * BYTES_PER_PIXEL;
            let end = start + region.width as usize * BYTES_PER_PIXEL;
            pixels[start..end].fill(0xFF);
        }
    }

    /// BT.601 luma of the part of `region` that lies inside the frame.
    pub fn luma_region(&self, region: &Region) -> Option<GrayImage> {
        let region = region.clamp_to(self.width, self.height)?;
        let stride = self.width as usize * BYTES_PER_PIXEL;
        let rgba = self.rgba();
        let mut luma = Vec::with_capacity(region.area() as usize);
        for row in region.y..region.bottom() {
            let start = row as usize * stride + region.x as usize * BYTES_PER_PIXEL;
            let end = start + region.width as usize * BYTES_PER_PIXEL;
            luma.extend(rgba[start..end].chunks_exact(BYTES_PER_PIXEL).map(|px| {
                let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((77 * r + 150 * g + 29 * b) >> 8) as u8
            }));
        }
        GrayImage::from_raw(region.width, region.height, luma)
    }
}
