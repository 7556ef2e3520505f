/// Rectangle in frame coordinates. `age` counts consecutive predictions made
/// without a fresh detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub age: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            age: 0,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    /// Smallest region containing every point, e.g. the corners of a detected code.
    pub fn bounding(points: &[(i64, i64)]) -> Option<Self> {
        let min_x = points.iter().map(|p| p.0).min()?;
        let max_x = points.iter().map(|p| p.0).max()?;
        let min_y = points.iter().map(|p| p.1).min()?;
        let max_y = points.iter().map(|p| p.1).max()?;
        let x = min_x.max(0) as u32;
        let y = min_y.max(0) as u32;
        Some(Self::new(
            x,
            y,
            (max_x.max(0) as u32).saturating_sub(x),
            (max_y.max(0) as u32).saturating_sub(y),
        ))
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Clips the region to a `width` x `height` frame; `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        let clipped = Region {
            x,
            y,
            width: right - x,
            height: bottom - y,
            age: self.age,
        };
        (!clipped.is_empty()).then_some(clipped)
    }

    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| Region::new(x, y, right - x, bottom - y))
    }

    pub fn offset(&self, dx: u32, dy: u32) -> Region {
        Region {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }

    pub fn scale(&self, factor: f32) -> Region {
        Region {
            x: (self.x as f32 * factor).round() as u32,
            y: (self.y as f32 * factor).round() as u32,
            width: (self.width as f32 * factor).round() as u32,
            height: (self.height as f32 * factor).round() as u32,
            age: self.age,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}x{}, age {})",
            self.x, self.y, self.width, self.height, self.age
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_clips_to_frame() {
        let region = Region::new(90, 90, 50, 50);
        assert_eq!(region.clamp_to(100, 120), Some(Region::new(90, 90, 10, 30)));
        assert_eq!(Region::new(200, 0, 10, 10).clamp_to(100, 100), None);
    }

    #[test]
    fn bounding_box_of_skewed_corners() {
        let region = Region::bounding(&[(10, 12), (60, 8), (62, 58), (9, 61)]).unwrap();
        assert_eq!(region, Region::new(9, 8, 53, 53));
        assert!(Region::bounding(&[]).is_none());
    }

    #[test]
    fn containment() {
        let outer = Region::new(75, 75, 100, 100);
        assert!(outer.contains(&Region::new(110, 95, 50, 50)));
        assert!(!outer.contains(&Region::new(150, 95, 50, 50)));
    }
}
