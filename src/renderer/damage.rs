//! Output damage tracking
//!
//! The compositor reports which parts of an output changed since the last
//! repaint. The bridge only blits the bounding extents of that damage, so the
//! set is kept simple: a short list of rectangles that collapses into a single
//! extents rectangle once it grows past [`MAX_DAMAGE_REGIONS`].
//!
//! # Example
//!
//! ```
//! use qxl_bridge::renderer::damage::{Damage, DamageRegion};
//!
//! let mut damage = Damage::new();
//! damage.add(DamageRegion::new(10, 10, 50, 50));
//! damage.add(DamageRegion::new(100, 20, 10, 10));
//!
//! assert_eq!(damage.extents(), Some(DamageRegion::new(10, 10, 100, 50)));
//! ```

/// Maximum number of damage regions before coalescing to the extents
const MAX_DAMAGE_REGIONS: usize = 16;

/// Represents a rectangular region that needs repainting
///
/// Damage regions are axis-aligned rectangles specified in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DamageRegion {
    /// X coordinate (pixels)
    pub x: i32,
    /// Y coordinate (pixels)
    pub y: i32,
    /// Width (pixels)
    pub width: u32,
    /// Height (pixels)
    pub height: u32,
}

impl DamageRegion {
    /// Creates a new damage region
    ///
    /// ```
    /// use qxl_bridge::renderer::damage::DamageRegion;
    ///
    /// let region = DamageRegion::new(100, 100, 200, 150);
    /// assert_eq!(region.area(), 30000);
    /// ```
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Creates a damage region from two corners
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let x = x1.min(x2);
        let y = y1.min(y2);
        let width = x1.max(x2).abs_diff(x);
        let height = y1.max(y2).abs_diff(y);

        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge, clamped at `i32::MAX`
    pub fn right(&self) -> i32 {
        self.x.saturating_add(i32::try_from(self.width).unwrap_or(i32::MAX))
    }

    /// Bottom edge, clamped at `i32::MAX`
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(i32::try_from(self.height).unwrap_or(i32::MAX))
    }

    /// Returns the area of this region in pixels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Checks if this region intersects another region
    ///
    /// Two regions intersect if they share any pixels.
    pub fn intersects(&self, other: &DamageRegion) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// Computes the union of two regions (smallest bounding box containing both)
    pub fn union(&self, other: &DamageRegion) -> DamageRegion {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        DamageRegion::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Computes the intersection of two regions
    ///
    /// Returns `None` if the regions don't intersect.
    pub fn intersection(&self, other: &DamageRegion) -> Option<DamageRegion> {
        if !self.intersects(other) {
            return None;
        }

        Some(DamageRegion::from_corners(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        ))
    }

    /// Checks if this region completely contains another region
    pub fn contains_region(&self, other: &DamageRegion) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Damage accumulated on one output since its last repaint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Damage {
    regions: Vec<DamageRegion>,
}

impl Damage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Damage covering a whole output
    pub fn full(width: u32, height: u32) -> Self {
        let mut damage = Self::new();
        damage.add(DamageRegion::new(0, 0, width, height));
        damage
    }

    /// Adds a region; empty regions are ignored
    ///
    /// If too many regions accumulate they are replaced by their extents.
    pub fn add(&mut self, region: DamageRegion) {
        if region.is_empty() {
            return;
        }
        self.regions.push(region);

        if self.regions.len() > MAX_DAMAGE_REGIONS {
            if let Some(extents) = self.extents() {
                self.regions.clear();
                self.regions.push(extents);
            }
        }
    }

    pub fn regions(&self) -> &[DamageRegion] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Smallest rectangle covering every damaged region
    pub fn extents(&self) -> Option<DamageRegion> {
        self.regions.iter().copied().reduce(|acc, r| acc.union(&r))
    }

    /// Restrict the damage to `bounds`, dropping regions outside it
    pub fn clipped(&self, bounds: &DamageRegion) -> Damage {
        Damage {
            regions: self
                .regions
                .iter()
                .filter_map(|r| r.intersection(bounds))
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
