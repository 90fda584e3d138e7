//! Frame rendering for QXL outputs
//!
//! The bridge does not composite anything itself: a [`Renderer`] produces a
//! complete xRGB frame for an output and the output loop blits the damaged
//! part of it. Frames are reference counted so a blit can point straight at
//! the renderer's pixels; the renderer writes its next frame copy-on-write
//! if the server still holds the previous one.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::output::OutputId;

pub mod damage;

use damage::{Damage, DamageRegion};

/// Bytes per xRGB pixel
pub const BYTES_PER_PIXEL: u32 = 4;

/// Produces the pixels of one output frame
pub trait Renderer {
    /// Render the current frame of `output`. Only `damage` is required to be
    /// up to date; pixels outside it may be stale.
    fn repaint(&mut self, output: OutputId, damage: &Damage) -> BridgeResult<FrameBuffer>;
}

/// A top-down xRGB pixel buffer shared with in-flight blits
#[derive(Clone)]
pub struct FrameBuffer {
    data: Arc<Vec<u8>>,
    width: u32,
    height: u32,
    stride: u32,
}

impl FrameBuffer {
    /// Zero-filled frame of `width x height`
    pub fn new(width: u32, height: u32) -> BridgeResult<Self> {
        let stride = width
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or_else(|| BridgeError::InvalidGeometry(format!("frame width {width} overflows stride")))?;
        let len = stride as usize * height as usize;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| BridgeError::allocation(format!("{width}x{height} frame: {e}")))?;
        data.resize(len, 0);

        Ok(Self {
            data: Arc::new(data),
            width,
            height,
            stride,
        })
    }

    /// Wrap existing pixels; `data` must hold `height` rows of `stride` bytes
    pub fn from_pixels(width: u32, height: u32, stride: u32, data: Vec<u8>) -> BridgeResult<Self> {
        if stride < width.saturating_mul(BYTES_PER_PIXEL) {
            return Err(BridgeError::InvalidGeometry(format!(
                "stride {stride} too small for width {width}"
            )));
        }
        if data.len() < stride as usize * height as usize {
            return Err(BridgeError::InvalidGeometry(format!(
                "{} bytes cannot hold {height} rows of {stride}",
                data.len()
            )));
        }
        Ok(Self {
            data: Arc::new(data),
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn bounds(&self) -> DamageRegion {
        DamageRegion::new(0, 0, self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixels, copying first if a blit still references them
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        if Arc::strong_count(&self.data) > 1 {
            debug!("frame {}x{} still in flight, copying", self.width, self.height);
        }
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether any blit still holds these pixels
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y * self.stride + x * BYTES_PER_PIXEL) as usize;
        self.pixels_mut()[offset..offset + 4].copy_from_slice(&color.to_le_bytes());
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y * self.stride + x * BYTES_PER_PIXEL) as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        Some(u32::from_le_bytes(bytes))
    }

    /// Zero-copy view of `region`, which must lie inside the frame
    pub fn view(&self, region: &DamageRegion) -> BridgeResult<PixelView> {
        if region.is_empty() || !self.bounds().contains_region(region) {
            return Err(BridgeError::InvalidGeometry(format!(
                "{region:?} outside {}x{} frame",
                self.width, self.height
            )));
        }
        let offset = region.y as usize * self.stride as usize
            + region.x as usize * BYTES_PER_PIXEL as usize;
        Ok(PixelView {
            data: Arc::clone(&self.data),
            offset,
            width: region.width,
            height: region.height,
            stride: self.stride,
        })
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Read-only window into a frame that keeps the frame alive
#[derive(Clone)]
pub struct PixelView {
    data: Arc<Vec<u8>>,
    offset: usize,
    width: u32,
    height: u32,
    stride: u32,
}

impl PixelView {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Address of the first pixel, as written into the bitmap record
    pub fn address(&self) -> u64 {
        self.bytes().as_ptr() as u64
    }

    /// Everything from the first pixel of the view to the end of the frame
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * BYTES_PER_PIXEL as usize;
        self.bytes().get(start..start + len)
    }

    /// Whether `height` rows of `width` pixels at `stride` fit in the view
    pub fn covers(&self, width: u32, height: u32, stride: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        let row = width as u64 * BYTES_PER_PIXEL as u64;
        if (stride as u64) < row {
            return false;
        }
        let needed = (height as u64 - 1) * stride as u64 + row;
        needed <= self.bytes().len() as u64
    }
}

impl fmt::Debug for PixelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelView")
            .field("offset", &self.offset)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Test pattern source: an animated gradient, redrawn only where damaged
#[derive(Debug)]
pub struct PatternRenderer {
    width: u32,
    height: u32,
    frames: HashMap<OutputId, FrameBuffer>,
    tick: u32,
}

impl PatternRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: HashMap::new(),
            tick: 0,
        }
    }

    pub fn frames_rendered(&self) -> u32 {
        self.tick
    }

    /// Colour of pixel `(x, y)` on frame number `tick`
    pub fn pattern(x: u32, y: u32, tick: u32) -> u32 {
        let r = (x.wrapping_add(tick) & 0xff) as u8;
        let g = (y & 0xff) as u8;
        let b = ((x ^ y).wrapping_add(tick.wrapping_mul(3)) & 0xff) as u8;
        crate::qxl::rgb(r, g, b)
    }
}

impl Renderer for PatternRenderer {
    fn repaint(&mut self, output: OutputId, damage: &Damage) -> BridgeResult<FrameBuffer> {
        let frame = match self.frames.entry(output) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(FrameBuffer::new(self.width, self.height)?),
        };

        let tick = self.tick;
        let damage = damage.clipped(&frame.bounds());
        for region in damage.regions() {
            for y in region.y as u32..region.bottom() as u32 {
                for x in region.x as u32..region.right() as u32 {
                    frame.put_pixel(x, y, Self::pattern(x, y, tick));
                }
            }
        }
        self.tick = self.tick.wrapping_add(1);

        Ok(frame.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_view_offsets() {
        let mut frame = FrameBuffer::new(8, 4).unwrap();
        frame.put_pixel(2, 1, 0xff11_2233);

        let view = frame.view(&DamageRegion::new(2, 1, 3, 2)).unwrap();
        assert_eq!(view.stride(), 32);
        assert_eq!(&view.row(0).unwrap()[..4], &0xff11_2233u32.to_le_bytes());
        assert_eq!(view.address(), frame.pixels().as_ptr() as u64 + 32 + 8);
        assert!(view.covers(3, 2, 32));
        assert!(!view.covers(3, 4, 32));
    }

    #[test]
    fn test_view_outside_frame_rejected() {
        let frame = FrameBuffer::new(8, 4).unwrap();
        assert!(matches!(
            frame.view(&DamageRegion::new(6, 0, 4, 1)),
            Err(BridgeError::InvalidGeometry(_))
        ));
        assert!(frame.view(&DamageRegion::new(0, 0, 0, 1)).is_err());
    }

    #[test]
    fn test_copy_on_write_keeps_view_stable() {
        let mut frame = FrameBuffer::new(4, 4).unwrap();
        frame.put_pixel(0, 0, 1);
        let view = frame.view(&frame.bounds()).unwrap();
        assert!(frame.is_shared());

        frame.put_pixel(0, 0, 2);
        assert_eq!(&view.row(0).unwrap()[..4], &1u32.to_le_bytes());
        assert_eq!(frame.pixel(0, 0), Some(2));
        assert!(!frame.is_shared());
    }

    #[test]
    fn test_from_pixels_validates_length() {
        assert!(FrameBuffer::from_pixels(2, 2, 8, vec![0; 16]).is_ok());
        assert!(FrameBuffer::from_pixels(2, 2, 8, vec![0; 15]).is_err());
        assert!(FrameBuffer::from_pixels(2, 2, 4, vec![0; 16]).is_err());
    }

    #[test]
    fn test_pattern_renderer_paints_damage_only() {
        let mut renderer = PatternRenderer::new(16, 16);
        let mut damage = Damage::new();
        damage.add(DamageRegion::new(4, 4, 2, 2));

        let frame = renderer.repaint(OutputId(0), &damage).unwrap();
        assert_eq!(frame.pixel(4, 4), Some(PatternRenderer::pattern(4, 4, 0)));
        assert_eq!(frame.pixel(0, 0), Some(0));
        assert_eq!(renderer.frames_rendered(), 1);
    }
}
