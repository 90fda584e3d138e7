//! Drawable construction
//!
//! Turns "blit these pixels here" and "fill this rectangle" into QXL
//! drawables, stamps them with release ids, image ids and a drawable time,
//! and queues them on the ring.

use std::sync::Arc;

use log::trace;

use super::command::{Command, ImageBlit, ImageId, Payload, ReleaseReason, SurfaceId};
use super::release::ReleaseRegistry;
use super::ring::CommandRing;
use super::surface::SurfaceManager;
use super::MmClock;
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{
    QxlBitmap, QxlBrush, QxlCopy, QxlDrawable, QxlFill, QxlImage, QxlImageDescriptor, QxlMask,
    QxlRect, QXL_BITMAP_DIRECT, QXL_BITMAP_TOP_DOWN, QXL_IMAGE_GROUP_DEVICE,
    SPICE_BITMAP_FMT_32BIT, SPICE_IMAGE_TYPE_BITMAP, SPICE_ROPD_OP_PUT,
};
use crate::renderer::damage::Damage;
use crate::renderer::PixelView;

/// How far drawable times lag the server's multimedia clock, in ms
pub const DEFAULT_MM_TIME_SKEW_MS: u32 = 350;

#[derive(Debug)]
pub struct CommandBuilder {
    next_image_id: u32,
    mm_time_skew: u32,
    clock: Arc<MmClock>,
    ring: Arc<CommandRing>,
    releases: Arc<ReleaseRegistry>,
}

impl CommandBuilder {
    pub fn new(
        ring: Arc<CommandRing>,
        releases: Arc<ReleaseRegistry>,
        clock: Arc<MmClock>,
        mm_time_skew: u32,
    ) -> Self {
        Self {
            next_image_id: 1,
            mm_time_skew,
            clock,
            ring,
            releases,
        }
    }

    /// Multimedia time to stamp on a drawable built now
    pub fn drawable_time(&self) -> u32 {
        self.clock.get().wrapping_sub(self.mm_time_skew)
    }

    fn next_image_id(&mut self) -> BridgeResult<ImageId> {
        let id = ImageId(self.next_image_id);
        self.next_image_id = self
            .next_image_id
            .checked_add(1)
            .ok_or_else(|| BridgeError::violation("image id space exhausted"))?;
        Ok(id)
    }

    /// Copy drawable placing `height` rows of `width` pixels from `pixels`
    /// at `(x, y)` on `surface_id`, unscaled
    #[allow(clippy::too_many_arguments)]
    pub fn build_image_blit(
        &mut self,
        surface_id: SurfaceId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        pixels: PixelView,
        stride: u32,
        damage: &Damage,
    ) -> BridgeResult<Command> {
        if !pixels.covers(width, height, stride) {
            return Err(BridgeError::InvalidGeometry(format!(
                "{width}x{height} at stride {stride} not covered by {pixels:?}"
            )));
        }

        let bbox = placement(x, y, width, height)?;

        let mut regions = Vec::new();
        regions
            .try_reserve_exact(damage.regions().len())
            .map_err(|e| BridgeError::allocation(format!("damage copy: {e}")))?;
        regions.extend_from_slice(damage.regions());

        let image_id = self.next_image_id()?;
        let ticket = self.releases.issue();

        let mut image = QxlImage {
            descriptor: QxlImageDescriptor {
                id: 0,
                image_type: SPICE_IMAGE_TYPE_BITMAP,
                flags: 0,
                width,
                height,
            },
            bitmap: QxlBitmap {
                format: SPICE_BITMAP_FMT_32BIT,
                flags: QXL_BITMAP_DIRECT | QXL_BITMAP_TOP_DOWN,
                x: width,
                y: height,
                stride,
                palette: 0,
                data: pixels.address(),
            },
        };
        image.set_image_id(QXL_IMAGE_GROUP_DEVICE, image_id.0);

        let drawable = QxlDrawable::new(surface_id.raw(), bbox, ticket.id().0, self.drawable_time());
        let mut blit = Box::new(ImageBlit {
            drawable,
            image,
            image_id,
            damage: regions,
            pixels,
        });

        // The image address is only stable once boxed
        let copy = QxlCopy {
            src_bitmap: &blit.image as *const QxlImage as u64,
            src_area: QxlRect::from_origin(0, 0, width, height),
            rop_descriptor: SPICE_ROPD_OP_PUT,
            scale_mode: 0,
            mask: QxlMask::default(),
        };
        blit.drawable.set_copy(&copy);

        trace!("built blit {:?} {}x{} at ({}, {}) on {}", image_id, width, height, x, y, surface_id);
        Ok(Command::new(surface_id, bbox, Payload::DrawCopy(blit), ticket))
    }

    /// Solid fill of a rectangle on `surface_id`
    pub fn build_fill(
        &mut self,
        surface_id: SurfaceId,
        color: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> BridgeResult<Command> {
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidGeometry(format!("empty fill {width}x{height}")));
        }
        let bbox = placement(x, y, width, height)?;
        let ticket = self.releases.issue();
        let mut drawable = QxlDrawable::new(surface_id.raw(), bbox, ticket.id().0, self.drawable_time());
        drawable.set_fill(&QxlFill {
            brush: QxlBrush::solid(color),
            rop_descriptor: SPICE_ROPD_OP_PUT,
            mask: QxlMask::default(),
        });
        Ok(Command::new(surface_id, bbox, Payload::DrawFill(Box::new(drawable)), ticket))
    }

    /// Queue `command`; a command the ring refuses is released as rejected
    pub fn submit(&self, command: Command) -> BridgeResult<()> {
        self.ring.enqueue(command).map_err(|full| {
            full.into_inner().release(ReleaseReason::Rejected);
            BridgeError::CapacityExceeded {
                resource: "command ring",
                limit: self.ring.capacity(),
            }
        })
    }

    /// Build and queue an image blit onto a live surface
    #[allow(clippy::too_many_arguments)]
    pub fn paint_image(
        &mut self,
        surfaces: &SurfaceManager,
        surface_id: SurfaceId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        pixels: PixelView,
        stride: u32,
        damage: &Damage,
    ) -> BridgeResult<ImageId> {
        Self::check_target(surfaces, surface_id, placement(x, y, width, height)?)?;
        let command = self.build_image_blit(surface_id, x, y, width, height, pixels, stride, damage)?;
        let image_id = command.image_id().unwrap_or(ImageId(0));
        self.submit(command)?;
        Ok(image_id)
    }

    /// Build and queue a solid fill onto a live surface
    #[allow(clippy::too_many_arguments)]
    pub fn fill_rect(
        &mut self,
        surfaces: &SurfaceManager,
        surface_id: SurfaceId,
        color: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> BridgeResult<()> {
        Self::check_target(surfaces, surface_id, placement(x, y, width, height)?)?;
        let command = self.build_fill(surface_id, color, x, y, width, height)?;
        self.submit(command)
    }

    /// `bbox` must lie on a live surface
    fn check_target(surfaces: &SurfaceManager, surface_id: SurfaceId, bbox: QxlRect) -> BridgeResult<()> {
        let surface = surfaces
            .get(surface_id)
            .ok_or_else(|| BridgeError::violation(format!("drawing to unknown {surface_id}")))?;
        let bounds = QxlRect::from_origin(0, 0, surface.width(), surface.height());
        let inside = bbox.left >= bounds.left
            && bbox.top >= bounds.top
            && bbox.right <= bounds.right
            && bbox.bottom <= bounds.bottom;
        if inside {
            Ok(())
        } else {
            Err(BridgeError::InvalidGeometry(format!(
                "{bbox:?} outside {surface_id} ({}x{})",
                surface.width(),
                surface.height()
            )))
        }
    }
}

/// Destination rectangle of a drawable, refused when an edge overflows
fn placement(x: i32, y: i32, width: u32, height: u32) -> BridgeResult<QxlRect> {
    QxlRect::checked_from_origin(x, y, width, height).ok_or_else(|| {
        BridgeError::InvalidGeometry(format!("{width}x{height} at ({x}, {y}) overflows"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::command::CommandKind;
    use crate::display::surface::SurfaceBacking;
    use crate::qxl::{rgb, QXL_CMD_DRAW};
    use crate::renderer::damage::DamageRegion;
    use crate::renderer::FrameBuffer;
    use proptest::prelude::*;
    use std::time::Duration;

    struct Fixture {
        ring: Arc<CommandRing>,
        releases: Arc<ReleaseRegistry>,
        clock: Arc<MmClock>,
        builder: CommandBuilder,
    }

    fn fixture(ring_capacity: usize) -> Fixture {
        let ring = Arc::new(CommandRing::new(ring_capacity, 0, Duration::ZERO));
        let releases = Arc::new(ReleaseRegistry::new());
        let clock = Arc::new(MmClock::default());
        let builder = CommandBuilder::new(
            Arc::clone(&ring),
            Arc::clone(&releases),
            Arc::clone(&clock),
            DEFAULT_MM_TIME_SKEW_MS,
        );
        Fixture { ring, releases, clock, builder }
    }

    #[test]
    fn test_blit_records() {
        let mut fx = fixture(4);
        fx.clock.set(1000);
        let frame = FrameBuffer::new(16, 8).unwrap();
        let view = frame.view(&DamageRegion::new(4, 2, 8, 4)).unwrap();
        let address = view.address();
        let damage = Damage::full(16, 8);

        let command = fx
            .builder
            .build_image_blit(SurfaceId(0), 4, 2, 8, 4, view, frame.stride(), &damage)
            .unwrap();
        assert_eq!(command.kind(), CommandKind::DrawCopy);
        assert_eq!(command.damage(), damage.regions());

        let drawable = *command.drawable().unwrap();
        assert_eq!({ drawable.mm_time }, 650);
        assert_eq!({ drawable.bbox }, QxlRect::from_origin(4, 2, 8, 4));
        assert_eq!({ drawable.release_info.id }, command.release_id().0);

        let image = *command.image().unwrap();
        let copy = drawable.copy().unwrap();
        assert_eq!({ copy.src_bitmap }, command.image().unwrap() as *const QxlImage as u64);
        assert_eq!({ copy.src_area }, QxlRect::from_origin(0, 0, 8, 4));
        assert_eq!({ image.bitmap.data }, address);
        assert_eq!({ image.bitmap.stride }, 64);
        assert_eq!({ image.descriptor.id }, (1u64 << 32) | QXL_IMAGE_GROUP_DEVICE as u64);

        let ext = command.ext().unwrap();
        assert_eq!({ ext.cmd.cmd_type }, QXL_CMD_DRAW);
        assert_eq!({ ext.cmd.data }, command.drawable().unwrap() as *const QxlDrawable as u64);
    }

    #[test]
    fn test_image_ids_increase() {
        let mut fx = fixture(4);
        let frame = FrameBuffer::new(4, 4).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let view = frame.view(&frame.bounds()).unwrap();
            let command = fx
                .builder
                .build_image_blit(SurfaceId(0), 0, 0, 4, 4, view, 16, &Damage::new())
                .unwrap();
            ids.push(command.image_id().unwrap());
        }
        assert_eq!(ids, vec![ImageId(1), ImageId(2), ImageId(3)]);
    }

    #[test]
    fn test_drawable_time_wraps() {
        let fx = fixture(1);
        fx.clock.set(100);
        assert_eq!(fx.builder.drawable_time(), 100u32.wrapping_sub(350));
    }

    #[test]
    fn test_uncovered_blit_rejected() {
        let mut fx = fixture(1);
        let frame = FrameBuffer::new(4, 4).unwrap();
        let view = frame.view(&DamageRegion::new(0, 2, 4, 2)).unwrap();
        let err = fx
            .builder
            .build_image_blit(SurfaceId(0), 0, 0, 4, 4, view, 16, &Damage::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGeometry(_)));
        assert_eq!(fx.releases.issue().id().0, 1);
    }

    #[test]
    fn test_fill_records() {
        let mut fx = fixture(1);
        let command = fx.builder.build_fill(SurfaceId(1), rgb(9, 8, 7), 0, 0, 10, 5).unwrap();
        let fill = command.drawable().unwrap().fill().unwrap();
        assert_eq!(fill.brush.color(), Some(rgb(9, 8, 7)));
        assert_eq!({ fill.rop_descriptor }, SPICE_ROPD_OP_PUT);
        assert!(fx.builder.build_fill(SurfaceId(1), 0, 0, 0, 0, 5).is_err());
    }

    #[test]
    fn test_submit_to_full_ring_releases_command() {
        let mut fx = fixture(1);
        let mut surfaces = SurfaceManager::new(1, Arc::clone(&fx.ring), Arc::clone(&fx.releases));
        let surface = surfaces
            .create_primary_surface(4, 4, SurfaceBacking::allocate(4, 4).unwrap())
            .unwrap();

        let err = fx.builder.fill_rect(&surfaces, surface, 0, 0, 0, 4, 4).unwrap_err();
        assert!(matches!(err, BridgeError::CapacityExceeded { resource: "command ring", .. }));
        assert_eq!(fx.releases.released_count(), 1);
        assert_eq!(fx.ring.len(), 1);
    }

    #[test]
    fn test_paint_to_unknown_surface_is_violation() {
        let mut fx = fixture(4);
        let surfaces = SurfaceManager::new(1, Arc::clone(&fx.ring), Arc::clone(&fx.releases));
        let frame = FrameBuffer::new(2, 2).unwrap();
        let view = frame.view(&frame.bounds()).unwrap();
        let err = fx
            .builder
            .paint_image(&surfaces, SurfaceId(3), 0, 0, 2, 2, view, 8, &Damage::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(fx.ring.is_empty());
    }

    #[test]
    fn test_overflowing_placement_is_invalid_geometry() {
        let mut fx = fixture(4);
        let err = fx
            .builder
            .build_fill(SurfaceId(0), 0, i32::MAX - 1, 0, 10, 10)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGeometry(_)));
        assert!(!err.is_fatal());

        let frame = FrameBuffer::new(4, 4).unwrap();
        let view = frame.view(&frame.bounds()).unwrap();
        let err = fx
            .builder
            .build_image_blit(SurfaceId(0), 0, i32::MAX, 4, 4, view, 16, &Damage::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGeometry(_)));

        // Nothing was stamped for the refused drawables
        assert_eq!(fx.releases.issue().id().0, 1);
    }

    #[test]
    fn test_drawing_off_the_surface_is_rejected() {
        let mut fx = fixture(4);
        let mut surfaces = SurfaceManager::new(1, Arc::clone(&fx.ring), Arc::clone(&fx.releases));
        let surface = surfaces
            .create_primary_surface(4, 4, SurfaceBacking::allocate(4, 4).unwrap())
            .unwrap();
        let queued = fx.ring.len();

        for (x, y, w, h) in [(2, 0, 4, 4), (0, -1, 4, 4), (0, 0, 5, 1), (i32::MAX - 1, 0, 10, 10)] {
            let err = fx.builder.fill_rect(&surfaces, surface, 0, x, y, w, h).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidGeometry(_)), "{x},{y} {w}x{h}");
        }

        let frame = FrameBuffer::new(8, 8).unwrap();
        let view = frame.view(&frame.bounds()).unwrap();
        let err = fx
            .builder
            .paint_image(&surfaces, surface, 0, 0, 8, 8, view, frame.stride(), &Damage::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGeometry(_)));
        assert_eq!(fx.ring.len(), queued);

        fx.builder.fill_rect(&surfaces, surface, 0, 1, 1, 3, 3).unwrap();
        assert_eq!(fx.ring.len(), queued + 1);
    }

    proptest! {
        #[test]
        fn prop_bbox_matches_request(x in 0u32..32, y in 0u32..32, w in 1u32..32, h in 1u32..32) {
            let mut fx = fixture(1);
            let frame = FrameBuffer::new(64, 64).unwrap();
            let view = frame.view(&DamageRegion::new(x as i32, y as i32, w, h)).unwrap();
            let command = fx
                .builder
                .build_image_blit(SurfaceId(0), x as i32, y as i32, w, h, view, frame.stride(), &Damage::new())
                .unwrap();

            let bbox = command.bbox();
            prop_assert_eq!({ bbox.left }, x as i32);
            prop_assert_eq!({ bbox.top }, y as i32);
            prop_assert_eq!(bbox.width(), w as i32);
            prop_assert_eq!(bbox.height(), h as i32);
        }
    }
}
