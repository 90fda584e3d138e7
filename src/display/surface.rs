//! Virtual display surfaces
//!
//! A session supports a fixed number of live surfaces. Ids come from a
//! counter that starts at zero and only moves forward, so an id is never
//! handed out twice even after its surface is destroyed.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::command::{Command, Payload, ReleaseReason, SurfaceId};
use super::release::ReleaseRegistry;
use super::ring::CommandRing;
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{QxlDevSurfaceCreate, QxlRect};
use crate::renderer::BYTES_PER_PIXEL;

/// Default number of simultaneously live surfaces
pub const DEFAULT_SURFACE_CAPACITY: usize = 2;

/// Pixel memory backing a primary surface
#[derive(Debug)]
pub struct SurfaceBacking {
    pixels: Box<[u8]>,
    width: u32,
    height: u32,
}

impl SurfaceBacking {
    /// Zeroed xRGB backing; fails instead of aborting when memory is short
    pub fn allocate(width: u32, height: u32) -> BridgeResult<Self> {
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidGeometry(format!(
                "surface backing {width}x{height} is empty"
            )));
        }
        let len = width as usize * height as usize * BYTES_PER_PIXEL as usize;
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|e| BridgeError::allocation(format!("{width}x{height} surface backing: {e}")))?;
        pixels.resize(len, 0);

        Ok(Self {
            pixels: pixels.into_boxed_slice(),
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn address(&self) -> u64 {
        self.pixels.as_ptr() as u64
    }
}

/// A live surface and the memory the server renders into
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    backing: SurfaceBacking,
}

impl Surface {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.backing.width
    }

    pub fn height(&self) -> u32 {
        self.backing.height
    }

    pub fn backing(&self) -> &SurfaceBacking {
        &self.backing
    }
}

pub struct SurfaceManager {
    capacity: usize,
    next_id: u32,
    live: BTreeMap<SurfaceId, Surface>,
    ring: Arc<CommandRing>,
    releases: Arc<ReleaseRegistry>,
}

impl SurfaceManager {
    pub fn new(capacity: usize, ring: Arc<CommandRing>, releases: Arc<ReleaseRegistry>) -> Self {
        Self {
            capacity,
            next_id: 0,
            live: BTreeMap::new(),
            ring,
            releases,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.live.get(&id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.live.contains_key(&id)
    }

    /// Register a primary surface over `backing` and queue its creation
    pub fn create_primary_surface(
        &mut self,
        width: u32,
        height: u32,
        backing: SurfaceBacking,
    ) -> BridgeResult<SurfaceId> {
        if self.live.len() >= self.capacity {
            warn!("⚠️ Surface limit reached ({} live)", self.live.len());
            return Err(BridgeError::CapacityExceeded {
                resource: "surface",
                limit: self.capacity,
            });
        }
        if backing.width != width || backing.height != height {
            return Err(BridgeError::InvalidGeometry(format!(
                "backing is {}x{}, surface is {width}x{height}",
                backing.width, backing.height
            )));
        }

        let id = SurfaceId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| BridgeError::violation("surface id space exhausted"))?;

        let record = QxlDevSurfaceCreate::primary(width, height, backing.address());
        let command = Command::new(
            id,
            QxlRect::from_origin(0, 0, width, height),
            Payload::CreateSurface(Box::new(record)),
            self.releases.issue(),
        );

        if let Err(full) = self.ring.enqueue(command) {
            full.into_inner().release(ReleaseReason::Rejected);
            warn!("⚠️ Could not queue creation of {id}: command ring full");
            return Err(BridgeError::CapacityExceeded {
                resource: "command ring",
                limit: self.ring.capacity(),
            });
        }

        self.live.insert(id, Surface { id, backing });
        info!("🖼️ Created primary {} ({}x{})", id, width, height);
        Ok(id)
    }

    /// Forget a surface; its backing is freed on return
    pub fn destroy_surface(&mut self, id: SurfaceId) -> BridgeResult<()> {
        match self.live.remove(&id) {
            Some(surface) => {
                debug!("destroyed {} ({}x{})", id, surface.width(), surface.height());
                Ok(())
            }
            None => Err(BridgeError::violation(format!("destroy of unknown {id}"))),
        }
    }
}

impl std::fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceManager")
            .field("capacity", &self.capacity)
            .field("next_id", &self.next_id)
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::command::CommandKind;
    use std::time::Duration;

    fn manager(capacity: usize, ring_capacity: usize) -> (SurfaceManager, Arc<CommandRing>) {
        let ring = Arc::new(CommandRing::new(ring_capacity, 0, Duration::ZERO));
        let releases = Arc::new(ReleaseRegistry::new());
        (SurfaceManager::new(capacity, Arc::clone(&ring), releases), ring)
    }

    fn backing(w: u32, h: u32) -> SurfaceBacking {
        SurfaceBacking::allocate(w, h).unwrap()
    }

    #[test]
    fn test_ids_start_at_zero_and_are_not_reused() {
        let (mut surfaces, _ring) = manager(2, 8);
        let a = surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();
        let b = surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();
        assert_eq!((a, b), (SurfaceId(0), SurfaceId(1)));

        surfaces.destroy_surface(a).unwrap();
        let c = surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();
        assert_eq!(c, SurfaceId(2));
        assert_eq!(surfaces.live_count(), 2);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (mut surfaces, ring) = manager(2, 8);
        surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();
        surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();

        let err = surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap_err();
        assert_eq!(err, BridgeError::CapacityExceeded { resource: "surface", limit: 2 });
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_creation_is_queued_with_backing_address() {
        let (mut surfaces, ring) = manager(2, 8);
        let bk = backing(8, 2);
        let address = bk.address();
        let id = surfaces.create_primary_surface(8, 2, bk).unwrap();

        let command = ring.dequeue().unwrap();
        assert_eq!(command.kind(), CommandKind::CreateSurface);
        assert_eq!(command.surface_id(), id);
        let record = command.surface_create().copied().unwrap();
        assert_eq!({ record.mem }, address);
        assert_eq!({ record.stride }, -32);
        assert_eq!(surfaces.get(id).unwrap().backing().address(), address);
    }

    #[test]
    fn test_full_ring_rolls_back() {
        let (mut surfaces, _ring) = manager(4, 1);
        surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap();
        let err = surfaces.create_primary_surface(4, 4, backing(4, 4)).unwrap_err();
        assert!(matches!(err, BridgeError::CapacityExceeded { resource: "command ring", .. }));
        assert_eq!(surfaces.live_count(), 1);
    }

    #[test]
    fn test_destroy_unknown_surface() {
        let (mut surfaces, _ring) = manager(2, 8);
        assert!(surfaces.destroy_surface(SurfaceId(9)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_mismatched_backing_rejected() {
        let (mut surfaces, _ring) = manager(2, 8);
        assert!(matches!(
            surfaces.create_primary_surface(4, 4, backing(2, 2)),
            Err(BridgeError::InvalidGeometry(_))
        ));
        assert!(SurfaceBacking::allocate(0, 4).is_err());
    }
}
