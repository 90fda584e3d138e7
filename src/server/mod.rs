//! Server-facing side of a QXL session
//!
//! The virtualization server drives the device through a table of
//! callbacks ([`ServerCallbacks`]) and pushes work into its own pipeline
//! through a worker handle ([`QxlWorker`]) it attaches once. The server may
//! call in from its own thread, so the facade only touches the shared ring,
//! the release registry and atomics.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, error, info, trace};
use parking_lot::Mutex;

use crate::display::{
    CommandKind, CommandRing, DispatchedCommand, MmClock, ReleaseNotice, ReleaseReason,
    ReleaseRegistry,
};
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{
    DevInitInfo, MemSlot, QxlCommandExt, QxlDevSurfaceCreate, ReleaseInfoExt, MEMSLOT_GEN_BITS,
    MEMSLOT_ID_BITS, NUM_MEMSLOTS, NUM_MEMSLOTS_GROUPS,
};

pub mod loopback;

pub use loopback::{LoopbackServer, LoopbackStats, LoopbackWorker};

/// The server's handle for work the device pushes to it
#[cfg_attr(test, mockall::automock)]
pub trait QxlWorker: Send + Sync {
    fn add_memslot(&self, slot: &MemSlot);
    fn create_primary_surface(&self, surface_id: u32, surface: &QxlDevSurfaceCreate);
    fn start(&self);
    fn stop(&self);
    /// There is new work on the command ring
    fn wakeup(&self);
}

/// Callback table the server invokes on the device
pub trait ServerCallbacks: Send + Sync {
    fn attach_worker(&self, worker: Arc<dyn QxlWorker>) -> BridgeResult<()>;
    fn set_compression_level(&self, level: i32);
    fn set_mm_time(&self, mm_time: u32);
    fn get_init_info(&self) -> DevInitInfo;
    fn get_command(&self) -> BridgeResult<Option<DispatchedCommand>>;
    fn req_cmd_notification(&self) -> bool;
    fn release_resource(&self, info: ReleaseInfoExt) -> BridgeResult<ReleaseNotice>;
    fn get_cursor_command(&self) -> Option<QxlCommandExt>;
    fn req_cursor_notification(&self) -> bool;
    fn notify_update(&self, update_id: u32);
    fn flush_resources(&self) -> u32;
}

pub struct ServerFacade {
    ring: Arc<CommandRing>,
    releases: Arc<ReleaseRegistry>,
    clock: Arc<MmClock>,
    worker: OnceLock<Arc<dyn QxlWorker>>,
    /// Held across dequeue and hand-off; `true` once the session is shut down
    closed: Mutex<bool>,
    compression_level: AtomicI32,
    surface_capacity: u32,
    dispatched: AtomicU64,
}

impl ServerFacade {
    pub fn new(
        ring: Arc<CommandRing>,
        releases: Arc<ReleaseRegistry>,
        clock: Arc<MmClock>,
        surface_capacity: usize,
    ) -> Self {
        Self {
            ring,
            releases,
            clock,
            worker: OnceLock::new(),
            closed: Mutex::new(false),
            compression_level: AtomicI32::new(0),
            surface_capacity: u32::try_from(surface_capacity).unwrap_or(u32::MAX),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn worker(&self) -> Option<&Arc<dyn QxlWorker>> {
        self.worker.get()
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level.load(Ordering::Relaxed)
    }

    /// Drawables handed to the server so far
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.releases.in_flight()
    }

    /// Stop the worker and release everything still queued or held by the
    /// server: ring entries in order, then in-flight commands by id
    pub fn shutdown(&self) -> Vec<ReleaseNotice> {
        if let Some(worker) = self.worker.get() {
            worker.stop();
        }

        // Waits out a get_command in progress; later ones find the session closed
        let mut closed = self.closed.lock();
        *closed = true;

        let mut notices: Vec<ReleaseNotice> = self
            .ring
            .drain()
            .into_iter()
            .map(|command| command.release(ReleaseReason::Shutdown))
            .collect();
        notices.extend(self.releases.release_all(ReleaseReason::Shutdown));

        info!("🛑 Server session shut down ({} outstanding commands released)", notices.len());
        notices
    }
}

impl ServerCallbacks for ServerFacade {
    fn attach_worker(&self, worker: Arc<dyn QxlWorker>) -> BridgeResult<()> {
        if self.worker.set(Arc::clone(&worker)).is_err() {
            error!("❌ A QXL worker is already attached; only one server session is supported");
            return Err(BridgeError::violation("attach_worker called more than once"));
        }

        worker.add_memslot(&MemSlot::identity());
        info!("🔗 QXL worker attached");
        Ok(())
    }

    fn set_compression_level(&self, level: i32) {
        debug!("compression level set to {}", level);
        self.compression_level.store(level, Ordering::Relaxed);
    }

    fn set_mm_time(&self, mm_time: u32) {
        trace!("mm time {}", mm_time);
        self.clock.set(mm_time);
    }

    fn get_init_info(&self) -> DevInitInfo {
        DevInitInfo {
            num_memslots_groups: NUM_MEMSLOTS_GROUPS,
            num_memslots: NUM_MEMSLOTS,
            memslot_gen_bits: MEMSLOT_GEN_BITS,
            memslot_id_bits: MEMSLOT_ID_BITS,
            qxl_ram_size: 0,
            internal_groupslot_id: 0,
            n_surfaces: self.surface_capacity,
        }
    }

    fn get_command(&self) -> BridgeResult<Option<DispatchedCommand>> {
        let closed = self.closed.lock();
        if *closed {
            trace!("get_command after shutdown");
            return Ok(None);
        }

        while let Some(command) = self.ring.dequeue() {
            if command.kind() != CommandKind::CreateSurface {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(self.releases.hand_off(command)));
            }

            let Some(worker) = self.worker.get() else {
                command.release(ReleaseReason::Rejected);
                return Err(BridgeError::violation("surface announced before a worker was attached"));
            };
            if let Some(record) = command.surface_create() {
                worker.create_primary_surface(command.surface_id().raw(), record);
            }
            debug!("handed {} to the worker", command.surface_id());
            command.release(ReleaseReason::Delivered);
        }
        Ok(None)
    }

    fn req_cmd_notification(&self) -> bool {
        true
    }

    fn release_resource(&self, info: ReleaseInfoExt) -> BridgeResult<ReleaseNotice> {
        self.releases.release(info)
    }

    fn get_cursor_command(&self) -> Option<QxlCommandExt> {
        None
    }

    fn req_cursor_notification(&self) -> bool {
        true
    }

    fn notify_update(&self, update_id: u32) {
        debug!("update {} notified", update_id);
    }

    fn flush_resources(&self) -> u32 {
        0
    }
}

impl fmt::Debug for ServerFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerFacade")
            .field("ring", &self.ring)
            .field("releases", &self.releases)
            .field("worker_attached", &self.worker.get().is_some())
            .field("closed", &*self.closed.lock())
            .field("surface_capacity", &self.surface_capacity)
            .finish()
    }
}
