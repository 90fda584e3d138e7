//! Display-side state of a QXL session
//!
//! [`DisplayContext`] owns everything the compositor side touches: the
//! surface table and the drawable builder, plus shared handles to the
//! command ring and release registry that the server side reads from.
//! [`DisplayContext::server_facade`] hands out the server's view of the same
//! ring and registry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::DisplayConfig;
use crate::error::BridgeResult;
use crate::server::ServerFacade;

pub mod builder;
pub mod command;
pub mod release;
pub mod ring;
pub mod surface;

pub use builder::{CommandBuilder, DEFAULT_MM_TIME_SKEW_MS};
pub use command::{
    Command, CommandKind, DispatchedCommand, ImageId, ReleaseHook, ReleaseId, ReleaseNotice,
    ReleaseReason, ReleaseTicket, SurfaceId,
};
pub use release::{ReleaseListener, ReleaseRegistry};
pub use ring::{CommandRing, RingFull};
pub use surface::{Surface, SurfaceBacking, SurfaceManager};

/// The server's multimedia clock, in ms, as last reported by `set_mm_time`
#[derive(Debug, Default)]
pub struct MmClock(AtomicU32);

impl MmClock {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, mm_time: u32) {
        self.0.store(mm_time, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct DisplayContext {
    pub(crate) ring: Arc<CommandRing>,
    pub(crate) releases: Arc<ReleaseRegistry>,
    pub(crate) clock: Arc<MmClock>,
    pub(crate) surfaces: SurfaceManager,
    pub(crate) builder: CommandBuilder,
}

impl DisplayContext {
    pub fn new(config: &DisplayConfig) -> BridgeResult<Self> {
        Self::with_registry(config, ReleaseRegistry::new())
    }

    /// Like [`DisplayContext::new`], reporting every release to `listener`
    pub fn with_release_listener(config: &DisplayConfig, listener: ReleaseListener) -> BridgeResult<Self> {
        Self::with_registry(config, ReleaseRegistry::with_listener(listener))
    }

    fn with_registry(config: &DisplayConfig, registry: ReleaseRegistry) -> BridgeResult<Self> {
        config.validate()?;

        let ring = Arc::new(CommandRing::from_config(config));
        let releases = Arc::new(registry);
        let clock = Arc::new(MmClock::default());
        let surfaces = SurfaceManager::new(config.surface_capacity, Arc::clone(&ring), Arc::clone(&releases));
        let builder = CommandBuilder::new(
            Arc::clone(&ring),
            Arc::clone(&releases),
            Arc::clone(&clock),
            config.mm_time_skew_ms,
        );

        Ok(Self {
            ring,
            releases,
            clock,
            surfaces,
            builder,
        })
    }

    /// Server callbacks bound to this session's ring and registry
    pub fn server_facade(&self) -> ServerFacade {
        ServerFacade::new(
            Arc::clone(&self.ring),
            Arc::clone(&self.releases),
            Arc::clone(&self.clock),
            self.surfaces.capacity(),
        )
    }

    pub fn ring(&self) -> &Arc<CommandRing> {
        &self.ring
    }

    pub fn releases(&self) -> &Arc<ReleaseRegistry> {
        &self.releases
    }

    pub fn clock(&self) -> &Arc<MmClock> {
        &self.clock
    }

    pub fn surfaces(&self) -> &SurfaceManager {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut SurfaceManager {
        &mut self.surfaces
    }

    pub fn builder_mut(&mut self) -> &mut CommandBuilder {
        &mut self.builder
    }
}
