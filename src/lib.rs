//! # qxl-bridge
//!
//! Feeds a compositor's repaints to a SPICE-style virtualization server as
//! QXL display commands.
//!
//! ## Architecture
//!
//! - `qxl`: byte-exact QXL command records
//! - `display`: command ring, surfaces, command builder and release tracking
//! - `server`: the callback table the server drives, plus an in-process loopback server
//! - `event_loop`: timer and fd-watch services on top of calloop
//! - `output`: per-output repaint state machine
//! - `renderer`: framebuffers, damage and the renderer seam
//! - `backend`: ties outputs, the event loop and the compositor's scheduler together
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use calloop::EventLoop;
//! use qxl_bridge::{BridgeConfig, CalloopCore, DisplayContext, OutputGeometry, PatternRenderer, QxlBackend, RepaintQueue};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::default();
//!     let mut event_loop: EventLoop<'static, QxlBackend> = EventLoop::try_new()?;
//!     let core = Rc::new(CalloopCore::new(event_loop.handle()));
//!     let display = DisplayContext::new(&config.display)?;
//!     let queue = RepaintQueue::new();
//!     let mut backend = QxlBackend::new(
//!         config,
//!         display,
//!         core,
//!         Box::new(PatternRenderer::new(1024, 480)),
//!         Box::new(queue.clone()),
//!     )?;
//!     backend.create_output(OutputGeometry::new(0, 0, 1024, 480))?;
//!     event_loop.dispatch(None, &mut backend)?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod display;
pub mod error;
pub mod event_loop;
pub mod output;
pub mod qxl;
pub mod renderer;
pub mod server;

pub use backend::{OutputScheduler, QxlBackend, RepaintQueue};
pub use config::{BridgeConfig, CompressionMode, DisplayConfig, OutputConfig, ServerConfig};
pub use display::{
    Command, CommandKind, CommandRing, DispatchedCommand, DisplayContext, ImageId, ReleaseId,
    ReleaseNotice, ReleaseReason, ReleaseRegistry, SurfaceBacking, SurfaceId,
};
pub use error::{BridgeError, BridgeResult};
pub use event_loop::{CalloopCore, EventLoopCore, TimerId, WatchId, WatchMask};
pub use output::{OutputGeometry, OutputId, OutputLoop, OutputState, RepaintOutcome};
pub use renderer::damage::{Damage, DamageRegion};
pub use renderer::{FrameBuffer, PatternRenderer, Renderer};
pub use server::{LoopbackServer, QxlWorker, ServerCallbacks, ServerFacade};
