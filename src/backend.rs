//! Compositor-facing backend
//!
//! Owns the display context, the outputs and their wakeup timers. The
//! compositor drives it with `repaint_output`; the backend answers through
//! an [`OutputScheduler`] when a frame is finished and the next one is due.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::{BridgeConfig, MAX_OUTPUT_HEIGHT, MAX_OUTPUT_WIDTH};
use crate::display::{DisplayContext, ReleaseNotice, ReleaseReason, SurfaceBacking};
use crate::error::{BridgeError, BridgeResult};
use crate::event_loop::EventLoopCore;
use crate::output::{OutputGeometry, OutputId, OutputLoop, OutputState, RepaintOutcome};
use crate::renderer::damage::Damage;
use crate::renderer::Renderer;
use crate::server::{ServerCallbacks, ServerFacade};

/// The compositor's frame clock, as seen by the backend
#[cfg_attr(test, mockall::automock)]
pub trait OutputScheduler {
    /// The frame last repainted on `output` is on screen
    fn finish_frame(&mut self, output: OutputId, msec: u32);
    /// `output` wants another repaint
    fn schedule_repaint(&mut self, output: OutputId);
}

#[derive(Debug, Default)]
struct RepaintQueueState {
    pending: Vec<OutputId>,
    finished: Vec<(OutputId, u32)>,
}

/// Scheduler that just queues requests for the host loop to pick up
#[derive(Debug, Clone, Default)]
pub struct RepaintQueue {
    state: Rc<RefCell<RepaintQueueState>>,
}

impl RepaintQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs waiting for a repaint, in request order, without duplicates
    pub fn take_pending(&self) -> Vec<OutputId> {
        std::mem::take(&mut self.state.borrow_mut().pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.state.borrow().pending.is_empty()
    }

    pub fn finished_frames(&self) -> usize {
        self.state.borrow().finished.len()
    }

    pub fn last_finished(&self) -> Option<(OutputId, u32)> {
        self.state.borrow().finished.last().copied()
    }
}

impl OutputScheduler for RepaintQueue {
    fn finish_frame(&mut self, output: OutputId, msec: u32) {
        self.state.borrow_mut().finished.push((output, msec));
    }

    fn schedule_repaint(&mut self, output: OutputId) {
        let mut state = self.state.borrow_mut();
        if !state.pending.contains(&output) {
            state.pending.push(output);
        }
    }
}

pub struct QxlBackend {
    core: Rc<dyn EventLoopCore<QxlBackend>>,
    display: DisplayContext,
    facade: Arc<ServerFacade>,
    renderer: Box<dyn Renderer>,
    scheduler: Box<dyn OutputScheduler>,
    outputs: BTreeMap<OutputId, OutputLoop>,
    next_output: u32,
    config: BridgeConfig,
    epoch: Instant,
}

impl QxlBackend {
    pub fn new(
        config: BridgeConfig,
        display: DisplayContext,
        core: Rc<dyn EventLoopCore<QxlBackend>>,
        renderer: Box<dyn Renderer>,
        scheduler: Box<dyn OutputScheduler>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let facade = Arc::new(display.server_facade());
        facade.set_compression_level(config.server.compression.to_spice_value() as i32);

        info!(
            "🧩 QXL backend ready (ring {}, {} surfaces, compression {})",
            display.ring().capacity(),
            display.surfaces().capacity(),
            config.server.compression
        );

        Ok(Self {
            core,
            display,
            facade,
            renderer,
            scheduler,
            outputs: BTreeMap::new(),
            next_output: 0,
            config,
            epoch: Instant::now(),
        })
    }

    /// Server callbacks for this backend's session
    pub fn facade(&self) -> &Arc<ServerFacade> {
        &self.facade
    }

    pub fn display(&self) -> &DisplayContext {
        &self.display
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputLoop> {
        self.outputs.get(&id)
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    /// Create a primary surface for a new output, paint the background and
    /// schedule its first repaint
    pub fn create_output(&mut self, geometry: OutputGeometry) -> BridgeResult<OutputId> {
        if geometry.width == 0
            || geometry.height == 0
            || geometry.width > MAX_OUTPUT_WIDTH
            || geometry.height > MAX_OUTPUT_HEIGHT
        {
            return Err(BridgeError::InvalidGeometry(format!(
                "output of {}x{} (limit {}x{})",
                geometry.width, geometry.height, MAX_OUTPUT_WIDTH, MAX_OUTPUT_HEIGHT
            )));
        }

        let backing = SurfaceBacking::allocate(geometry.width, geometry.height)?;
        let surface_id =
            self.display
                .surfaces
                .create_primary_surface(geometry.width, geometry.height, backing)?;

        let background = self.config.display.background_color()?;
        if let Err(e) = self.display.builder.fill_rect(
            &self.display.surfaces,
            surface_id,
            background,
            0,
            0,
            geometry.width,
            geometry.height,
        ) {
            warn!("⚠️ Could not paint background of {}: {}", surface_id, e);
        }

        let id = OutputId(self.next_output);
        let timer = match self
            .core
            .add_timer(Box::new(move |backend: &mut QxlBackend| backend.on_wakeup(id)))
        {
            Ok(timer) => timer,
            Err(e) => {
                for command in self.display.ring.drain_surface(surface_id) {
                    command.release(ReleaseReason::Teardown);
                }
                self.display.surfaces.destroy_surface(surface_id)?;
                return Err(e);
            }
        };
        self.next_output += 1;

        if let Some(worker) = self.facade.worker() {
            worker.start();
        }

        let mut output = OutputLoop::new(
            id,
            geometry,
            surface_id,
            timer,
            self.config.display.wakeup_interval_ms,
        );
        if output.request_repaint() {
            self.scheduler.schedule_repaint(id);
        }
        self.outputs.insert(id, output);

        info!(
            "🖥️ Created {} at {},{} ({}x{}) on {}",
            id, geometry.x, geometry.y, geometry.width, geometry.height, surface_id
        );
        Ok(id)
    }

    /// Ask for a repaint of an idle output
    pub fn request_repaint(&mut self, id: OutputId) -> BridgeResult<bool> {
        let output = self
            .outputs
            .get_mut(&id)
            .ok_or_else(|| BridgeError::violation(format!("repaint request for unknown {id}")))?;
        let scheduled = output.request_repaint();
        if scheduled {
            self.scheduler.schedule_repaint(id);
        }
        Ok(scheduled)
    }

    /// Render `damage` on `id` and queue it for the server
    pub fn repaint_output(&mut self, id: OutputId, damage: &Damage) -> BridgeResult<RepaintOutcome> {
        let output = self
            .outputs
            .get_mut(&id)
            .ok_or_else(|| BridgeError::violation(format!("repaint of unknown {id}")))?;
        let outcome = output.repaint(self.renderer.as_mut(), &mut self.display, self.core.as_ref(), damage)?;

        // The wakeup timer could not be armed; ask for the next frame directly
        if output.state() == OutputState::Idle && output.request_repaint() {
            self.scheduler.schedule_repaint(id);
        }
        Ok(outcome)
    }

    /// Wakeup timer of `id` fired
    fn on_wakeup(&mut self, id: OutputId) {
        if let Some(worker) = self.facade.worker() {
            worker.wakeup();
        }

        let Some(output) = self.outputs.get_mut(&id) else {
            debug!("wakeup for removed {} ignored", id);
            return;
        };
        if output.wakeup() {
            let msec = self.epoch.elapsed().as_millis() as u32;
            self.scheduler.finish_frame(id, msec);
            self.scheduler.schedule_repaint(id);
        }
    }

    /// Tear down `id`, releasing whatever it still had queued
    pub fn destroy_output(&mut self, id: OutputId) -> BridgeResult<Vec<ReleaseNotice>> {
        let output = self
            .outputs
            .remove(&id)
            .ok_or_else(|| BridgeError::violation(format!("destroy of unknown {id}")))?;
        output.destroy(&mut self.display, self.core.as_ref())
    }

    /// Destroy every output, then end the server session
    pub fn shutdown(&mut self) -> BridgeResult<Vec<ReleaseNotice>> {
        let mut notices = Vec::new();
        for id in self.output_ids() {
            notices.extend(self.destroy_output(id)?);
        }
        notices.extend(self.facade.shutdown());
        info!("👋 QXL backend shut down ({} releases)", notices.len());
        Ok(notices)
    }
}

impl std::fmt::Debug for QxlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QxlBackend")
            .field("display", &self.display)
            .field("facade", &self.facade)
            .field("outputs", &self.outputs)
            .finish()
    }
}
