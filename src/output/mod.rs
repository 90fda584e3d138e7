//! Per-output repaint cycle
//!
//! ```text
//! Idle -> RepaintScheduled -> Repainting -> AwaitingWakeup -> RepaintScheduled ...
//!                                                      (any) -> Destroyed
//! ```
//!
//! A repaint blits the damaged part of the renderer's frame and arms the
//! wakeup timer whether or not the blit made it onto the ring. The wakeup
//! tells the compositor the frame is finished and asks for the next one.
//! When the timer cannot be armed the output falls back to `Idle`.

use std::fmt;

use log::{debug, info, trace, warn};

use crate::display::{DisplayContext, ImageId, ReleaseNotice, ReleaseReason, SurfaceId};
use crate::error::{BridgeError, BridgeResult};
use crate::event_loop::{EventLoopCore, TimerId};
use crate::renderer::damage::{Damage, DamageRegion};
use crate::renderer::Renderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

/// Where an output sits in compositor space and how big it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl OutputGeometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The output's own pixel area, origin at zero
    pub fn local_bounds(&self) -> DamageRegion {
        DamageRegion::new(0, 0, self.width, self.height)
    }
}

impl From<&crate::config::OutputConfig> for OutputGeometry {
    fn from(config: &crate::config::OutputConfig) -> Self {
        Self::new(config.x, config.y, config.width, config.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Idle,
    RepaintScheduled,
    Repainting,
    AwaitingWakeup,
    Destroyed,
}

/// Result of one repaint attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepaintOutcome {
    /// The blit is on the ring
    Sent(ImageId),
    /// Nothing damaged; only the timer was armed
    Skipped,
    /// The frame was dropped for a transient reason
    Dropped(BridgeError),
    /// The output was not waiting for a repaint
    NotScheduled,
}

/// Counters for one output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub wakeups: u64,
    /// Repaints whose wakeup timer could not be armed
    pub wakeups_missed: u64,
}

pub struct OutputLoop {
    id: OutputId,
    geometry: OutputGeometry,
    surface_id: SurfaceId,
    wakeup_timer: TimerId,
    wakeup_interval_ms: u32,
    state: OutputState,
    drop_streak: u32,
    stats: OutputStats,
}

impl OutputLoop {
    pub(crate) fn new(
        id: OutputId,
        geometry: OutputGeometry,
        surface_id: SurfaceId,
        wakeup_timer: TimerId,
        wakeup_interval_ms: u32,
    ) -> Self {
        Self {
            id,
            geometry,
            surface_id,
            wakeup_timer,
            wakeup_interval_ms,
            state: OutputState::Idle,
            drop_streak: 0,
            stats: OutputStats::default(),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn wakeup_timer(&self) -> TimerId {
        self.wakeup_timer
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn stats(&self) -> OutputStats {
        self.stats
    }

    /// Idle -> RepaintScheduled; returns whether the compositor must be asked
    /// for a repaint
    pub fn request_repaint(&mut self) -> bool {
        match self.state {
            OutputState::Idle => {
                self.state = OutputState::RepaintScheduled;
                true
            }
            state => {
                trace!("{} repaint request while {:?}", self.id, state);
                false
            }
        }
    }

    /// RepaintScheduled -> Repainting -> AwaitingWakeup
    pub fn repaint<D, C>(
        &mut self,
        renderer: &mut dyn Renderer,
        display: &mut DisplayContext,
        core: &C,
        damage: &Damage,
    ) -> BridgeResult<RepaintOutcome>
    where
        C: EventLoopCore<D> + ?Sized,
    {
        if self.state != OutputState::RepaintScheduled {
            debug!("{} not scheduled ({:?}), ignoring repaint", self.id, self.state);
            return Ok(RepaintOutcome::NotScheduled);
        }
        self.state = OutputState::Repainting;

        let damage = damage.clipped(&self.geometry.local_bounds());
        let outcome = match damage.extents() {
            None => {
                self.stats.frames_skipped += 1;
                RepaintOutcome::Skipped
            }
            Some(extents) => match self.blit(renderer, display, &damage, extents) {
                Ok(image_id) => {
                    if self.drop_streak > 0 {
                        info!("✅ {} recovered after {} dropped frames", self.id, self.drop_streak);
                    }
                    self.drop_streak = 0;
                    self.stats.frames_sent += 1;
                    RepaintOutcome::Sent(image_id)
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.note_drop(&e);
                    RepaintOutcome::Dropped(e)
                }
            },
        };

        if let Err(e) = core.start_timer(self.wakeup_timer, self.wakeup_interval_ms) {
            // No wakeup will come; Idle lets the next request restart the cycle
            self.state = OutputState::Idle;
            if e.is_fatal() {
                return Err(e);
            }
            self.stats.wakeups_missed += 1;
            warn!("⚠️ Wakeup timer of {} not armed: {}", self.id, e);
            return Ok(outcome);
        }
        self.state = OutputState::AwaitingWakeup;
        Ok(outcome)
    }

    fn blit(
        &mut self,
        renderer: &mut dyn Renderer,
        display: &mut DisplayContext,
        damage: &Damage,
        extents: DamageRegion,
    ) -> BridgeResult<ImageId> {
        let frame = renderer.repaint(self.id, damage)?;
        if frame.width() != self.geometry.width || frame.height() != self.geometry.height {
            return Err(BridgeError::InvalidGeometry(format!(
                "renderer produced {}x{} for {}x{} {}",
                frame.width(),
                frame.height(),
                self.geometry.width,
                self.geometry.height,
                self.id
            )));
        }

        let view = frame.view(&extents)?;
        let stride = view.stride();
        display.builder.paint_image(
            &display.surfaces,
            self.surface_id,
            extents.x,
            extents.y,
            extents.width,
            extents.height,
            view,
            stride,
            damage,
        )
    }

    fn note_drop(&mut self, error: &BridgeError) {
        self.stats.frames_dropped += 1;
        if self.drop_streak == 0 {
            warn!("⚠️ Dropping frame on {}: {}", self.id, error);
        } else {
            debug!("still dropping frames on {} ({}): {}", self.id, self.drop_streak + 1, error);
        }
        self.drop_streak += 1;
    }

    /// AwaitingWakeup -> RepaintScheduled; returns whether the compositor
    /// must finish the frame and schedule the next one
    pub fn wakeup(&mut self) -> bool {
        if self.state != OutputState::AwaitingWakeup {
            trace!("{} spurious wakeup while {:?}", self.id, self.state);
            return false;
        }
        self.stats.wakeups += 1;
        self.state = OutputState::RepaintScheduled;
        true
    }

    /// Stop the timer, release every queued command for this output's
    /// surface, then destroy the surface
    pub fn destroy<D, C>(mut self, display: &mut DisplayContext, core: &C) -> BridgeResult<Vec<ReleaseNotice>>
    where
        C: EventLoopCore<D> + ?Sized,
    {
        core.cancel_timer(self.wakeup_timer);
        core.remove_timer(self.wakeup_timer);

        let notices: Vec<ReleaseNotice> = display
            .ring
            .drain_surface(self.surface_id)
            .into_iter()
            .map(|command| command.release(ReleaseReason::Teardown))
            .collect();

        display.surfaces.destroy_surface(self.surface_id)?;
        self.state = OutputState::Destroyed;
        info!(
            "🗑️ Destroyed {} ({} queued commands released, {} frames sent)",
            self.id,
            notices.len(),
            self.stats.frames_sent
        );
        Ok(notices)
    }
}

impl fmt::Debug for OutputLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputLoop")
            .field("id", &self.id)
            .field("surface_id", &self.surface_id)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
