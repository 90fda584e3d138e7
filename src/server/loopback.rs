//! In-process stand-in for the virtualization server
//!
//! Runs the server half of the protocol on its own thread: it attaches a
//! worker, waits for wakeups, pulls every queued command and releases it
//! straight away. Useful for running the bridge without a remote viewer
//! and for end-to-end tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::{QxlWorker, ServerCallbacks, ServerFacade};
use crate::display::CommandKind;
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{MemSlot, QxlDevSurfaceCreate, ReleaseInfoExt, MEMSLOT_GROUP};

/// Upper bound on how long the server thread sleeps between checks
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub commands: u64,
    pub fills: u64,
    pub blits: u64,
    pub pixels: u64,
    pub surfaces_created: u32,
    pub memslots: u32,
    pub wakeups: u64,
}

#[derive(Debug, Default)]
struct WorkerState {
    running: bool,
    stopped: bool,
    pending: bool,
    stats: LoopbackStats,
    surfaces: Vec<(u32, QxlDevSurfaceCreate)>,
}

/// Worker handle the loopback server attaches to the device
#[derive(Debug, Default)]
pub struct LoopbackWorker {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

impl LoopbackWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn stats(&self) -> LoopbackStats {
        self.state.lock().stats
    }

    /// Primary surfaces announced so far, as `(surface id, record)`
    pub fn surfaces(&self) -> Vec<(u32, QxlDevSurfaceCreate)> {
        self.state.lock().surfaces.clone()
    }

    /// Block until there is work or the worker stops. Returns false once stopped.
    fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.stopped && !(state.running && state.pending) {
            self.wake.wait_for(&mut state, timeout);
        }
        if state.stopped {
            return false;
        }
        state.pending = false;
        true
    }

    fn record(&self, update: impl FnOnce(&mut LoopbackStats)) {
        update(&mut self.state.lock().stats);
    }
}

impl QxlWorker for LoopbackWorker {
    fn add_memslot(&self, slot: &MemSlot) {
        debug!("loopback memslot {} in group {}", slot.slot_id, slot.slot_group_id);
        self.state.lock().stats.memslots += 1;
    }

    fn create_primary_surface(&self, surface_id: u32, surface: &QxlDevSurfaceCreate) {
        let mut state = self.state.lock();
        state.stats.surfaces_created += 1;
        state.surfaces.push((surface_id, *surface));
        info!(
            "🖥️ Loopback server created primary surface {} ({}x{})",
            surface_id,
            { surface.width },
            { surface.height }
        );
    }

    fn start(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.pending = true;
        self.wake.notify_all();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.stopped = true;
        self.wake.notify_all();
    }

    fn wakeup(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        state.stats.wakeups += 1;
        self.wake.notify_all();
    }
}

pub struct LoopbackServer {
    worker: Arc<LoopbackWorker>,
    thread: JoinHandle<BridgeResult<()>>,
}

impl LoopbackServer {
    /// Attach a fresh worker to `facade` and start serving it
    pub fn start(facade: Arc<ServerFacade>) -> BridgeResult<Self> {
        let worker = Arc::new(LoopbackWorker::new());
        facade.attach_worker(Arc::clone(&worker) as Arc<dyn QxlWorker>)?;

        let thread_worker = Arc::clone(&worker);
        let thread = thread::Builder::new()
            .name("qxl-loopback".to_string())
            .spawn(move || serve(&facade, &thread_worker))
            .map_err(|e| BridgeError::allocation(format!("loopback server thread: {e}")))?;

        info!("🔁 Loopback server started");
        Ok(Self { worker, thread })
    }

    pub fn worker(&self) -> &Arc<LoopbackWorker> {
        &self.worker
    }

    pub fn stats(&self) -> LoopbackStats {
        self.worker.stats()
    }

    /// Stop the server thread and report what it saw
    pub fn stop(self) -> BridgeResult<LoopbackStats> {
        self.worker.stop();
        match self.thread.join() {
            Ok(result) => result?,
            Err(_) => return Err(BridgeError::violation("loopback server thread panicked")),
        }
        let stats = self.worker.stats();
        info!(
            "🔁 Loopback server stopped after {} commands ({} pixels)",
            stats.commands, stats.pixels
        );
        Ok(stats)
    }
}

fn serve(facade: &ServerFacade, worker: &LoopbackWorker) -> BridgeResult<()> {
    let epoch = Instant::now();
    while worker.wait_for_work(IDLE_POLL) {
        facade.set_mm_time(epoch.elapsed().as_millis() as u32);

        loop {
            let command = match facade.get_command() {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Loopback server stopping: {}", e);
                    return Err(e);
                }
            };

            let area = command.bbox.width().max(0) as u64 * command.bbox.height().max(0) as u64;
            worker.record(|stats| {
                stats.commands += 1;
                match command.kind {
                    CommandKind::DrawCopy => {
                        stats.blits += 1;
                        stats.pixels += area;
                    }
                    CommandKind::DrawFill => stats.fills += 1,
                    CommandKind::CreateSurface => {}
                }
            });

            let release = ReleaseInfoExt {
                id: command.release_id.0,
                group_id: MEMSLOT_GROUP,
            };
            if let Err(e) = facade.release_resource(release) {
                warn!("loopback release of {:?} failed: {}", command.release_id, e);
            }
        }

        facade.req_cmd_notification();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_wait_reports_stop() {
        let worker = LoopbackWorker::new();
        worker.start();
        assert!(worker.wait_for_work(Duration::from_millis(1)));
        worker.stop();
        assert!(!worker.wait_for_work(Duration::from_millis(1)));
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_records_surfaces() {
        let worker = LoopbackWorker::new();
        worker.add_memslot(&MemSlot::identity());
        worker.create_primary_surface(0, &QxlDevSurfaceCreate::primary(8, 4, 0));
        worker.wakeup();

        let stats = worker.stats();
        assert_eq!(stats.memslots, 1);
        assert_eq!(stats.surfaces_created, 1);
        assert_eq!(stats.wakeups, 1);
        assert_eq!(worker.surfaces()[0].0, 0);
    }
}
