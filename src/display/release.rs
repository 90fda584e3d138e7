//! Release bookkeeping for commands the server holds
//!
//! Every command gets a [`ReleaseId`] from the registry when it is built.
//! Once the server takes a command through `get_command`, the command moves
//! into the in-flight table and stays there until the server releases that
//! id. A release for an id that is not in flight (never issued, or already
//! released) is rejected without touching anything.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::command::{
    Command, DispatchedCommand, ReleaseId, ReleaseNotice, ReleaseReason, ReleaseTicket,
};
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{ReleaseInfoExt, MEMSLOT_GROUP};

/// Observer called for every release, after the command's own hook
pub type ReleaseListener = Arc<dyn Fn(&ReleaseNotice) + Send + Sync>;

pub struct ReleaseRegistry {
    next_id: AtomicU64,
    inflight: Mutex<BTreeMap<ReleaseId, Command>>,
    released: Arc<AtomicU64>,
    listener: Option<ReleaseListener>,
}

impl ReleaseRegistry {
    pub fn new() -> Self {
        Self::with_optional_listener(None)
    }

    pub fn with_listener(listener: ReleaseListener) -> Self {
        Self::with_optional_listener(Some(listener))
    }

    fn with_optional_listener(listener: Option<ReleaseListener>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inflight: Mutex::new(BTreeMap::new()),
            released: Arc::new(AtomicU64::new(0)),
            listener,
        }
    }

    /// Fresh release id plus the hook that accounts for its release
    pub fn issue(&self) -> ReleaseTicket {
        let id = ReleaseId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let released = Arc::clone(&self.released);
        let listener = self.listener.clone();
        ReleaseTicket {
            id,
            hook: Box::new(move |notice| {
                released.fetch_add(1, Ordering::Relaxed);
                trace!("released {:?} ({:?}, {:?})", notice.id, notice.kind, notice.reason);
                if let Some(listener) = listener {
                    listener(notice);
                }
            }),
        }
    }

    /// Park `command` until the server releases it
    pub(crate) fn hand_off(&self, command: Command) -> DispatchedCommand {
        let dispatched = DispatchedCommand {
            ext: command.ext().unwrap_or_default(),
            kind: command.kind(),
            surface_id: command.surface_id(),
            bbox: command.bbox(),
            release_id: command.release_id(),
        };
        let previous = self.inflight.lock().insert(command.release_id(), command);
        if let Some(previous) = previous {
            warn!("release id {:?} was already in flight", previous.release_id());
            previous.release(ReleaseReason::Rejected);
        }
        dispatched
    }

    /// Server-side release of a dispatched command
    pub fn release(&self, info: ReleaseInfoExt) -> BridgeResult<ReleaseNotice> {
        if info.group_id != MEMSLOT_GROUP {
            return Err(BridgeError::violation(format!(
                "release for memslot group {} (only group {} exists)",
                info.group_id, MEMSLOT_GROUP
            )));
        }

        let command = self.inflight.lock().remove(&ReleaseId(info.id));
        match command {
            Some(command) => Ok(command.release(ReleaseReason::Server)),
            None => {
                debug!("ignoring release of unknown handle {:#x}", info.id);
                Err(BridgeError::UnknownRelease(info.id))
            }
        }
    }

    /// Release everything still in flight, lowest id first
    pub fn release_all(&self, reason: ReleaseReason) -> Vec<ReleaseNotice> {
        let inflight = std::mem::take(&mut *self.inflight.lock());
        inflight
            .into_values()
            .map(|command| command.release(reason))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_in_flight(&self, id: ReleaseId) -> bool {
        self.inflight.lock().contains_key(&id)
    }

    /// Hooks fired so far, whatever the reason
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl Drop for ReleaseRegistry {
    /// Whatever the server still held is released, lowest id first
    fn drop(&mut self) {
        let inflight = std::mem::take(self.inflight.get_mut());
        if !inflight.is_empty() {
            debug!("releasing {} in-flight commands on a discarded registry", inflight.len());
        }
        for command in inflight.into_values() {
            command.release(ReleaseReason::Shutdown);
        }
    }
}

impl Default for ReleaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReleaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight())
            .field("released", &self.released_count())
            .finish()
    }
}
