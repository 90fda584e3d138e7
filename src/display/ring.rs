//! Bounded FIFO between the output loops and the server's command poll
//!
//! Producers (output loops on the event-loop thread) and the consumer (the
//! server worker) share one lock. Cursors run over `[0, 2 * capacity)` so a
//! full ring and an empty ring never look alike, and the slot index is the
//! cursor modulo capacity. An enqueue against a full ring backs off and
//! retries a bounded number of times with the lock released.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use super::command::{Command, ReleaseReason, SurfaceId};
use crate::config::DisplayConfig;

/// Default ring depth
pub const DEFAULT_RING_CAPACITY: usize = 1024;
/// Retries after the first failed attempt before an enqueue gives up
pub const DEFAULT_ENQUEUE_ATTEMPTS: u32 = 10;
pub const DEFAULT_ENQUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// Returned when the ring stayed full for every retry; hands the command back
pub struct RingFull(pub Command);

impl RingFull {
    pub fn into_inner(self) -> Command {
        self.0
    }
}

impl fmt::Debug for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RingFull").field(&self.0).finish()
    }
}

impl fmt::Display for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command ring full")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor(usize);

impl Cursor {
    fn slot(self, capacity: usize) -> usize {
        self.0 % capacity
    }

    fn advance(self, capacity: usize) -> Self {
        Cursor((self.0 + 1) % (2 * capacity))
    }

    fn distance_from(self, start: Cursor, capacity: usize) -> usize {
        (self.0 + 2 * capacity - start.0) % (2 * capacity)
    }
}

struct RingState {
    slots: Box<[Option<Command>]>,
    start: Cursor,
    end: Cursor,
}

impl RingState {
    fn with_capacity(capacity: usize, origin: usize) -> Self {
        let origin = Cursor(origin % (2 * capacity));
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            start: origin,
            end: origin,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        self.end.distance_from(self.start, self.capacity())
    }

    fn push(&mut self, command: Command) -> Result<(), Command> {
        let capacity = self.capacity();
        if self.len() == capacity {
            return Err(command);
        }
        self.slots[self.end.slot(capacity)] = Some(command);
        self.end = self.end.advance(capacity);
        Ok(())
    }

    fn pop(&mut self) -> Option<Command> {
        if self.start == self.end {
            return None;
        }
        let capacity = self.capacity();
        let command = self.slots[self.start.slot(capacity)].take();
        self.start = self.start.advance(capacity);
        command
    }
}

/// The shared command queue
pub struct CommandRing {
    state: Mutex<RingState>,
    capacity: usize,
    enqueue_attempts: u32,
    enqueue_backoff: Duration,
}

impl CommandRing {
    /// Ring of `capacity` slots (at least one)
    pub fn new(capacity: usize, enqueue_attempts: u32, enqueue_backoff: Duration) -> Self {
        Self::with_origin(capacity, enqueue_attempts, enqueue_backoff, 0)
    }

    pub fn from_config(config: &DisplayConfig) -> Self {
        Self::new(
            config.ring_capacity,
            config.enqueue_attempts,
            Duration::from_micros(config.enqueue_backoff_us),
        )
    }

    /// Start both cursors at `origin` instead of zero
    fn with_origin(capacity: usize, enqueue_attempts: u32, enqueue_backoff: Duration, origin: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState::with_capacity(capacity, origin)),
            capacity,
            enqueue_attempts,
            enqueue_backoff,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One attempt, no waiting
    pub fn try_enqueue(&self, command: Command) -> Result<(), RingFull> {
        self.state.lock().push(command).map_err(RingFull)
    }

    /// Append `command`, waiting for space up to the configured retry budget
    pub fn enqueue(&self, command: Command) -> Result<(), RingFull> {
        let mut command = command;
        let mut attempt = 0;
        loop {
            match self.state.lock().push(command) {
                Ok(()) => {
                    trace!("enqueued after {} retries", attempt);
                    return Ok(());
                }
                Err(rejected) => command = rejected,
            }
            if attempt >= self.enqueue_attempts {
                debug!(
                    "command ring stayed full after {} retries ({:?})",
                    attempt,
                    command.kind()
                );
                return Err(RingFull(command));
            }
            attempt += 1;
            thread::sleep(self.enqueue_backoff);
        }
    }

    /// Oldest command, if any
    pub fn dequeue(&self) -> Option<Command> {
        self.state.lock().pop()
    }

    /// Remove every queued command targeting `surface_id`, keeping the
    /// relative order of both the removed and the remaining commands
    pub fn drain_surface(&self, surface_id: SurfaceId) -> Vec<Command> {
        let mut state = self.state.lock();
        let mut kept = Vec::with_capacity(state.len());
        let mut drained = Vec::new();
        while let Some(command) = state.pop() {
            if command.surface_id() == surface_id {
                drained.push(command);
            } else {
                kept.push(command);
            }
        }
        for command in kept {
            let pushed = state.push(command).is_ok();
            debug_assert!(pushed, "ring shrank while locked");
        }
        drained
    }

    /// Remove everything, oldest first
    pub fn drain(&self) -> Vec<Command> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.len());
        while let Some(command) = state.pop() {
            drained.push(command);
        }
        drained
    }
}

impl Drop for CommandRing {
    /// Commands still queued when the ring goes away are released in order
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut released = 0;
        while let Some(command) = state.pop() {
            command.release(ReleaseReason::Shutdown);
            released += 1;
        }
        if released > 0 {
            debug!("released {} commands left on a discarded ring", released);
        }
    }
}

impl fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
