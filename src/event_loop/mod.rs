//! Timer and fd-watch services the virtualization server runs on
//!
//! The server core does not own a loop; it asks its host for one-shot timers
//! and file-descriptor watches. [`EventLoopCore`] is that host interface,
//! generic over the state `D` handed to callbacks. [`CalloopCore`]
//! implements it on the host's calloop event loop.

use std::os::unix::io::RawFd;

use log::debug;

use crate::error::BridgeResult;

pub mod calloop_core;

pub use calloop_core::CalloopCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub(crate) u64);

/// Readiness a watch is interested in, or that fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchMask {
    pub readable: bool,
    pub writable: bool,
}

impl WatchMask {
    /// Server event bit for readability
    pub const READ: u32 = 1;
    /// Server event bit for writability
    pub const WRITE: u32 = 2;

    pub const NONE: WatchMask = WatchMask { readable: false, writable: false };
    pub const READABLE: WatchMask = WatchMask { readable: true, writable: false };
    pub const WRITABLE: WatchMask = WatchMask { readable: false, writable: true };

    pub fn from_bits(bits: u32) -> Self {
        Self {
            readable: bits & Self::READ != 0,
            writable: bits & Self::WRITE != 0,
        }
    }

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.readable {
            bits |= Self::READ;
        }
        if self.writable {
            bits |= Self::WRITE;
        }
        bits
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// Connection events the server reports on its channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Initialized,
    Disconnected,
}

impl ChannelEvent {
    pub fn from_raw(event: u32) -> Option<Self> {
        match event {
            1 => Some(ChannelEvent::Connected),
            2 => Some(ChannelEvent::Initialized),
            3 => Some(ChannelEvent::Disconnected),
            _ => None,
        }
    }
}

pub type TimerCallback<D> = Box<dyn FnMut(&mut D)>;
pub type WatchCallback<D> = Box<dyn FnMut(RawFd, WatchMask, &mut D)>;

pub trait EventLoopCore<D> {
    /// Register a timer; it does nothing until started
    fn add_timer(&self, callback: TimerCallback<D>) -> BridgeResult<TimerId>;

    /// Fire once after `ms` milliseconds, replacing any pending expiry
    fn start_timer(&self, timer: TimerId, ms: u32) -> BridgeResult<()>;

    /// Disarm without forgetting the timer
    fn cancel_timer(&self, timer: TimerId);

    fn remove_timer(&self, timer: TimerId);

    fn add_fd_watch(&self, fd: RawFd, mask: WatchMask, callback: WatchCallback<D>) -> BridgeResult<WatchId>;

    fn update_fd_watch(&self, watch: WatchId, mask: WatchMask) -> BridgeResult<()>;

    fn remove_watch(&self, watch: WatchId);

    fn channel_event(&self, event: ChannelEvent) {
        debug!("channel event: {:?}", event);
    }
}
