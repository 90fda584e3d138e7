//! [`EventLoopCore`] on a calloop event loop
//!
//! Each started timer is a one-shot calloop `Timer` source; restarting
//! replaces the pending source. Fd watches are level-triggered `Generic`
//! sources; changing a watch's mask re-registers it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction, Readiness, RegistrationToken};
use log::{debug, trace, warn};

use super::{EventLoopCore, TimerCallback, TimerId, WatchCallback, WatchId, WatchMask};
use crate::error::{BridgeError, BridgeResult};

struct TimerEntry<D> {
    callback: Rc<RefCell<TimerCallback<D>>>,
    /// Pending calloop source; cleared by the source itself when it fires
    armed: Rc<Cell<Option<RegistrationToken>>>,
}

struct WatchEntry<D> {
    fd: RawFd,
    mask: WatchMask,
    callback: Rc<RefCell<WatchCallback<D>>>,
    token: RegistrationToken,
}

pub struct CalloopCore<D: 'static> {
    handle: LoopHandle<'static, D>,
    timers: RefCell<HashMap<TimerId, TimerEntry<D>>>,
    watches: RefCell<HashMap<WatchId, WatchEntry<D>>>,
    next_id: Cell<u64>,
}

impl<D: 'static> CalloopCore<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self {
            handle,
            timers: RefCell::new(HashMap::new()),
            watches: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.borrow().len()
    }

    /// Whether `timer` has a pending expiry
    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.timers
            .borrow()
            .get(&timer)
            .map(|entry| {
                let token = entry.armed.get();
                token.is_some()
            })
            .unwrap_or(false)
    }

    fn register_watch(
        &self,
        fd: RawFd,
        mask: WatchMask,
        callback: Rc<RefCell<WatchCallback<D>>>,
    ) -> BridgeResult<RegistrationToken> {
        let interest = Interest {
            readable: mask.readable,
            writable: mask.writable,
        };
        // SAFETY: the server keeps the fd open until it removes the watch
        let source = Generic::new(unsafe { BorrowedFd::borrow_raw(fd) }, interest, Mode::Level);
        self.handle
            .insert_source(source, move |readiness: Readiness, _fd, data: &mut D| {
                let fired = WatchMask {
                    readable: readiness.readable,
                    writable: readiness.writable,
                };
                (callback.borrow_mut())(fd, fired, data);
                Ok(PostAction::Continue)
            })
            .map_err(|e| BridgeError::allocation(format!("fd {fd} watch: {}", e.error)))
    }
}

impl<D: 'static> EventLoopCore<D> for CalloopCore<D> {
    fn add_timer(&self, callback: TimerCallback<D>) -> BridgeResult<TimerId> {
        let id = TimerId(self.allocate_id());
        self.timers.borrow_mut().insert(
            id,
            TimerEntry {
                callback: Rc::new(RefCell::new(callback)),
                armed: Rc::new(Cell::new(None)),
            },
        );
        debug!("added timer {:?}", id);
        Ok(id)
    }

    fn start_timer(&self, timer: TimerId, ms: u32) -> BridgeResult<()> {
        let (callback, armed) = {
            let timers = self.timers.borrow();
            let entry = timers
                .get(&timer)
                .ok_or_else(|| BridgeError::violation(format!("start of removed timer {timer:?}")))?;
            (Rc::clone(&entry.callback), Rc::clone(&entry.armed))
        };

        if let Some(token) = armed.take() {
            self.handle.remove(token);
        }

        let fired = Rc::clone(&armed);
        let token = self
            .handle
            .insert_source(
                Timer::from_duration(Duration::from_millis(ms as u64)),
                move |_deadline: Instant, _meta: &mut (), data: &mut D| {
                    fired.set(None);
                    (callback.borrow_mut())(data);
                    TimeoutAction::Drop
                },
            )
            .map_err(|e| BridgeError::allocation(format!("timer source: {}", e.error)))?;

        armed.set(Some(token));
        trace!("timer {:?} armed for {}ms", timer, ms);
        Ok(())
    }

    fn cancel_timer(&self, timer: TimerId) {
        match self.timers.borrow().get(&timer) {
            Some(entry) => {
                if let Some(token) = entry.armed.take() {
                    self.handle.remove(token);
                }
            }
            None => debug!("cancel of unknown timer {:?} ignored", timer),
        }
    }

    fn remove_timer(&self, timer: TimerId) {
        match self.timers.borrow_mut().remove(&timer) {
            Some(entry) => {
                if let Some(token) = entry.armed.take() {
                    self.handle.remove(token);
                }
                debug!("removed timer {:?}", timer);
            }
            None => warn!("remove of unknown timer {:?} ignored", timer),
        }
    }

    fn add_fd_watch(&self, fd: RawFd, mask: WatchMask, callback: WatchCallback<D>) -> BridgeResult<WatchId> {
        let callback = Rc::new(RefCell::new(callback));
        let token = self.register_watch(fd, mask, Rc::clone(&callback))?;
        let id = WatchId(self.allocate_id());
        self.watches.borrow_mut().insert(
            id,
            WatchEntry {
                fd,
                mask,
                callback,
                token,
            },
        );
        debug!("watching fd {} for {:?}", fd, mask);
        Ok(id)
    }

    fn update_fd_watch(&self, watch: WatchId, mask: WatchMask) -> BridgeResult<()> {
        let (fd, old_token, callback) = {
            let watches = self.watches.borrow();
            let entry = watches
                .get(&watch)
                .ok_or_else(|| BridgeError::violation(format!("update of removed watch {watch:?}")))?;
            if entry.mask == mask {
                return Ok(());
            }
            (entry.fd, entry.token, Rc::clone(&entry.callback))
        };

        self.handle.remove(old_token);
        let token = self.register_watch(fd, mask, callback)?;
        if let Some(entry) = self.watches.borrow_mut().get_mut(&watch) {
            entry.token = token;
            entry.mask = mask;
        }
        trace!("watch {:?} on fd {} now {:?}", watch, fd, mask);
        Ok(())
    }

    fn remove_watch(&self, watch: WatchId) {
        match self.watches.borrow_mut().remove(&watch) {
            Some(entry) => {
                self.handle.remove(entry.token);
                debug!("stopped watching fd {}", entry.fd);
            }
            None => warn!("remove of unknown watch {:?} ignored", watch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::EventLoop;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Counters {
        fired: u32,
        readable: u32,
    }

    fn dispatch_until(event_loop: &mut EventLoop<'static, Counters>, state: &mut Counters, done: impl Fn(&Counters) -> bool) {
        for _ in 0..50 {
            if done(state) {
                return;
            }
            event_loop
                .dispatch(Some(Duration::from_millis(10)), state)
                .unwrap();
        }
    }

    #[test]
    fn test_timer_is_one_shot() {
        let mut event_loop: EventLoop<'static, Counters> = EventLoop::try_new().unwrap();
        let core = CalloopCore::new(event_loop.handle());
        let timer = core.add_timer(Box::new(|c: &mut Counters| c.fired += 1)).unwrap();
        let mut state = Counters::default();

        core.start_timer(timer, 1).unwrap();
        assert!(core.is_armed(timer));
        dispatch_until(&mut event_loop, &mut state, |c| c.fired > 0);
        assert_eq!(state.fired, 1);
        assert!(!core.is_armed(timer));

        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut state)
            .unwrap();
        assert_eq!(state.fired, 1);

        core.start_timer(timer, 1).unwrap();
        dispatch_until(&mut event_loop, &mut state, |c| c.fired > 1);
        assert_eq!(state.fired, 2);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mut event_loop: EventLoop<'static, Counters> = EventLoop::try_new().unwrap();
        let core = CalloopCore::new(event_loop.handle());
        let timer = core.add_timer(Box::new(|c: &mut Counters| c.fired += 1)).unwrap();
        let mut state = Counters::default();

        core.start_timer(timer, 1).unwrap();
        core.cancel_timer(timer);
        std::thread::sleep(Duration::from_millis(5));
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut state)
            .unwrap();
        assert_eq!(state.fired, 0);

        core.remove_timer(timer);
        assert_eq!(core.timer_count(), 0);
        assert!(core.start_timer(timer, 1).unwrap_err().is_fatal());
    }

    #[test]
    fn test_fd_watch_reports_readable() {
        let mut event_loop: EventLoop<'static, Counters> = EventLoop::try_new().unwrap();
        let core = CalloopCore::new(event_loop.handle());
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let mut state = Counters::default();

        let watch = core
            .add_fd_watch(
                rx.as_raw_fd(),
                WatchMask::READABLE,
                Box::new(|_fd, mask, c: &mut Counters| {
                    if mask.readable {
                        c.readable += 1;
                    }
                }),
            )
            .unwrap();

        tx.write_all(b"x").unwrap();
        dispatch_until(&mut event_loop, &mut state, |c| c.readable > 0);
        assert!(state.readable > 0);

        core.update_fd_watch(watch, WatchMask::NONE).unwrap();
        let before = state.readable;
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut state)
            .unwrap();
        assert_eq!(state.readable, before);

        core.remove_watch(watch);
        assert_eq!(core.watch_count(), 0);
        assert!(core.update_fd_watch(watch, WatchMask::READABLE).is_err());
    }
}
