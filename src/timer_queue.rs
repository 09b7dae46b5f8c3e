//! Timer service driven by a single timerfd.
//!
//! The timerfd is registered as an ordinary channel on the owning loop and
//! is always armed to the earliest active expiry; periodicity is handled
//! here, not by the kernel (the timerfd interval stays zero).

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;
use crate::timer::{TimerEntry, TimerId};

/// Expiries closer than this are pushed out to avoid arming the timerfd in
/// the past.
const MIN_ARM_MICROS: i64 = 100;

pub(crate) fn create_timer_fd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn read_timer_fd(timer_fd: RawFd, now: Timestamp) {
    let mut how_many: u64 = 0;
    let n = unsafe { libc::read(timer_fd, &mut how_many as *mut u64 as *mut libc::c_void, 8) };
    tracing::trace!("timer queue fired {how_many} at {now}");
    if n != 8 {
        tracing::error!("timerfd read returned {n} bytes instead of 8");
    }
}

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    channel: Rc<Channel>,
    /// Ordered by (expiry, sequence): "what expires next".
    timers: RefCell<BTreeMap<(Timestamp, u64), TimerEntry>>,
    /// Ordered by sequence: cancellation lookup. Always the same size as
    /// `timers`.
    active: RefCell<BTreeMap<u64, Timestamp>>,
    calling_expired: Cell<bool>,
    /// Timers cancelled from inside their own expiry batch.
    cancelling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn with_fd(owner: Weak<EventLoop>, timer_fd: RawFd) -> TimerQueue {
        TimerQueue {
            timer_fd,
            channel: Channel::with_owner(owner, timer_fd),
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(BTreeMap::new()),
            calling_expired: Cell::new(false),
            cancelling: RefCell::new(HashSet::new()),
        }
    }

    /// Hook the timerfd channel up to the (now fully constructed) loop.
    pub(crate) fn install(&self, event_loop: &Rc<EventLoop>) {
        let weak = Rc::downgrade(event_loop);
        self.channel.set_read_callback(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.timer_queue().handle_read(&lp);
            }
        });
        self.channel.enable_reading();
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    pub(crate) fn add_in_loop(&self, event_loop: &EventLoop, entry: TimerEntry) {
        event_loop.assert_in_loop_thread();
        let expiry = entry.expiry();
        if self.insert(entry) {
            self.rearm(expiry);
        }
    }

    pub(crate) fn cancel_in_loop(&self, event_loop: &EventLoop, id: TimerId) {
        event_loop.assert_in_loop_thread();
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        assert_eq!(timers.len(), active.len());

        if let Some(expiry) = active.remove(&id.sequence) {
            let removed = timers.remove(&(expiry, id.sequence));
            assert!(removed.is_some());
        } else if self.calling_expired.get() {
            // Cancelled from inside its own expiry batch (itself or a
            // sibling); keep it from being re-armed by the reset step.
            self.cancelling.borrow_mut().insert(id.sequence);
        }
        assert_eq!(timers.len(), active.len());
    }

    /// Read callback of the timerfd channel.
    pub(crate) fn handle_read(&self, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        let now = Timestamp::now();
        read_timer_fd(self.timer_fd, now);

        let mut expired = self.take_expired(now);

        self.calling_expired.set(true);
        self.cancelling.borrow_mut().clear();
        // No internal borrow is held here: callbacks may add or cancel
        // timers freely.
        for entry in expired.iter_mut() {
            entry.run();
        }
        self.calling_expired.set(false);

        self.reset(expired, now);
    }

    /// True if the inserted timer is now the earliest.
    fn insert(&self, entry: TimerEntry) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        assert_eq!(timers.len(), active.len());

        let expiry = entry.expiry();
        let sequence = entry.sequence();
        let earliest_changed = timers
            .first_key_value()
            .is_none_or(|((first, _), _)| expiry < *first);

        let prev = timers.insert((expiry, sequence), entry);
        assert!(prev.is_none());
        let prev = active.insert(sequence, expiry);
        assert!(prev.is_none());

        assert_eq!(timers.len(), active.len());
        earliest_changed
    }

    /// Remove and return every entry with expiry <= now, in expiry order.
    fn take_expired(&self, now: Timestamp) -> Vec<TimerEntry> {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        assert_eq!(timers.len(), active.len());

        let remaining = timers.split_off(&(now, u64::MAX));
        let expired_map = std::mem::replace(&mut *timers, remaining);
        let expired: Vec<TimerEntry> = expired_map.into_values().collect();
        for entry in &expired {
            let removed = active.remove(&entry.sequence());
            assert!(removed.is_some());
        }

        assert_eq!(timers.len(), active.len());
        expired
    }

    /// Re-arm periodic timers that were not cancelled mid-batch, then point
    /// the timerfd at the new earliest expiry.
    fn reset(&self, expired: Vec<TimerEntry>, now: Timestamp) {
        for mut entry in expired {
            if entry.repeat() && !self.cancelling.borrow().contains(&entry.sequence()) {
                entry.restart(now);
                self.insert(entry);
            }
        }

        let next_expiry = self
            .timers
            .borrow()
            .first_key_value()
            .map(|((expiry, _), _)| *expiry);
        if let Some(expiry) = next_expiry {
            self.rearm(expiry);
        }
    }

    fn rearm(&self, expiry: Timestamp) {
        let mut micros = Timestamp::now().micros_until(expiry);
        if micros < MIN_ARM_MICROS {
            micros = MIN_ARM_MICROS;
        }
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: micros / 1_000_000,
                tv_nsec: (micros % 1_000_000) * 1_000,
            },
        };
        let rc =
            unsafe { libc::timerfd_settime(self.timer_fd, 0, &new_value, std::ptr::null_mut()) };
        if rc != 0 {
            tracing::error!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let timers = self.timers.borrow();
        let active = self.active.borrow();
        assert_eq!(timers.len(), active.len());
        timers.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // Expiry dispatch is exercised by calling the timerfd read callback
    // directly with already-due timers, so none of these tests need a
    // running loop.

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[test]
    fn one_shot_fires_once_and_empties_the_queue() {
        let lp = EventLoop::new().unwrap();
        let count = counter();
        let c = count.clone();
        lp.run_at(Timestamp::now(), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(lp.timer_queue().len(), 1);

        lp.timer_queue().handle_read(&lp);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(lp.timer_queue().len(), 0);

        // A second expiry pass finds nothing.
        lp.timer_queue().handle_read(&lp);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_timer_is_rearmed() {
        let lp = EventLoop::new().unwrap();
        let count = counter();
        let c = count.clone();
        lp.add_timer(Timestamp::now(), Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });

        lp.timer_queue().handle_read(&lp);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(lp.timer_queue().len(), 1);
    }

    #[test]
    fn cancel_before_expiry_removes_both_entries() {
        let lp = EventLoop::new().unwrap();
        let count = counter();
        let c = count.clone();
        let id = lp.run_at(Timestamp::now() + Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(lp.timer_queue().len(), 1);

        lp.cancel(id);
        assert_eq!(lp.timer_queue().len(), 0);

        lp.timer_queue().handle_read(&lp);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_after_fire_is_a_no_op() {
        let lp = EventLoop::new().unwrap();
        let id = lp.run_at(Timestamp::now(), || {});
        lp.timer_queue().handle_read(&lp);
        assert_eq!(lp.timer_queue().len(), 0);
        lp.cancel(id);
        assert_eq!(lp.timer_queue().len(), 0);
    }

    #[test]
    fn periodic_timer_cancelled_from_its_own_callback_is_not_rearmed() {
        let lp = EventLoop::new().unwrap();
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let count = counter();
        let c = count.clone();

        let handle = lp.handle();
        let slot = id_slot.clone();
        let id = lp.add_timer(Timestamp::now(), Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::Relaxed);
            // Cancel ourselves from inside our own expiry batch.
            handle.cancel(slot.lock().unwrap().expect("id published before fire"));
        });
        *id_slot.lock().unwrap() = Some(id);

        lp.timer_queue().handle_read(&lp);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(lp.timer_queue().len(), 0);
    }

    #[test]
    fn timer_added_from_a_callback_lands_in_the_queue() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        lp.run_at(Timestamp::now(), move || {
            handle.run_after(Duration::from_secs(60), || {});
        });

        lp.timer_queue().handle_read(&lp);
        assert_eq!(lp.timer_queue().len(), 1);
    }
}
