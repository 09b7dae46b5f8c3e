use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Weak as SyncWeak};

use crate::event_loop::EventLoop;
use crate::time::Timestamp;

bitflags::bitflags! {
    /// I/O events a channel asks the demultiplexer to watch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u32 {
        const READABLE = 1 << 0;
        const PRIORITY = 1 << 1;
        const WRITABLE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Readiness delivered by the demultiplexer. Includes conditions the
    /// kernel reports even when they were never requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ready: u32 {
        const READABLE = 1 << 0;
        const PRIORITY = 1 << 1;
        const WRITABLE = 1 << 2;
        const HANGUP = 1 << 3;
        const ERROR = 1 << 4;
        /// The fd was not open (poll backend only).
        const INVALID = 1 << 5;
        /// The peer shut down its write half.
        const PEER_SHUTDOWN = 1 << 6;
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, flag) in [
            ("IN ", Ready::READABLE),
            ("PRI ", Ready::PRIORITY),
            ("OUT ", Ready::WRITABLE),
            ("HUP ", Ready::HANGUP),
            ("ERR ", Ready::ERROR),
            ("NVAL ", Ready::INVALID),
            ("RDHUP ", Ready::PEER_SHUTDOWN),
        ] {
            if self.contains(flag) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// Read callbacks receive the timestamp of the demultiplexer return that
/// produced the event.
pub type ReadCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

/// Registration slot meaning "never handed to a demultiplexer".
pub(crate) const INDEX_UNREGISTERED: i32 = -1;

/// Binding of one file descriptor to one logical event sink.
///
/// A channel never owns or closes its fd. It belongs to exactly one
/// [`EventLoop`] and, apart from construction and the cross-thread-safe
/// surface of the loop itself, must only be touched from that loop's
/// thread.
pub struct Channel {
    fd: RawFd,
    owner: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    interest: Cell<Interest>,
    ready: Cell<Ready>,
    /// Demultiplexer bookkeeping: an array slot for the poll backend, a
    /// registration state for the epoll backend.
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tie: RefCell<Option<SyncWeak<dyn Any + Send + Sync>>>,
    handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    /// Create a channel on `fd` owned by `event_loop`.
    ///
    /// Set callbacks before the first `enable_*` call registers the channel.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Self::with_owner(Rc::downgrade(event_loop), fd)
    }

    pub(crate) fn with_owner(owner: Weak<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|self_weak| Channel {
            fd,
            owner,
            self_weak: self_weak.clone(),
            interest: Cell::new(Interest::empty()),
            ready: Cell::new(Ready::empty()),
            index: Cell::new(INDEX_UNREGISTERED),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(Interest::READABLE)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(Interest::WRITABLE)
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.ready.set(ready);
    }

    pub(crate) fn ready(&self) -> Ready {
        self.ready.get()
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    pub(crate) fn set_added_to_loop(&self, added: bool) {
        self.added_to_loop.set(added);
    }

    pub(crate) fn clear_interest(&self) {
        self.interest.set(Interest::empty());
    }

    #[cfg(test)]
    pub(crate) fn set_interest(&self, interest: Interest) {
        self.interest.set(interest);
    }

    pub(crate) fn is_owned_by(&self, event_loop: &EventLoop) -> bool {
        std::ptr::eq(self.owner.as_ptr(), event_loop)
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Tie this channel to its owning object.
    ///
    /// Dispatch upgrades the weak reference first and holds the strong
    /// reference for the whole callback batch, so the owner cannot be torn
    /// down mid-callback. If the owner is already gone the batch is skipped.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: SyncWeak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.borrow_mut() = Some(weak);
    }

    /// Suppress the hangup warning for channels where POLLHUP is routine.
    pub fn do_not_log_hup(&self) {
        self.log_hup.set(false);
    }

    pub fn enable_reading(&self) {
        self.interest
            .set(self.interest.get() | Interest::READABLE | Interest::PRIORITY);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.interest
            .set(self.interest.get() - (Interest::READABLE | Interest::PRIORITY));
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest.set(self.interest.get() | Interest::WRITABLE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest.set(self.interest.get() - Interest::WRITABLE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.set(Interest::empty());
        self.update();
    }

    fn update(&self) {
        self.added_to_loop.set(true);
        let this = self.self_weak.upgrade().expect("channel is not Rc-backed");
        self.owner_loop().update_channel(&this);
    }

    /// Unregister from the owning loop. The channel must already have all
    /// interest disabled.
    pub fn remove(&self) {
        assert!(self.is_none_interest(), "removing channel with live interest");
        self.added_to_loop.set(false);
        self.owner_loop().remove_channel(self);
    }

    fn owner_loop(&self) -> Rc<EventLoop> {
        self.owner
            .upgrade()
            .expect("channel used after its event loop was destroyed")
    }

    /// Dispatch the most recently delivered readiness to the callbacks.
    ///
    /// Called by the owning loop with the timestamp of the demultiplexer
    /// return for this iteration.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(weak) => {
                if let Some(_guard) = weak.upgrade() {
                    self.dispatch(receive_time);
                } else {
                    tracing::trace!(fd = self.fd, "tied owner gone, skipping dispatch");
                }
            }
            None => self.dispatch(receive_time),
        }
    }

    // The branch order is part of the contract: callbacks may change
    // interest or close the fd, and a half-close with pending data must
    // still reach the read branch.
    fn dispatch(&self, receive_time: Timestamp) {
        self.handling.set(true);
        let ready = self.ready.get();
        tracing::trace!(fd = self.fd, "handling {{{ready}}}");

        if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            if self.log_hup.get() {
                tracing::warn!(fd = self.fd, "channel received HUP");
            }
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if ready.contains(Ready::INVALID) {
            tracing::warn!(fd = self.fd, "channel fd is not open");
        }

        if ready.intersects(Ready::ERROR | Ready::INVALID)
            && let Some(cb) = self.error_callback.borrow_mut().as_mut()
        {
            cb();
        }

        if ready.intersects(Ready::READABLE | Ready::PRIORITY | Ready::PEER_SHUTDOWN)
            && let Some(cb) = self.read_callback.borrow_mut().as_mut()
        {
            cb(receive_time);
        }

        if ready.contains(Ready::WRITABLE)
            && let Some(cb) = self.write_callback.borrow_mut().as_mut()
        {
            cb();
        }

        self.handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(!self.handling.get(), "channel destroyed while handling");
        assert!(
            !self.added_to_loop.get(),
            "channel destroyed while still added to its loop"
        );
        if let Some(event_loop) = self.owner.upgrade()
            && event_loop.is_in_loop_thread()
        {
            assert!(!event_loop.has_channel(self));
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest.get())
            .field("ready", &self.ready.get())
            .field("index", &self.index.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn orphan_channel(fd: RawFd) -> Rc<Channel> {
        Channel::with_owner(Weak::new(), fd)
    }

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn dispatch_order_error_read_write() {
        let ch = orphan_channel(7);
        let log = recorder();
        let (l, l2, l3) = (log.clone(), log.clone(), log.clone());
        ch.set_error_callback(move || l.lock().unwrap().push("error"));
        ch.set_read_callback(move |_| l2.lock().unwrap().push("read"));
        ch.set_write_callback(move || l3.lock().unwrap().push("write"));

        ch.set_ready(Ready::ERROR | Ready::READABLE | Ready::WRITABLE);
        ch.handle_event(Timestamp::now());
        assert_eq!(*log.lock().unwrap(), vec!["error", "read", "write"]);
    }

    #[test]
    fn hangup_without_readable_fires_close() {
        let ch = orphan_channel(7);
        let log = recorder();
        let l = log.clone();
        ch.set_close_callback(move || l.lock().unwrap().push("close"));
        ch.set_ready(Ready::HANGUP);
        ch.handle_event(Timestamp::now());
        assert_eq!(*log.lock().unwrap(), vec!["close"]);
    }

    #[test]
    fn hangup_with_pending_data_drains_first() {
        let ch = orphan_channel(7);
        let log = recorder();
        let (l, l2) = (log.clone(), log.clone());
        ch.set_close_callback(move || l.lock().unwrap().push("close"));
        ch.set_read_callback(move |_| l2.lock().unwrap().push("read"));
        ch.set_ready(Ready::HANGUP | Ready::READABLE);
        ch.handle_event(Timestamp::now());
        // Close is suppressed so the readable branch can drain the data.
        assert_eq!(*log.lock().unwrap(), vec!["read"]);
    }

    #[test]
    fn peer_shutdown_reaches_read_callback() {
        let ch = orphan_channel(7);
        let log = recorder();
        let l = log.clone();
        ch.set_read_callback(move |_| l.lock().unwrap().push("read"));
        ch.set_ready(Ready::PEER_SHUTDOWN);
        ch.handle_event(Timestamp::now());
        assert_eq!(*log.lock().unwrap(), vec!["read"]);
    }

    #[test]
    fn unset_callback_slots_are_skipped() {
        let ch = orphan_channel(7);
        ch.set_ready(Ready::READABLE | Ready::WRITABLE | Ready::ERROR);
        ch.handle_event(Timestamp::now());
    }

    #[test]
    fn tied_channel_skips_dispatch_after_owner_drop() {
        let ch = orphan_channel(7);
        let log = recorder();
        let l = log.clone();
        ch.set_read_callback(move |_| l.lock().unwrap().push("read"));

        let owner = Arc::new(42u32);
        ch.tie(&owner);
        ch.set_ready(Ready::READABLE);
        ch.handle_event(Timestamp::now());
        assert_eq!(*log.lock().unwrap(), vec!["read"]);

        drop(owner);
        ch.handle_event(Timestamp::now());
        assert_eq!(*log.lock().unwrap(), vec!["read"]);
    }

    #[test]
    fn interest_helpers() {
        let ch = orphan_channel(3);
        assert!(ch.is_none_interest());
        assert!(!ch.is_reading());
        assert!(!ch.is_writing());
        assert_eq!(ch.index(), INDEX_UNREGISTERED);
    }

    #[test]
    fn ready_display_names_flags() {
        let ready = Ready::READABLE | Ready::HANGUP;
        assert_eq!(ready.to_string(), "IN HUP ");
    }
}
