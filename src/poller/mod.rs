//! Readiness demultiplexing backends.
//!
//! A poller is bound to exactly one event loop and is only ever operated
//! from that loop's thread; the loop enforces the affinity before
//! delegating, so the backends themselves stay lock-free and assertion
//! driven.

mod epoll;
mod poll;

use std::io;
use std::rc::Rc;

use crate::channel::Channel;
use crate::config::{Config, PollerBackend};
use crate::time::Timestamp;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

pub(crate) trait Poller {
    /// Block up to `timeout_ms` for readiness. Every channel with non-empty
    /// readiness is appended to `active` after its ready mask is updated.
    /// Returns the timestamp taken right after the wait returned. A timeout
    /// with zero readiness is not an error, and neither is EINTR.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp;

    /// (Re)register the channel's current interest. A channel whose interest
    /// became empty stays known to the backend in a disabled state so that a
    /// later `remove_channel` is O(1).
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Drop the channel's slot. The channel must already be disabled.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_default(config: &Config) -> io::Result<Box<dyn Poller>> {
    match config.resolved_backend() {
        PollerBackend::Poll => Ok(Box::new(PollPoller::new())),
        PollerBackend::Epoll => Ok(Box::new(EpollPoller::new(config.epoll_initial_events)?)),
    }
}
