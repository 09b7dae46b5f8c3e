use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::channel::{Channel, INDEX_UNREGISTERED, Interest, Ready};
use crate::poller::Poller;
use crate::time::Timestamp;

// Registration states stored in the channel's index slot.
const STATE_NEW: i32 = INDEX_UNREGISTERED;
const STATE_ADDED: i32 = 1;
const STATE_DISABLED: i32 = 2;

const MAX_EVENT_LIST: usize = 4096;

/// epoll(7) backend.
///
/// The channel index encodes a three-state registration machine: never
/// added, added and enabled in the kernel, or known but disabled (removed
/// from the kernel, kept in the fd map so re-enabling is cheap). A channel
/// is registered in the kernel iff its state is `STATE_ADDED`.
pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

fn interest_to_events(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.contains(Interest::READABLE) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::PRIORITY) {
        events |= libc::EPOLLPRI as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn ready_from_events(events: u32) -> Ready {
    let mut ready = Ready::empty();
    for (bit, flag) in [
        (libc::EPOLLIN as u32, Ready::READABLE),
        (libc::EPOLLPRI as u32, Ready::PRIORITY),
        (libc::EPOLLOUT as u32, Ready::WRITABLE),
        (libc::EPOLLHUP as u32, Ready::HANGUP),
        (libc::EPOLLERR as u32, Ready::ERROR),
        (libc::EPOLLRDHUP as u32, Ready::PEER_SHUTDOWN),
    ] {
        if events & bit != 0 {
            ready |= flag;
        }
    }
    ready
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "???",
    }
}

impl EpollPoller {
    pub(crate) fn new(initial_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![empty_event(); initial_events.max(1)],
            channels: HashMap::new(),
        })
    }

    fn fill_active(&self, num_events: usize, active: &mut Vec<Rc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for event in &self.events[..num_events] {
            let fd = event.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("epoll event for unknown channel");
            debug_assert_eq!(channel.fd(), fd);
            channel.set_ready(ready_from_events(event.events));
            active.push(channel.clone());
        }
    }

    fn control(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_events(channel.interest()),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                tracing::error!(fd, "epoll_ctl DEL failed: {err}");
            } else {
                // The kernel disagreeing about a tracked fd means the
                // registry is corrupt; continuing would dispatch to stale
                // channels.
                panic!("epoll_ctl {} fd={fd} failed: {err}", op_name(op));
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved_errno = io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            tracing::trace!("{num_events} events happened");
            self.fill_active(num_events as usize, active);
            if num_events as usize == self.events.len() && self.events.len() < MAX_EVENT_LIST {
                let doubled = self.events.len() * 2;
                self.events.resize(doubled, empty_event());
            }
        } else if num_events == 0 {
            tracing::trace!("nothing happened");
        } else if saved_errno.raw_os_error() != Some(libc::EINTR) {
            tracing::error!("epoll_wait failed: {saved_errno}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        let state = channel.index();
        tracing::trace!(fd, state, interest = ?channel.interest(), "update channel");

        if state == STATE_NEW || state == STATE_DISABLED {
            if state == STATE_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self.has_channel(channel));
            }
            channel.set_index(STATE_ADDED);
            self.control(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.has_channel(channel));
            assert_eq!(state, STATE_ADDED);
            if channel.is_none_interest() {
                self.control(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DISABLED);
            } else {
                self.control(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        tracing::trace!(fd, "remove channel");
        assert!(self.has_channel(channel));
        assert!(channel.is_none_interest());
        let state = channel.index();
        assert!(state == STATE_ADDED || state == STATE_DISABLED);

        self.channels.remove(&fd);
        if state == STATE_ADDED {
            self.control(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(registered) => std::ptr::eq(Rc::as_ptr(registered), channel),
            None => false,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
