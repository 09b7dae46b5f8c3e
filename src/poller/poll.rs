use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::channel::{Channel, INDEX_UNREGISTERED, Interest, Ready};
use crate::poller::Poller;
use crate::time::Timestamp;

/// poll(2) backend: a flat pollfd array plus an fd→channel map.
///
/// A channel's registration index is its slot in the array. Disabled
/// channels stay in the array with the fd stored as `-fd - 1`, which
/// poll(2) ignores, so disabling and removal never shift other slots.
pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

fn interest_to_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::PRIORITY) {
        events |= libc::POLLPRI;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn ready_from_revents(revents: libc::c_short) -> Ready {
    let mut ready = Ready::empty();
    for (bit, flag) in [
        (libc::POLLIN, Ready::READABLE),
        (libc::POLLPRI, Ready::PRIORITY),
        (libc::POLLOUT, Ready::WRITABLE),
        (libc::POLLHUP, Ready::HANGUP),
        (libc::POLLERR, Ready::ERROR),
        (libc::POLLNVAL, Ready::INVALID),
        (libc::POLLRDHUP, Ready::PEER_SHUTDOWN),
    ] {
        if revents & bit != 0 {
            ready |= flag;
        }
    }
    ready
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, mut num_events: i32, active: &mut Vec<Rc<Channel>>) {
        for pfd in &self.pollfds {
            if num_events == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            num_events -= 1;
            let channel = self
                .channels
                .get(&pfd.fd)
                .expect("pollfd with readiness has no channel");
            debug_assert_eq!(channel.fd(), pfd.fd);
            channel.set_ready(ready_from_revents(pfd.revents));
            active.push(channel.clone());
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved_errno = io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            tracing::trace!("{num_events} events happened");
            self.fill_active(num_events, active);
        } else if num_events == 0 {
            tracing::trace!("nothing happened");
        } else if saved_errno.raw_os_error() != Some(libc::EINTR) {
            tracing::error!("poll(2) failed: {saved_errno}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        tracing::trace!(fd, interest = ?channel.interest(), "update channel");

        if channel.index() < 0 {
            // New registration: append a slot.
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: interest_to_events(channel.interest()),
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            assert!(self.has_channel(channel));
            let index = channel.index() as usize;
            assert!(index < self.pollfds.len());
            let pfd = &mut self.pollfds[index];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = interest_to_events(channel.interest());
            pfd.revents = 0;
            if channel.is_none_interest() {
                // Disabled but still registered: poll(2) skips negative fds.
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        tracing::trace!(fd, "remove channel");
        assert!(self.has_channel(channel));
        assert!(channel.is_none_interest());

        let index = channel.index() as usize;
        assert!(index < self.pollfds.len());
        let pfd = &self.pollfds[index];
        assert!(pfd.fd == -fd - 1 && pfd.events == interest_to_events(channel.interest()));

        self.channels.remove(&fd);
        self.pollfds.swap_remove(index);
        if index < self.pollfds.len() {
            // The former last slot moved into `index`; patch its channel.
            let mut displaced_fd = self.pollfds[index].fd;
            if displaced_fd < 0 {
                displaced_fd = -displaced_fd - 1;
            }
            self.channels
                .get(&displaced_fd)
                .expect("displaced pollfd has no channel")
                .set_index(index as i32);
        }
        channel.set_index(INDEX_UNREGISTERED);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(registered) => std::ptr::eq(Rc::as_ptr(registered), channel),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;

    fn channel(fd: RawFd) -> Rc<Channel> {
        Channel::with_owner(Weak::new(), fd)
    }

    // Drive interest directly; Channel::enable_reading would go through an
    // owning loop these tests do not have.
    fn enable_reading_registered(poller: &mut PollPoller, ch: &Rc<Channel>) {
        ch.set_interest(Interest::READABLE | Interest::PRIORITY);
        poller.update_channel(ch);
    }

    #[test]
    fn register_update_disable_remove() {
        let mut poller = PollPoller::new();
        let ch = channel(100);
        enable_reading_registered(&mut poller, &ch);

        assert_eq!(ch.index(), 0);
        assert!(poller.has_channel(&ch));
        assert_eq!(poller.pollfds[0].fd, 100);
        assert_eq!(poller.pollfds[0].events, libc::POLLIN | libc::POLLPRI);

        // Disabled: fd flips to -fd-1 but the slot stays.
        ch.clear_interest();
        poller.update_channel(&ch);
        assert_eq!(poller.pollfds[0].fd, -101);
        assert!(poller.has_channel(&ch));

        poller.remove_channel(&ch);
        assert!(!poller.has_channel(&ch));
        assert!(poller.pollfds.is_empty());
        assert_eq!(ch.index(), INDEX_UNREGISTERED);
    }

    #[test]
    fn swap_and_pop_patches_displaced_index() {
        let mut poller = PollPoller::new();
        let a = channel(10);
        let b = channel(11);
        let c = channel(12);
        for ch in [&a, &b, &c] {
            enable_reading_registered(&mut poller, ch);
        }
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        // Remove the first: the last slot swaps into its place.
        a.clear_interest();
        poller.update_channel(&a);
        poller.remove_channel(&a);

        assert_eq!(c.index(), 0);
        assert_eq!(b.index(), 1);
        assert!(poller.has_channel(&b));
        assert!(poller.has_channel(&c));
        assert_eq!(poller.pollfds.len(), 2);
    }

    #[test]
    fn swap_and_pop_patches_displaced_disabled_slot() {
        let mut poller = PollPoller::new();
        let a = channel(20);
        let b = channel(21);
        enable_reading_registered(&mut poller, &a);
        enable_reading_registered(&mut poller, &b);

        // Disable b (last slot) so it is stored as a negative fd, then
        // remove a and verify b's index is still patched.
        b.clear_interest();
        poller.update_channel(&b);
        a.clear_interest();
        poller.update_channel(&a);
        poller.remove_channel(&a);

        assert_eq!(b.index(), 0);
        assert_eq!(poller.pollfds[0].fd, -22);
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut poller = PollPoller::new();
        let ch = channel(read_fd);
        enable_reading_registered(&mut poller, &ch);

        let mut active = Vec::new();
        let ts = poller.poll(0, &mut active);
        assert!(ts.is_valid());
        assert!(active.is_empty());

        let n = unsafe { libc::write(write_fd, b"hi".as_ptr().cast(), 2) };
        assert_eq!(n, 2);

        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);
        assert!(active[0].ready().contains(Ready::READABLE));

        ch.clear_interest();
        poller.update_channel(&ch);
        poller.remove_channel(&ch);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn mask_conversions() {
        assert_eq!(
            interest_to_events(Interest::READABLE | Interest::WRITABLE),
            libc::POLLIN | libc::POLLOUT
        );
        let ready = ready_from_revents(libc::POLLIN | libc::POLLHUP | libc::POLLERR);
        assert_eq!(ready, Ready::READABLE | Ready::HANGUP | Ready::ERROR);
    }
}
