use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::config::Config;
use crate::current_thread;
use crate::error::Error;
use crate::poller::{self, Poller};
use crate::time::Timestamp;
use crate::timer::{TimerEntry, TimerId, next_sequence};
use crate::timer_queue::{self, TimerQueue};

/// A nullary callable queued for execution on a specific loop's thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

static IGNORE_SIGPIPE: Once = Once::new();

fn create_event_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn read_wakeup_fd(wakeup_fd: RawFd) {
    let mut one: u64 = 0;
    let n = unsafe { libc::read(wakeup_fd, &mut one as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        tracing::error!("wakeup read returned {n} bytes instead of 8");
    }
}

/// State shared between a loop and its cross-thread handles.
///
/// The flags are written by the loop thread and read by others for wakeup
/// decisions and diagnostics; relaxed ordering suffices because the wakeup
/// eventfd provides the real synchronization edge.
pub(crate) struct LoopShared {
    wakeup_fd: RawFd,
    thread_id: libc::pid_t,
    quit: AtomicBool,
    looping: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_tasks: AtomicBool,
    iteration: AtomicU64,
    pending_tasks: Mutex<Vec<Task>>,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        current_thread::tid() == self.thread_id
    }

    /// Write 8 bytes to the eventfd so a blocked demultiplexer wait returns.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            tracing::error!("wakeup write returned {n} bytes instead of 8");
        }
    }

    fn queue(&self, task: Task) {
        self.pending_tasks.lock().push(task);
        // Waking while the task phase runs is what keeps a task queued by
        // another task from waiting out the next poll timeout.
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Relaxed) {
            self.wakeup();
        }
    }

    fn run_or_queue(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue(Box::new(f));
        }
    }

    fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn queue_size(&self) -> usize {
        self.pending_tasks.lock().len()
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

/// Cross-thread reference to an event loop.
///
/// This is the entire thread-safe surface: queueing work, adding and
/// cancelling timers, and quitting. Handles may outlive the loop itself, in
/// which case queued work is discarded, never run.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .finish()
    }
}

impl LoopHandle {
    /// Run `f` on the loop's thread: immediately when called from that
    /// thread, otherwise via [`queue_in_loop`](Self::queue_in_loop).
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.run_or_queue(f);
    }

    /// Queue `f` for the loop's task phase and wake the loop if needed.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(f));
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.shared.queue_size()
    }

    /// Ask the loop to exit. Best-effort: an iteration already dispatching
    /// callbacks or tasks finishes them first.
    pub fn quit(&self) {
        self.shared.request_quit();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Run `callback` at `when`. Returns the timer id without waiting for
    /// the loop to pick the timer up.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(when, Duration::ZERO, callback)
    }

    /// Run `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timestamp::now() + delay, Duration::ZERO, callback)
    }

    /// Run `callback` every `interval`, starting one interval from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        assert!(!interval.is_zero(), "run_every needs a non-zero interval");
        self.add_timer(Timestamp::now() + interval, interval, callback)
    }

    /// Cancel a timer. Safe from any thread and from inside any callback,
    /// including the timer's own.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            let lp = EventLoop::current().expect("timer task ran outside its event loop");
            lp.timer_queue().cancel_in_loop(&lp, id);
        });
    }

    pub(crate) fn add_timer(
        &self,
        when: Timestamp,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let sequence = next_sequence();
        let entry = TimerEntry::new(sequence, callback, when, interval);
        self.run_in_loop(move || {
            let lp = EventLoop::current().expect("timer task ran outside its event loop");
            lp.timer_queue().add_in_loop(&lp, entry);
        });
        TimerId { sequence }
    }
}

/// Reactor; at most one per thread.
///
/// The loop is created on, and confined to, one thread. Every mutating call
/// asserts the caller is that thread; the only exceptions are the methods
/// mirrored on [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
    timer_queue: TimerQueue,
    wakeup_channel: Rc<Channel>,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    current_active_fd: Cell<Option<RawFd>>,
    poll_return_time: Cell<Timestamp>,
    poll_timeout_ms: i32,
}

impl EventLoop {
    pub fn new() -> Result<Rc<EventLoop>, Error> {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Result<Rc<EventLoop>, Error> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        let thread_id = current_thread::tid();
        CURRENT_LOOP.with(|current| {
            if let Some(existing) = current.borrow().upgrade() {
                panic!(
                    "another EventLoop (thread {}) already exists in thread {thread_id}",
                    existing.shared.thread_id
                );
            }
        });

        let poller = poller::new_default(config).map_err(Error::PollerSetup)?;
        let wakeup_fd = create_event_fd().map_err(Error::WakeupSetup)?;
        let timer_fd = match timer_queue::create_timer_fd() {
            Ok(fd) => fd,
            Err(e) => {
                unsafe {
                    libc::close(wakeup_fd);
                }
                return Err(Error::TimerSetup(e));
            }
        };

        let event_loop = Rc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            shared: Arc::new(LoopShared {
                wakeup_fd,
                thread_id,
                quit: AtomicBool::new(false),
                looping: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
                iteration: AtomicU64::new(0),
                pending_tasks: Mutex::new(Vec::new()),
            }),
            poller: RefCell::new(poller),
            timer_queue: TimerQueue::with_fd(weak.clone(), timer_fd),
            wakeup_channel: Channel::with_owner(weak.clone(), wakeup_fd),
            active_channels: RefCell::new(Vec::new()),
            current_active_fd: Cell::new(None),
            poll_return_time: Cell::new(Timestamp::invalid()),
            poll_timeout_ms: config.poll_timeout_ms,
        });

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Rc::downgrade(&event_loop));

        event_loop
            .wakeup_channel
            .set_read_callback(move |_| read_wakeup_fd(wakeup_fd));
        event_loop.wakeup_channel.enable_reading();
        event_loop.timer_queue.install(&event_loop);

        tracing::debug!(thread_id, "event loop created");
        Ok(event_loop)
    }

    /// The event loop of the calling thread, if one exists.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    /// A cloneable cross-thread reference to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the reactor until [`quit`](Self::quit). Must be called on the
    /// owning thread. A quit requested before `run` is honored: the loop
    /// exits after at most one iteration.
    pub fn run(&self) {
        assert!(
            !self.shared.looping.load(Ordering::Relaxed),
            "event loop is already running"
        );
        self.assert_in_loop_thread();
        self.shared.looping.store(true, Ordering::Relaxed);
        tracing::trace!("event loop start looping");

        while !self.shared.quit.load(Ordering::Relaxed) {
            let poll_return = {
                let mut active = self.active_channels.borrow_mut();
                active.clear();
                self.poller
                    .borrow_mut()
                    .poll(self.poll_timeout_ms, &mut active)
            };
            self.poll_return_time.set(poll_return);
            self.shared.iteration.fetch_add(1, Ordering::Relaxed);
            if tracing::enabled!(tracing::Level::TRACE) {
                for channel in self.active_channels.borrow().iter() {
                    tracing::trace!("{{{}: {}}}", channel.fd(), channel.ready());
                }
            }

            self.shared.event_handling.store(true, Ordering::Relaxed);
            let count = self.active_channels.borrow().len();
            for i in 0..count {
                let channel = self.active_channels.borrow()[i].clone();
                self.current_active_fd.set(Some(channel.fd()));
                channel.handle_event(poll_return);
            }
            self.current_active_fd.set(None);
            self.shared.event_handling.store(false, Ordering::Relaxed);

            self.run_pending_tasks();
        }

        tracing::trace!("event loop stop looping");
        self.shared.looping.store(false, Ordering::Relaxed);
    }

    fn run_pending_tasks(&self) {
        self.shared
            .calling_pending_tasks
            .store(true, Ordering::Relaxed);
        // Swap the queue out under the lock so tasks can re-enqueue without
        // deadlocking and the critical section stays tiny.
        let tasks = mem::take(&mut *self.shared.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.shared
            .calling_pending_tasks
            .store(false, Ordering::Relaxed);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.shared.request_quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.run_or_queue(f);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(f));
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue_size()
    }

    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_at(when, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_after(delay, callback)
    }

    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.handle().run_every(interval, callback)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timer_queue
    }

    #[cfg(test)]
    pub(crate) fn add_timer(
        &self,
        when: Timestamp,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.handle().add_timer(when, interval, callback)
    }

    pub fn update_channel(&self, channel: &Rc<Channel>) {
        assert!(channel.is_owned_by(self));
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        assert!(channel.is_owned_by(self));
        self.assert_in_loop_thread();
        if self.shared.event_handling.load(Ordering::Relaxed) {
            let in_active = self
                .active_channels
                .borrow()
                .iter()
                .any(|c| std::ptr::eq(Rc::as_ptr(c), channel));
            assert!(
                self.current_active_fd.get() == Some(channel.fd()) || !in_active,
                "removing a sibling active channel mid-dispatch"
            );
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        assert!(channel.is_owned_by(self));
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {} was used from thread {}",
                self.shared.thread_id,
                current_thread::tid()
            );
        }
    }

    pub fn event_handling(&self) -> bool {
        self.shared.event_handling.load(Ordering::Relaxed)
    }

    /// Number of completed demultiplexer waits.
    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Timestamp of the latest demultiplexer return, usually meaning data
    /// arrival.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        tracing::debug!(
            thread_id = self.shared.thread_id,
            "event loop destructs in thread {}",
            current_thread::tid()
        );
        // Detach the internal channels; their fds close with LoopShared and
        // TimerQueue.
        let internal = [self.wakeup_channel.clone(), self.timer_queue.channel().clone()];
        for channel in internal {
            channel.clear_interest();
            let mut poller = self.poller.borrow_mut();
            poller.update_channel(&channel);
            poller.remove_channel(&channel);
            channel.set_added_to_loop(false);
        }
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Weak::new());
    }
}
