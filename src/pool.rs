//! Worker loop threads and the fixed loop pool.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Invoked with each freshly constructed worker loop before it starts
/// running (and with the base loop when the pool has no workers).
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

type StartupSlot = Arc<(Mutex<Option<Result<LoopHandle, Error>>>, Condvar)>;

/// A thread running one event loop on its stack.
///
/// Dropping the thread asks the loop to quit and joins. There is a narrow
/// race if the loop's stack frame exits between the quit signal and the
/// join; shutdown implies process exit, so it is accepted.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn a thread named `name` and run a fresh event loop on it.
    /// Returns once the loop has been constructed and `init` has run.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> Result<LoopThread, Error> {
        let slot: StartupSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let worker_slot = slot.clone();

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || match EventLoop::new() {
                Ok(lp) => {
                    if let Some(init) = init {
                        init(&lp);
                    }
                    {
                        let (lock, condvar) = &*worker_slot;
                        *lock.lock() = Some(Ok(lp.handle()));
                        condvar.notify_one();
                    }
                    lp.run();
                    // Clear the published handle on the way out.
                    let (lock, _) = &*worker_slot;
                    *lock.lock() = None;
                }
                Err(e) => {
                    let (lock, condvar) = &*worker_slot;
                    *lock.lock() = Some(Err(e));
                    condvar.notify_one();
                }
            })
            .map_err(Error::ThreadSpawn)?;

        let (lock, condvar) = &*slot;
        let mut published = lock.lock();
        while published.is_none() {
            condvar.wait(&mut published);
        }
        match published.take().unwrap() {
            Ok(handle) => Ok(LoopThread {
                handle,
                thread: Some(thread),
            }),
            Err(e) => {
                drop(published);
                let _ = thread.join();
                Err(e)
            }
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed set of I/O loops fed by one base (accept) loop.
///
/// With zero workers every selection method returns the base loop: all I/O
/// stays where connections are accepted. Workers are created by
/// [`start`](Self::start) and never replaced.
pub struct LoopPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<LoopThread>,
    loops: Vec<LoopHandle>,
}

impl LoopPool {
    /// The pool does not own the base loop.
    pub fn new(base: LoopHandle, name: impl Into<String>, num_threads: usize) -> LoopPool {
        LoopPool {
            base,
            name: name.into(),
            started: false,
            num_threads,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Spawn the worker threads. Must run on the base loop's thread, once.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(!self.started, "loop pool already started");
        assert!(
            self.base.is_in_loop_thread(),
            "LoopPool::start must run on the base loop thread"
        );
        self.started = true;

        for i in 0..self.num_threads {
            let thread = LoopThread::start(format!("{}-{}", self.name, i), init.clone())?;
            self.loops.push(thread.handle().clone());
            self.threads.push(thread);
        }
        if self.num_threads == 0
            && let Some(init) = init
        {
            let lp = EventLoop::current().expect("base loop is not on this thread");
            init(&lp);
        }
        tracing::debug!(name = %self.name, workers = self.num_threads, "loop pool started");
        Ok(())
    }

    /// Round-robin selection. Returns the base loop when the pool is empty.
    pub fn next_loop(&mut self) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let picked = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        picked
    }

    /// Hash-affine selection: the same hash always lands on the same loop.
    pub fn loop_for_hash(&self, hash: u64) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        self.loops[hash as usize % self.loops.len()].clone()
    }

    /// Every worker loop, or just the base loop when there are none.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started);
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn loop_thread_publishes_a_live_handle() {
        let lt = LoopThread::start("riptide-test-worker".into(), None).unwrap();
        let (tx, rx) = mpsc::channel();
        lt.handle().run_in_loop(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("riptide-test-worker"));
    }

    #[test]
    fn init_callback_runs_once_per_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let init: ThreadInitCallback = Arc::new(move |_lp: &EventLoop| {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        let a = LoopThread::start("riptide-init-0".into(), Some(init.clone())).unwrap();
        let b = LoopThread::start("riptide-init-1".into(), Some(init)).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        drop(a);
        drop(b);
    }

    #[test]
    fn drop_quits_and_joins_the_worker() {
        let lt = LoopThread::start("riptide-drop-worker".into(), None).unwrap();
        let handle = lt.handle().clone();
        drop(lt);
        // The loop is gone; queued work is discarded, and the wakeup fd is
        // still open because we hold a handle.
        handle.queue_in_loop(|| panic!("must never run"));
    }
}
