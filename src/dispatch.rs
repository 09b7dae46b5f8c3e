//! Acceptor glue: hands newly accepted connections to pool loops.
//!
//! The byte-stream machinery behind a connection lives outside this crate;
//! the dispatcher only assigns each accepted fd a worker loop, keeps the
//! session registry, and schedules the session lifecycle calls onto the
//! right threads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::pool::{LoopPool, ThreadInitCallback};

/// Invoked by the acceptor with each accepted fd, on the base loop's thread.
pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

/// The listening-socket collaborator. The dispatcher only calls these two
/// methods; it never accepts connections itself.
pub trait Acceptor {
    fn set_new_connection_callback(&mut self, callback: NewConnectionCallback);
    fn listen(&mut self);
}

/// A connection-level collaborator. Both lifecycle calls are delivered on
/// the worker loop the connection was assigned to; after assignment the
/// session is only ever touched from that thread.
pub trait Session: Send + Sync + 'static {
    fn connect_established(self: Arc<Self>);
    fn connect_destroyed(self: Arc<Self>);
}

/// Builds the session for an accepted connection, given its assigned loop,
/// its id, the fd, and the peer address.
pub type SessionFactory =
    Box<dyn Fn(&LoopHandle, u64, RawFd, SocketAddr) -> Arc<dyn Session> + Send + Sync>;

struct SessionRecord {
    io_loop: LoopHandle,
    session: Arc<dyn Session>,
}

/// Front-end glue between one acceptor and a pool of I/O loops.
pub struct Dispatcher {
    base: LoopHandle,
    name: String,
    pool: Mutex<LoopPool>,
    sessions: Mutex<HashMap<u64, SessionRecord>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    factory: SessionFactory,
    self_weak: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        base: LoopHandle,
        name: impl Into<String>,
        num_workers: usize,
        factory: SessionFactory,
    ) -> Arc<Dispatcher> {
        let name = name.into();
        Arc::new_cyclic(|self_weak| Dispatcher {
            pool: Mutex::new(LoopPool::new(base.clone(), name.clone(), num_workers)),
            base,
            name,
            sessions: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            factory,
            self_weak: self_weak.clone(),
        })
    }

    /// Start the worker pool, wire up the acceptor, and begin listening.
    /// Must run on the base loop's thread; repeated calls are no-ops.
    pub fn start(
        &self,
        acceptor: &mut dyn Acceptor,
        init: Option<ThreadInitCallback>,
    ) -> Result<(), Error> {
        assert!(self.base.is_in_loop_thread());
        if self.started.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.pool.lock().start(init)?;

        let dispatcher = self.self_weak.clone();
        acceptor.set_new_connection_callback(Box::new(move |fd, peer_addr| {
            if let Some(d) = dispatcher.upgrade() {
                d.new_connection(fd, peer_addr);
            }
        }));
        acceptor.listen();
        Ok(())
    }

    fn new_connection(&self, fd: RawFd, peer_addr: SocketAddr) {
        assert!(self.base.is_in_loop_thread());
        let io_loop = self.pool.lock().next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(server = %self.name, id, %peer_addr, "new connection");

        let session = (self.factory)(&io_loop, id, fd, peer_addr);
        self.sessions.lock().insert(
            id,
            SessionRecord {
                io_loop: io_loop.clone(),
                session: session.clone(),
            },
        );
        io_loop.run_in_loop(move || session.connect_established());
    }

    /// Drop a session from the registry and schedule its teardown on the
    /// loop it lives on. Safe from any thread.
    pub fn remove_connection(&self, id: u64) {
        let Some(dispatcher) = self.self_weak.upgrade() else {
            return;
        };
        self.base
            .run_in_loop(move || dispatcher.remove_connection_in_base(id));
    }

    fn remove_connection_in_base(&self, id: u64) {
        assert!(self.base.is_in_loop_thread());
        let Some(record) = self.sessions.lock().remove(&id) else {
            return;
        };
        tracing::info!(server = %self.name, id, "connection removed");
        let session = record.session;
        record.io_loop.queue_in_loop(move || session.connect_destroyed());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Tear surviving sessions down on their own loops; the pool drops
        // afterwards, quitting and joining the workers.
        for (_, record) in self.sessions.lock().drain() {
            let session = record.session;
            record.io_loop.queue_in_loop(move || session.connect_destroyed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event_loop::EventLoop;
    use std::sync::Mutex as StdMutex;

    struct FakeAcceptor {
        callback: Option<NewConnectionCallback>,
        listening: bool,
    }

    impl FakeAcceptor {
        fn new() -> Self {
            FakeAcceptor {
                callback: None,
                listening: false,
            }
        }

        fn accept(&mut self, fd: RawFd, peer: SocketAddr) {
            assert!(self.listening);
            self.callback.as_mut().expect("no callback installed")(fd, peer);
        }
    }

    impl Acceptor for FakeAcceptor {
        fn set_new_connection_callback(&mut self, callback: NewConnectionCallback) {
            self.callback = Some(callback);
        }

        fn listen(&mut self) {
            self.listening = true;
        }
    }

    struct RecordingSession {
        id: u64,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Session for RecordingSession {
        fn connect_established(self: Arc<Self>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("established:{}", self.id));
        }

        fn connect_destroyed(self: Arc<Self>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("destroyed:{}", self.id));
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4242".parse().unwrap()
    }

    #[test]
    fn sessions_flow_through_establish_and_destroy() {
        let lp = EventLoop::with_config(&Config {
            poll_timeout_ms: 20,
            ..Config::default()
        })
        .unwrap();
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let factory_log = log.clone();
        let dispatcher = Dispatcher::new(
            lp.handle(),
            "echo",
            0, // all I/O on the base loop
            Box::new(move |_io_loop, id, _fd, _peer| {
                Arc::new(RecordingSession {
                    id,
                    log: factory_log.clone(),
                })
            }),
        );

        let mut acceptor = FakeAcceptor::new();
        dispatcher.start(&mut acceptor, None).unwrap();
        assert!(acceptor.listening);

        // With zero workers the session runs on the base loop, so
        // establishment happens synchronously right here.
        acceptor.accept(40, peer());
        acceptor.accept(41, peer());
        assert_eq!(dispatcher.session_count(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["established:1", "established:2"]
        );

        // Teardown is queued onto the loop's task phase.
        dispatcher.remove_connection(1);
        assert_eq!(dispatcher.session_count(), 1);
        let handle = lp.handle();
        lp.queue_in_loop(move || handle.quit());
        lp.run();
        assert_eq!(log.lock().unwrap().last().unwrap(), "destroyed:1");
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let lp = EventLoop::new().unwrap();
        let dispatcher = Dispatcher::new(
            lp.handle(),
            "idem",
            0,
            Box::new(|_, id, _, _| {
                Arc::new(RecordingSession {
                    id,
                    log: Arc::new(StdMutex::new(Vec::new())),
                })
            }),
        );
        let mut acceptor = FakeAcceptor::new();
        dispatcher.start(&mut acceptor, None).unwrap();
        dispatcher.start(&mut acceptor, None).unwrap();
    }
}
