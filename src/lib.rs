//! Reactor core for non-blocking TCP services.
//!
//! One event loop per thread drives readiness-based I/O over a pluggable
//! poll(2)/epoll demultiplexer, a timerfd-backed timer queue, and a
//! cross-thread task queue woken through an eventfd. A fixed pool of worker
//! loops, fed by an acceptor on the base loop, carries connection I/O.

pub mod channel;
pub mod config;
pub mod current_thread;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod pool;
pub(crate) mod poller;
pub mod time;
pub mod timer;
pub(crate) mod timer_queue;

// Public API re-exports
pub use channel::{Channel, Interest, Ready};
pub use config::{Config, PollerBackend};
pub use dispatch::{Acceptor, Dispatcher, NewConnectionCallback, Session, SessionFactory};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{LoopPool, LoopThread, ThreadInitCallback};
pub use time::Timestamp;
pub use timer::TimerId;
