/// Readiness backend used by an event loop's demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerBackend {
    /// poll(2) over a flat pollfd array. Portable, O(n) per wait.
    Poll,
    /// epoll(7). The default on Linux.
    Epoll,
}

/// Configuration for an event loop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit backend override. `None` consults the `RIPTIDE_USE_POLL`
    /// environment variable and otherwise picks epoll.
    pub backend: Option<PollerBackend>,
    /// Upper bound on one demultiplexer wait, in milliseconds. The loop
    /// always wakes at least this often even when idle.
    pub poll_timeout_ms: i32,
    /// Initial capacity of the epoll event list. The list doubles whenever
    /// a wait fills it completely.
    pub epoll_initial_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: None,
            poll_timeout_ms: 10_000,
            epoll_initial_events: 16,
        }
    }
}

impl Config {
    pub(crate) fn resolved_backend(&self) -> PollerBackend {
        if let Some(backend) = self.backend {
            return backend;
        }
        if std::env::var_os("RIPTIDE_USE_POLL").is_some() {
            PollerBackend::Poll
        } else {
            PollerBackend::Epoll
        }
    }
}
