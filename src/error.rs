use std::fmt;
use std::io;

/// Errors returned by riptide.
#[derive(Debug)]
pub enum Error {
    /// Underlying syscall failure.
    Io(io::Error),
    /// Creating the readiness backend failed (e.g. epoll_create1).
    PollerSetup(io::Error),
    /// Creating the wakeup eventfd failed.
    WakeupSetup(io::Error),
    /// Creating the timerfd failed.
    TimerSetup(io::Error),
    /// Spawning a pool worker thread failed.
    ThreadSpawn(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::PollerSetup(e) => write!(f, "poller setup: {e}"),
            Error::WakeupSetup(e) => write!(f, "wakeup eventfd setup: {e}"),
            Error::TimerSetup(e) => write!(f, "timerfd setup: {e}"),
            Error::ThreadSpawn(e) => write!(f, "worker thread spawn: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e)
            | Error::PollerSetup(e)
            | Error::WakeupSetup(e)
            | Error::TimerSetup(e)
            | Error::ThreadSpawn(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
