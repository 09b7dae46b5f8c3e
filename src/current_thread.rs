//! Cached kernel thread id for the calling thread.
//!
//! Thread-affinity assertions run on every loop mutation, so the tid lookup
//! has to be a cached load rather than a syscall.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// The kernel tid of the calling thread.
pub fn tid() -> libc::pid_t {
    CACHED_TID.with(|cached| {
        let t = cached.get();
        if t != 0 {
            return t;
        }
        let t = unsafe { libc::gettid() };
        cached.set(t);
        t
    })
}
