//! Process module - Supervises the peer executable under test
//!
//! A supervised process runs with a wall-clock limit, has its output
//! captured, and always ends in a terminal [`ProcessState`].

mod supervisor;

pub use supervisor::*;

/// Symbolic name for a signal-derived exit code, e.g. `-15` -> `SIGTERM`
#[cfg(unix)]
pub fn signal_name(code: i32) -> Option<&'static str> {
    if code >= 0 {
        return None;
    }
    nix::sys::signal::Signal::try_from(-code)
        .ok()
        .map(|signal| signal.as_str())
}

#[cfg(not(unix))]
pub fn signal_name(_code: i32) -> Option<&'static str> {
    None
}
