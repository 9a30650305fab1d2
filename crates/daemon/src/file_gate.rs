//! Lock checking module for verifying files are not held by a writer.
//!
//! Before a label file is read or converted we try to take an exclusive,
//! non-blocking hold on it. Failing to get that hold means another process
//! still owns the file; any other failure is reported as "not locked" so the
//! caller's own existence/read check surfaces the real error.

use std::fs::File;
use std::io;
use std::path::Path;

/// Result of a lock check on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Exclusive access could be taken and was released again.
    Free,
    /// Another reader or writer holds the file.
    Locked,
}

impl LockState {
    pub fn is_locked(self) -> bool {
        matches!(self, LockState::Locked)
    }
}

/// Check whether `path` is currently held by someone else.
pub fn is_locked(path: &Path) -> bool {
    check_lock(path).is_locked()
}

/// Same as [`is_locked`] but returns the richer [`LockState`].
pub fn check_lock(path: &Path) -> LockState {
    match try_exclusive(path) {
        Ok(()) => LockState::Free,
        Err(e) => classify_open_error(&e),
    }
}

/// Map an open/lock error to a lock state.
///
/// Only contention means "locked"; not-found, permission and the rest are
/// left for the caller to trip over.
#[inline]
pub fn classify_open_error(err: &io::Error) -> LockState {
    match err.kind() {
        io::ErrorKind::WouldBlock => LockState::Locked,
        _ if is_sharing_violation(err) => LockState::Locked,
        _ => LockState::Free,
    }
}

#[cfg(unix)]
fn try_exclusive(path: &Path) -> io::Result<()> {
    use nix::fcntl::{Flock, FlockArg};

    let file = File::open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => {
            drop(guard);
            Ok(())
        }
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
fn try_exclusive(path: &Path) -> io::Result<()> {
    use std::os::windows::fs::OpenOptionsExt;

    // share mode 0: fails while any other handle is open
    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(path)
        .map(drop)
}

#[cfg(not(any(unix, windows)))]
fn try_exclusive(path: &Path) -> io::Result<()> {
    File::open(path).map(drop)
}

#[cfg(windows)]
fn is_sharing_violation(err: &io::Error) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    matches!(
        err.raw_os_error(),
        Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
    )
}

#[cfg(not(windows))]
fn is_sharing_violation(_err: &io::Error) -> bool {
    false
}
