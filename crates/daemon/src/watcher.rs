//! Filesystem notification backends for the folder monitor.
//!
//! Backends run on a dedicated OS thread and only push small messages into a
//! bounded channel; all reading and conversion happens on the async side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often the polling backend rescans the folder.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[cfg(target_os = "linux")]
const INOTIFY_IDLE: Duration = Duration::from_millis(100);

/// What kind of activity produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// New file, or a file moved into the folder
    Created,
    /// Existing file written to or closed after writing
    Modified,
    /// Found by the initial sweep
    Existing,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Existing => write!(f, "existing"),
        }
    }
}

/// Message from a backend thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RawChange {
    File { path: PathBuf, kind: ChangeKind },
    /// Events were dropped by the kernel; the folder should be rescanned.
    Overflow,
    /// The watch is gone (folder removed or unreadable). The backend exits.
    Lost(String),
}

/// Running backend thread. Stopping joins the thread.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watcher thread panicked");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        // thread notices within one idle tick; not joined here
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Start the platform's preferred backend on `dir`.
#[cfg(target_os = "linux")]
pub fn spawn_watcher(dir: &Path, tx: mpsc::Sender<RawChange>) -> std::io::Result<WatchHandle> {
    spawn_inotify_watcher(dir, tx)
}

#[cfg(not(target_os = "linux"))]
pub fn spawn_watcher(dir: &Path, tx: mpsc::Sender<RawChange>) -> std::io::Result<WatchHandle> {
    spawn_poll_watcher(dir, tx, POLL_INTERVAL)
}

#[cfg(target_os = "linux")]
pub fn spawn_inotify_watcher(
    dir: &Path,
    tx: mpsc::Sender<RawChange>,
) -> std::io::Result<WatchHandle> {
    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let watch_mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
    inotify.add_watch(dir, watch_mask)?;

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let dir = dir.to_path_buf();

    let thread = std::thread::Builder::new()
        .name("label-watch".to_string())
        .spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                        std::thread::sleep(INOTIFY_IDLE);
                        continue;
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(RawChange::Lost(format!("inotify read failed: {}", e)));
                        return;
                    }
                };

                for event in events {
                    let change = if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        RawChange::Overflow
                    } else if event.mask.intersects(
                        AddWatchFlags::IN_DELETE_SELF
                            | AddWatchFlags::IN_MOVE_SELF
                            | AddWatchFlags::IN_IGNORED,
                    ) {
                        let _ = tx.blocking_send(RawChange::Lost(format!(
                            "watched folder {} was removed or moved",
                            dir.display()
                        )));
                        return;
                    } else if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                        continue;
                    } else if let Some(name) = event.name {
                        let kind = if event
                            .mask
                            .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
                        {
                            ChangeKind::Created
                        } else {
                            ChangeKind::Modified
                        };
                        RawChange::File {
                            path: dir.join(name),
                            kind,
                        }
                    } else {
                        continue;
                    };

                    if tx.blocking_send(change).is_err() {
                        debug!("monitor gone, watcher thread exiting");
                        return;
                    }
                }
            }
        })?;

    Ok(WatchHandle {
        stop,
        thread: Some(thread),
    })
}

/// Rescan `dir` every `interval`, reporting files that are new or whose
/// size or mtime changed since the last scan.
pub fn spawn_poll_watcher(
    dir: &Path,
    tx: mpsc::Sender<RawChange>,
    interval: Duration,
) -> std::io::Result<WatchHandle> {
    let mut known = snapshot(dir)?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let dir = dir.to_path_buf();

    let thread = std::thread::Builder::new()
        .name("label-poll".to_string())
        .spawn(move || {
            let tick = interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
            let mut elapsed = Duration::ZERO;

            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::sleep(tick);
                elapsed += tick;
                if elapsed < interval {
                    continue;
                }
                elapsed = Duration::ZERO;

                let current = match snapshot(&dir) {
                    Ok(current) => current,
                    Err(e) => {
                        let _ = tx.blocking_send(RawChange::Lost(format!(
                            "cannot scan {}: {}",
                            dir.display(),
                            e
                        )));
                        return;
                    }
                };

                for (path, stamp) in &current {
                    let kind = match known.get(path) {
                        None => ChangeKind::Created,
                        Some(previous) if previous != stamp => ChangeKind::Modified,
                        Some(_) => continue,
                    };
                    let change = RawChange::File {
                        path: path.clone(),
                        kind,
                    };
                    if tx.blocking_send(change).is_err() {
                        return;
                    }
                }
                known = current;
            }
        })?;

    Ok(WatchHandle {
        stop,
        thread: Some(thread),
    })
}

type Stamp = (u64, Option<SystemTime>);

fn snapshot(dir: &Path) -> std::io::Result<HashMap<PathBuf, Stamp>> {
    let mut files = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            files.insert(entry.path(), (meta.len(), meta.modified().ok()));
        }
    }
    Ok(files)
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = snapshot(dir)?.into_keys().collect();
    files.sort();
    Ok(files)
}
