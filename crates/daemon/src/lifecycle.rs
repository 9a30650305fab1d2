//! Daemon lifecycle management
//!
//! Starts the watch loop as a detached background process, tracks it through
//! the record file, and stops it again. Single instance per record
//! directory.

use crate::process;
use crate::record::{DaemonRecord, RecordError, RecordStore};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const START_POLL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("daemon already running (PID {})", .0.process_id)]
    AlreadyRunning(DaemonRecord),

    #[error("daemon is not running")]
    NotRunning,

    #[error("cannot create listen folder {path}: {source}")]
    ListenFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn daemon process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("daemon did not come up within {0:?}")]
    StartTimeout(Duration),

    #[error("daemon process exited during startup ({status}); see {}", .log.display())]
    ChildExited { status: String, log: PathBuf },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("could not terminate daemon process {0}")]
    Terminate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How to launch and wait for the background process.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Directory of the record and log file
    pub record_dir: PathBuf,
    /// Executable to launch
    pub program: PathBuf,
    /// Arguments that make `program` enter the watch loop
    pub run_args: Vec<OsString>,
    pub listen_folder: PathBuf,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl LifecycleOptions {
    /// Options that relaunch the current executable with `run_args`.
    pub fn for_current_exe(
        record_dir: PathBuf,
        listen_folder: PathBuf,
        run_args: Vec<OsString>,
    ) -> Result<Self, LifecycleError> {
        let program = std::env::current_exe().map_err(LifecycleError::Spawn)?;
        Ok(Self {
            record_dir,
            program,
            run_args,
            listen_folder,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        })
    }
}

/// Owner of the record file and the background process.
pub struct DaemonLifecycleManager {
    options: LifecycleOptions,
    store: RecordStore,
    state: Mutex<LifecycleState>,
    /// Process spawned by this manager, kept so it can be reaped.
    child: Mutex<Option<Child>>,
}

impl DaemonLifecycleManager {
    pub fn new(options: LifecycleOptions) -> Self {
        let store = RecordStore::new(options.record_dir.clone());
        let state = if store.load_live().is_some() {
            LifecycleState::Running
        } else {
            LifecycleState::Stopped
        };
        Self {
            options,
            store,
            state: Mutex::new(state),
            child: Mutex::new(None),
        }
    }

    pub fn record_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn record_path(&self) -> PathBuf {
        self.store.path()
    }

    pub fn log_path(&self) -> PathBuf {
        self.store.log_path()
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LifecycleState) {
        *lock(&self.state) = state;
    }

    /// True iff the record names a live process. Stale records are removed.
    pub fn is_running(&self) -> bool {
        self.status().is_some()
    }

    /// The live daemon's record, if any.
    pub fn status(&self) -> Option<DaemonRecord> {
        let live = self.store.load_live();
        if live.is_none() && self.state() == LifecycleState::Running {
            self.set_state(LifecycleState::Stopped);
        }
        live
    }

    /// Launch the background process and wait until it has written its
    /// record.
    ///
    /// Fails with [`LifecycleError::AlreadyRunning`] when a live daemon is on
    /// record.
    pub async fn start(&self) -> Result<DaemonRecord, LifecycleError> {
        if let Some(record) = self.store.load_live() {
            self.set_state(LifecycleState::Running);
            return Err(LifecycleError::AlreadyRunning(record));
        }

        let folder = &self.options.listen_folder;
        std::fs::create_dir_all(folder).map_err(|source| LifecycleError::ListenFolder {
            path: folder.clone(),
            source,
        })?;

        self.set_state(LifecycleState::Starting);
        let result = self.spawn_and_wait().await;
        match &result {
            Ok(record) => {
                self.set_state(LifecycleState::Running);
                info!(pid = record.process_id, "daemon started");
            }
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                warn!("daemon start failed: {}", e);
            }
        }
        result
    }

    async fn spawn_and_wait(&self) -> Result<DaemonRecord, LifecycleError> {
        let mut child = self.spawn()?;
        let pid = child.id();
        debug!(pid, program = %self.options.program.display(), "spawned daemon process");

        let deadline = tokio::time::Instant::now() + self.options.start_timeout;
        loop {
            if let Ok(Some(record)) = self.store.read() {
                if record.process_id == pid {
                    *lock(&self.child) = Some(child);
                    return Ok(record);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LifecycleError::ChildExited {
                        status: status.to_string(),
                        log: self.store.log_path(),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(pid, "cannot poll daemon process: {}", e),
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LifecycleError::StartTimeout(self.options.start_timeout));
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    fn spawn(&self) -> Result<Child, LifecycleError> {
        let dir = self.store.dir();
        std::fs::create_dir_all(dir).map_err(|source| RecordError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let log_path = self.store.log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| RecordError::Io {
                path: log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(LifecycleError::Spawn)?;

        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.run_args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        detach(&mut cmd);

        cmd.spawn().map_err(LifecycleError::Spawn)
    }

    /// Terminate the recorded daemon, escalating to a kill after the stop
    /// timeout, and remove the record.
    ///
    /// Fails with [`LifecycleError::NotRunning`] when no live daemon is on
    /// record; a stale record is cleaned up in that case.
    pub async fn stop(&self) -> Result<DaemonRecord, LifecycleError> {
        let Some(record) = self.store.load_live() else {
            self.set_state(LifecycleState::Stopped);
            return Err(LifecycleError::NotRunning);
        };

        self.set_state(LifecycleState::Stopping);
        let pid = record.process_id;
        info!(pid, "stopping daemon");

        if let Err(e) = self.terminate(pid).await {
            self.set_state(LifecycleState::Running);
            return Err(e);
        }
        self.reap(pid);

        self.store.remove()?;
        self.set_state(LifecycleState::Stopped);
        info!(pid, "daemon stopped");
        Ok(record)
    }

    async fn terminate(&self, pid: u32) -> Result<(), LifecycleError> {
        if !process::request_termination(pid) && process::is_alive(pid) {
            return Err(LifecycleError::Terminate(pid));
        }
        if process::wait_for_exit(pid, self.options.stop_timeout).await {
            return Ok(());
        }

        warn!(pid, "daemon ignored terminate request, killing");
        process::force_kill(pid);
        if process::wait_for_exit(pid, KILL_GRACE).await {
            Ok(())
        } else {
            Err(LifecycleError::Terminate(pid))
        }
    }

    fn reap(&self, pid: u32) {
        let mut child = lock(&self.child);
        if child.as_ref().map(|c| c.id()) == Some(pid) {
            if let Some(mut c) = child.take() {
                let _ = c.wait();
            }
        }
    }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // own process group: terminal signals aimed at the caller don't reach it
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
