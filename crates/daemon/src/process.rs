//! Process liveness and termination by PID.

use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Process table holding only `pid`, if it exists.
fn snapshot(pid: Pid) -> System {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
    sys
}

/// True if a process with this id exists and has not exited.
///
/// Zombies count as exited.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    match snapshot(pid).process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Ask the process to exit (SIGTERM where supported, otherwise a hard kill).
///
/// Returns false if the process is not there or the signal could not be sent.
pub fn request_termination(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let sys = snapshot(pid);
    let Some(process) = sys.process(pid) else {
        return false;
    };
    match process.kill_with(Signal::Term) {
        Some(sent) => sent,
        None => process.kill(),
    }
}

/// Kill the process outright.
pub fn force_kill(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    snapshot(pid)
        .process(pid)
        .map(|process| process.kill())
        .unwrap_or(false)
}

/// Poll until the process is gone or `timeout` elapses.
///
/// Returns true if the process exited in time.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}
