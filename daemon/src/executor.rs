//! Process actions: kill and priority changes

use crate::collector::linux::has_exited;
use crate::error::ProcessError;
use crate::priority::PriorityClass;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const KILL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(20);

pub trait ProcessExecutor: Send + Sync {
    /// Forcibly terminates the process and waits (bounded) for it to exit.
    fn kill(&self, pid: u32) -> Result<(), ProcessError>;

    fn set_priority(&self, pid: u32, priority: PriorityClass) -> Result<(), ProcessError>;
}

/// Signals and renices through libc.
pub struct SignalExecutor {
    proc_root: PathBuf,
    exit_timeout: Duration,
}

impl SignalExecutor {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            exit_timeout: KILL_EXIT_TIMEOUT,
        }
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    fn thread_ids(&self, pid: u32) -> Vec<u32> {
        let task_dir = self.proc_root.join(pid.to_string()).join("task");
        match fs::read_dir(&task_dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
                .collect(),
            Err(e) => {
                debug!(pid, error = %e, "cannot list threads");
                Vec::new()
            }
        }
    }

    fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.exit_timeout;
        loop {
            if has_exited(&self.proc_root, pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }
}

impl Default for SignalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// pid 0 and values past `pid_t` would address process groups, never a single process.
fn to_pid_t(pid: u32) -> Result<libc::pid_t, ProcessError> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ProcessError::NotFound(pid)),
    }
}

pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), ProcessError> {
    let target = to_pid_t(pid)?;
    let result = unsafe { libc::kill(target, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(ProcessError::last_os_error(pid))
    }
}

pub fn renice(pid: u32, nice: i32) -> Result<(), ProcessError> {
    let target = to_pid_t(pid)?;
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, target as libc::id_t, nice) };
    if result == 0 {
        Ok(())
    } else {
        Err(ProcessError::last_os_error(pid))
    }
}

impl ProcessExecutor for SignalExecutor {
    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        send_signal(pid, libc::SIGKILL)?;
        if self.wait_for_exit(pid) {
            debug!(pid, "process exited after SIGKILL");
        } else {
            warn!(pid, timeout = ?self.exit_timeout, "process still present after SIGKILL");
        }
        Ok(())
    }

    /// Linux keeps a nice value per thread, so every task under the process
    /// is reniced, not only its main thread.
    fn set_priority(&self, pid: u32, priority: PriorityClass) -> Result<(), ProcessError> {
        let nice = priority.to_nice();
        renice(pid, nice)?;
        for tid in self.thread_ids(pid) {
            if tid == pid {
                continue;
            }
            match renice(tid, nice) {
                Ok(()) => {}
                // thread exited in between
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
