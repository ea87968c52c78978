//! Per-task advisory locks.
//!
//! At most one holder per `(taskId, purpose)` across processes on the same
//! host, enforced with `flock(LOCK_EX | LOCK_NB)` on a file under
//! `.gatehouse/locks/`. Acquisition polls until a caller-supplied timeout and
//! then fails with `LockTimeout` — it never proceeds unlocked. The kernel
//! releases a flock when its holder dies, so a crashed holder cannot wedge a
//! lock; the metadata record inside the lock file is advisory and is simply
//! overwritten by the next acquirer.
//!
//! Round allocation and bundle-approval writes happen inside this lock's
//! scope. Reads never take it.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::core::error::GatehouseError;
use crate::core::paths;
use crate::core::time;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_JITTER_MS: u64 = 50;

/// Advisory holder record written into the lock file. Never persisted beyond
/// the holding process's lifetime in any authoritative sense — the flock is
/// the truth, this is diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub task_id: String,
    pub purpose: String,
    pub holder: String,
    pub pid: u32,
    pub acquired_at: String,
    pub timeout_seconds: u64,
}

/// Observed state of a lock file, for `lock status` style diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub task_id: String,
    pub purpose: String,
    pub held: bool,
    pub info: Option<LockInfo>,
    pub pid_alive: Option<bool>,
}

/// RAII guard; dropping it releases the flock.
pub struct TaskLockGuard {
    _lock_file: File,
    task_id: String,
    purpose: String,
}

impl std::fmt::Debug for TaskLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLockGuard")
            .field("task_id", &self.task_id)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl TaskLockGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

#[derive(Debug, Clone)]
pub struct TaskLockManager {
    locks_dir: PathBuf,
}

impl TaskLockManager {
    pub fn new(project_root: &Path) -> Self {
        Self {
            locks_dir: paths::locks_dir(project_root),
        }
    }

    pub fn lock_path(&self, task_id: &str, purpose: &str) -> Result<PathBuf, GatehouseError> {
        paths::validate_entity_id(task_id)?;
        paths::validate_entity_id(purpose)?;
        Ok(self.locks_dir.join(format!("{}.{}.lock", task_id, purpose)))
    }

    /// Non-blocking attempt. `Ok(None)` means another process holds the lock.
    pub fn try_acquire(
        &self,
        task_id: &str,
        purpose: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<Option<TaskLockGuard>, GatehouseError> {
        let lock_path = self.lock_path(task_id, purpose)?;
        fs::create_dir_all(&self.locks_dir)?;

        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        if !try_flock_exclusive(&lock_file)? {
            return Ok(None);
        }

        // We own the flock; replace whatever stale holder record is inside.
        let info = LockInfo {
            task_id: task_id.to_string(),
            purpose: purpose.to_string(),
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: time::now_iso(),
            timeout_seconds: timeout.as_secs(),
        };
        lock_file.set_len(0)?;
        lock_file.seek(SeekFrom::Start(0))?;
        writeln!(lock_file, "{}", serde_json::to_string(&info)?)?;
        lock_file.flush()?;

        Ok(Some(TaskLockGuard {
            _lock_file: lock_file,
            task_id: task_id.to_string(),
            purpose: purpose.to_string(),
        }))
    }

    /// Acquire with polling; fails with `LockTimeout` on expiry.
    pub fn acquire(
        &self,
        task_id: &str,
        purpose: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<TaskLockGuard, GatehouseError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(task_id, purpose, holder, timeout)? {
                return Ok(guard);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(GatehouseError::LockTimeout {
                    task_id: task_id.to_string(),
                    purpose: purpose.to_string(),
                    elapsed_secs: elapsed.as_secs(),
                });
            }
            let jitter_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64
                % (POLL_JITTER_MS + 1);
            let remaining = timeout - elapsed;
            std::thread::sleep((POLL_INTERVAL + Duration::from_millis(jitter_ms)).min(remaining));
        }
    }

    /// Diagnostic view: whether the flock is held, the last holder record,
    /// and whether that holder's PID is still alive. EPERM on the liveness
    /// probe counts as alive.
    pub fn status(&self, task_id: &str, purpose: &str) -> Result<LockStatus, GatehouseError> {
        let lock_path = self.lock_path(task_id, purpose)?;
        if !lock_path.exists() {
            return Ok(LockStatus {
                task_id: task_id.to_string(),
                purpose: purpose.to_string(),
                held: false,
                info: None,
                pid_alive: None,
            });
        }

        let lock_file = OpenOptions::new().read(true).write(true).open(&lock_path)?;
        let held = match try_flock_exclusive(&lock_file)? {
            // We won the probe flock; dropping lock_file below releases it.
            true => false,
            false => true,
        };

        let info: Option<LockInfo> = fs::read_to_string(&lock_path)
            .ok()
            .and_then(|content| serde_json::from_str(content.trim()).ok());
        let pid_alive = info.as_ref().map(|i| is_pid_alive(i.pid));

        Ok(LockStatus {
            task_id: task_id.to_string(),
            purpose: purpose.to_string(),
            held,
            info,
            pid_alive,
        })
    }
}

/// Non-blocking exclusive flock. `Ok(false)` means currently held elsewhere.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock on a valid fd owned by `file`; LOCK_NB keeps it
        // non-blocking.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "task locks require flock support",
        ))
    }
}

/// `kill(pid, 0)` existence probe. EPERM means the process exists but is not
/// ours; treat as alive.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 only checks for process existence.
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno == libc::EPERM
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = TaskLockManager::new(tmp.path());
        let guard = mgr
            .acquire("T1", "round", "S1", Duration::from_secs(1))
            .unwrap();
        assert_eq!(guard.task_id(), "T1");
        drop(guard);
        // Reacquirable after release.
        let guard = mgr
            .acquire("T1", "round", "S2", Duration::from_secs(1))
            .unwrap();
        drop(guard);
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = TaskLockManager::new(tmp.path());
        let _guard = mgr
            .acquire("T1", "round", "S1", Duration::from_secs(1))
            .unwrap();
        let err = mgr
            .acquire("T1", "round", "S2", Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, GatehouseError::LockTimeout { .. }));
    }

    #[test]
    fn test_different_purposes_do_not_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = TaskLockManager::new(tmp.path());
        let _a = mgr
            .acquire("T1", "round", "S1", Duration::from_secs(1))
            .unwrap();
        let _b = mgr
            .acquire("T1", "approval", "S1", Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_status_reports_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = TaskLockManager::new(tmp.path());
        let status = mgr.status("T1", "round").unwrap();
        assert!(!status.held);

        let _guard = mgr
            .acquire("T1", "round", "session-9", Duration::from_secs(5))
            .unwrap();
        let status = mgr.status("T1", "round").unwrap();
        assert!(status.held);
        let info = status.info.unwrap();
        assert_eq!(info.holder, "session-9");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(status.pid_alive, Some(true));
    }

    #[test]
    fn test_invalid_purpose_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = TaskLockManager::new(tmp.path());
        assert!(mgr.lock_path("T1", "../oops").is_err());
    }
}
