//! Single-host mutual exclusion between orchestrator invocations.
//!
//! The lock file holds one line, `pid|acquired_at`. Acquisition polls at a
//! fixed interval; a lock whose holder pid is no longer alive is reclaimed
//! immediately instead of waiting out the timeout. The read-check-steal
//! sequence is serialized through an `fs2` advisory lock on a sidecar file
//! so two waiters cannot both reclaim the same stale lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::OrchestratorError;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn format(&self) -> String {
        format!("{}|{}\n", self.holder_pid, self.acquired_at.to_rfc3339())
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split('|');
        let holder_pid = parts.next()?.parse().ok()?;
        let acquired_at = DateTime::parse_from_rfc3339(parts.next()?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self { holder_pid, acquired_at })
    }
}

/// Held lock. Release is idempotent and runs on drop, so the lock is freed
/// on every exit path, signal-triggered cleanup included.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockGuard {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Only remove the file if we still own it.
        if let Some(record) = read_record(&self.path) {
            if record.holder_pid == self.pid {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(error = %err, "failed to remove lock file on release");
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct LockManager {
    lock_path: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(lock_path: PathBuf, poll_interval: Duration) -> Self {
        Self { lock_path, poll_interval }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Current lock record, if any invocation holds the lock.
    pub fn holder(&self) -> Option<LockRecord> {
        read_record(&self.lock_path)
    }

    /// Acquire the lock within `timeout`.
    ///
    /// Polls at the configured interval. A stale lock (dead holder) is
    /// deleted and retried without sleeping. A live holder that persists
    /// past the timeout yields `LockContention`.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        let pid = std::process::id();

        loop {
            match self.try_acquire(pid) {
                Ok(Some(guard)) => return Ok(guard),
                Ok(None) => {}
                Err(err) => return Err(OrchestratorError::Other(err)),
            }

            let holder = self.holder();
            if let Some(record) = &holder {
                if !process_alive(record.holder_pid) {
                    warn!(
                        holder_pid = record.holder_pid,
                        "reclaiming lock held by dead process"
                    );
                    self.reclaim_stale(record)
                        .map_err(OrchestratorError::Other)?;
                    continue; // retry immediately
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::LockContention {
                    holder_pid: holder.map(|r| r.holder_pid).unwrap_or(0),
                    timeout_secs: timeout.as_secs(),
                });
            }
            debug!(path = %self.lock_path.display(), "lock busy, polling");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Attempt a single atomic acquisition. `Ok(None)` means contention.
    fn try_acquire(&self, pid: u32) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                let record = LockRecord { holder_pid: pid, acquired_at: Utc::now() };
                file.write_all(record.format().as_bytes())
                    .context("Failed to write lock record")?;
                file.sync_all().context("Failed to flush lock record")?;
                Ok(Some(LockGuard { path: self.lock_path.clone(), pid, released: false }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("Failed to create lock file: {}", self.lock_path.display())
            }),
        }
    }

    /// Delete a stale lock, serialized against other waiters via a sidecar
    /// advisory lock. Re-reads the record under the advisory lock so only
    /// one waiter deletes.
    fn reclaim_stale(&self, observed: &LockRecord) -> Result<()> {
        let guard_path = self.lock_path.with_extension("guard");
        let guard_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .with_context(|| format!("Failed to open lock guard file: {}", guard_path.display()))?;
        guard_file
            .lock_exclusive()
            .context("Failed to take lock guard")?;

        if let Some(current) = read_record(&self.lock_path) {
            if current == *observed && !process_alive(current.holder_pid) {
                fs::remove_file(&self.lock_path).with_context(|| {
                    format!("Failed to remove stale lock: {}", self.lock_path.display())
                })?;
            }
        }
        // Advisory lock released when guard_file drops.
        Ok(())
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read_to_string(path).ok()?;
    LockRecord::parse(&content)
}

/// Whether a process with this pid is currently alive.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir.join("rigger.lock"), Duration::from_millis(10))
    }

    /// A pid that is effectively guaranteed dead (pid_max is far below this
    /// on any host running the tests).
    const DEAD_PID: u32 = 3_999_999;

    #[tokio::test]
    async fn acquire_writes_record_and_release_removes_it() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let mut guard = mgr.acquire(Duration::from_secs(1)).await.unwrap();
        let record = mgr.holder().expect("lock record");
        assert_eq!(record.holder_pid, std::process::id());

        guard.release();
        assert!(mgr.holder().is_none());
        // Idempotent
        guard.release();
    }

    #[tokio::test]
    async fn drop_releases_the_lock() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        {
            let _guard = mgr.acquire(Duration::from_secs(1)).await.unwrap();
            assert!(mgr.holder().is_some());
        }
        assert!(mgr.holder().is_none());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_without_waiting_out_the_timeout() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let stale = LockRecord { holder_pid: DEAD_PID, acquired_at: Utc::now() };
        fs::write(mgr.lock_path(), stale.format()).unwrap();

        let started = Instant::now();
        let _guard = mgr.acquire(Duration::from_secs(30)).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "stale reclaim should not wait for the timeout"
        );
        assert_eq!(mgr.holder().unwrap().holder_pid, std::process::id());
    }

    #[tokio::test]
    async fn live_holder_past_timeout_yields_contention() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        // Our own pid is certainly alive.
        let live = LockRecord { holder_pid: std::process::id(), acquired_at: Utc::now() };
        fs::write(mgr.lock_path(), live.format()).unwrap();

        let err = mgr.acquire(Duration::from_millis(50)).await.unwrap_err();
        match err {
            OrchestratorError::LockContention { holder_pid, .. } => {
                assert_eq!(holder_pid, std::process::id());
            }
            other => panic!("expected LockContention, got {other}"),
        }
    }

    #[tokio::test]
    async fn second_waiter_proceeds_after_first_releases() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let guard = mgr.acquire(Duration::from_secs(1)).await.unwrap();
        let path = dir.path().to_path_buf();
        let waiter = tokio::spawn(async move {
            let mgr = LockManager::new(path.join("rigger.lock"), Duration::from_millis(10));
            mgr.acquire(Duration::from_secs(5)).await.is_ok()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        assert!(waiter.await.unwrap(), "waiter should acquire after release");
    }

    #[test]
    fn record_roundtrip_and_reject_garbage() {
        let record = LockRecord { holder_pid: 123, acquired_at: Utc::now() };
        let parsed = LockRecord::parse(&record.format()).unwrap();
        assert_eq!(parsed.holder_pid, 123);

        assert!(LockRecord::parse("").is_none());
        assert!(LockRecord::parse("notapid|2020-01-01T00:00:00Z").is_none());
        assert!(LockRecord::parse("123|not-a-timestamp").is_none());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(DEAD_PID));
    }
}
