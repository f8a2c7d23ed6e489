//! Two-tier per-device exclusion.
//!
//! The PLC protocol has no multiplexing: a half-written command
//! interleaved with a status poll corrupts both. Each device therefore
//! carries an in-process lock and a cross-process advisory file lock,
//! acquired in that order and released in reverse. Either tier missing
//! the 2-second deadline fails the caller with `PLC_BUSY`; nobody queues
//! indefinitely behind a wedged holder.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout, Instant};

use crate::utils::error::{AppError, AppResult};

/// Acquisition deadline for both tiers.
pub const ACQUIRE_DEADLINE: Duration = Duration::from_secs(2);

/// Poll step while waiting on the file lock.
const FILE_LOCK_POLL: Duration = Duration::from_millis(50);

/// Exclusion primitive guarding one device.
#[derive(Debug)]
pub struct DeviceMutex {
    local: Mutex<()>,
    lock_path: PathBuf,
}

impl DeviceMutex {
    /// `lock_path` anchors the cross-process tier; every process driving
    /// the same physical device must use the same path.
    pub fn new(lock_path: impl AsRef<Path>) -> Self {
        Self {
            local: Mutex::new(()),
            lock_path: lock_path.as_ref().to_path_buf(),
        }
    }

    /// Conventional lock-file location for a machine id.
    pub fn lock_path_for(lock_dir: &Path, machine_id: &str) -> PathBuf {
        lock_dir.join(format!("plc_{machine_id}.lock"))
    }

    /// Acquires both tiers with the standard deadline.
    pub async fn acquire(&self) -> AppResult<DeviceGuard<'_>> {
        self.acquire_with(ACQUIRE_DEADLINE).await
    }

    /// Acquires both tiers, failing `PLC_BUSY` when either tier misses
    /// the deadline.
    pub async fn acquire_with(&self, deadline: Duration) -> AppResult<DeviceGuard<'_>> {
        let started = Instant::now();

        let local = timeout(deadline, self.local.lock()).await.map_err(|_| {
            AppError::plc_busy("device is busy with another request")
        })?;

        // Open without truncating; the file only anchors the lock.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if started.elapsed() < deadline => sleep(FILE_LOCK_POLL).await,
                Err(_) => {
                    return Err(AppError::plc_busy(
                        "device is busy in another process",
                    ));
                }
            }
        }

        Ok(DeviceGuard {
            _local: local,
            lock_file: Some(file),
        })
    }
}

/// Holds both tiers; dropping releases the file lock first, then the
/// in-process lock.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    _local: MutexGuard<'a, ()>,
    lock_file: Option<File>,
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_and_release_allows_the_next_caller() {
        let dir = tempdir().unwrap();
        let mutex = DeviceMutex::new(dir.path().join("plc_m1.lock"));

        {
            let _guard = mutex.acquire().await.unwrap();
        }
        let _guard = mutex.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn holder_past_deadline_makes_next_caller_busy() {
        let dir = tempdir().unwrap();
        let mutex = DeviceMutex::new(dir.path().join("plc_m1.lock"));

        let _held = mutex.acquire().await.unwrap();
        let err = mutex
            .acquire_with(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PLC_BUSY");
    }

    #[tokio::test]
    async fn file_tier_excludes_a_second_handle_on_the_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plc_m1.lock");

        // Two mutexes on one path model two processes driving the same
        // physical device.
        let ours = DeviceMutex::new(&path);
        let theirs = DeviceMutex::new(&path);

        let _held = ours.acquire().await.unwrap();
        let err = theirs
            .acquire_with(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PLC_BUSY");
    }

    #[tokio::test]
    async fn file_tier_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plc_m1.lock");
        let ours = DeviceMutex::new(&path);
        let theirs = DeviceMutex::new(&path);

        {
            let _held = ours.acquire().await.unwrap();
        }
        let _guard = theirs.acquire().await.unwrap();
    }
}
