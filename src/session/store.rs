//! Backing stores for [`super::SessionAdmission`] state.
//!
//! The admission counter is per client, not per process: every terminal
//! the user has open counts against the same limit. [`FileStore`] keeps the
//! record in a JSON file in the config directory so concurrent `webtty`
//! processes see one counter; [`MemoryStore`] keeps it in the process.
//!
//! ```text
//! update(f)
//!   ├── acquire <file>.lock   (create_new; stale after STALE_LOCK_AGE)
//!   ├── read <file>           (missing or corrupt → empty record)
//!   ├── f(&mut record)
//!   ├── write <file>.tmp + rename
//!   └── remove <file>.lock
//! ```

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How long to wait for another process to release the lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Lock files older than this belong to a process that died mid-update.
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Persisted admission counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    /// Open transports counted against the limit.
    pub count: u32,
    /// Start of the current admission window.
    pub window_start: Option<DateTime<Utc>>,
}

/// Shared storage for the admission record.
///
/// `update` runs `f` as one atomic read-modify-write and returns the
/// record as stored afterwards. Storage failures are logged, never
/// returned: admission must keep working without a writable disk.
pub trait AdmissionStore: Send + Sync + std::fmt::Debug {
    /// Atomically read, modify and store the record.
    fn update(&self, f: &mut dyn FnMut(&mut AdmissionRecord)) -> AdmissionRecord;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<AdmissionRecord>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdmissionStore for MemoryStore {
    fn update(&self, f: &mut dyn FnMut(&mut AdmissionRecord)) -> AdmissionRecord {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record);
        *record
    }
}

/// Store shared between processes through a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes threads of this process before they race for the lock file
    local: Mutex<()>,
}

impl FileStore {
    /// Store backed by `path` (created on first update).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = with_suffix(&path, "lock");
        Self {
            path,
            lock_path,
            local: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> AdmissionRecord {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!(
                    "[admission] Ignoring corrupt state in {}: {e}",
                    self.path.display()
                );
                AdmissionRecord::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => AdmissionRecord::default(),
            Err(e) => {
                log::warn!("[admission] Failed to read {}: {e}", self.path.display());
                AdmissionRecord::default()
            }
        }
    }

    fn write(&self, record: &AdmissionRecord) {
        let tmp = with_suffix(&self.path, "tmp");
        let result = serde_json::to_string(record)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(&tmp, json))
            .and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            log::warn!("[admission] Failed to write {}: {e}", self.path.display());
        }
    }

    /// Take the cross-process lock. Returns whether it is held.
    fn lock(&self) -> bool {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => return true,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        log::warn!(
                            "[admission] Removing stale lock {}",
                            self.lock_path.display()
                        );
                        let _ = fs::remove_file(&self.lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        log::warn!(
                            "[admission] Timed out waiting for {}",
                            self.lock_path.display()
                        );
                        return false;
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => {
                    log::warn!(
                        "[admission] Cannot create {}: {e}",
                        self.lock_path.display()
                    );
                    return false;
                }
            }
        }
    }

    fn lock_is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > STALE_LOCK_AGE)
    }

    fn unlock(&self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            log::warn!(
                "[admission] Failed to remove {}: {e}",
                self.lock_path.display()
            );
        }
    }
}

impl AdmissionStore for FileStore {
    fn update(&self, f: &mut dyn FnMut(&mut AdmissionRecord)) -> AdmissionRecord {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        // Without the lock the update still happens, unserialized
        let locked = self.lock();

        let mut record = self.read();
        let before = record;
        f(&mut record);
        if record != before {
            self.write(&record);
        }

        if locked {
            self.unlock();
        }
        record
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
