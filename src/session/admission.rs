//! Per-client cap on concurrently open sessions.
//!
//! One [`SessionAdmission`] is constructed at startup and cloned into every
//! controller. It tracks how many physical transports are open and refuses
//! new sessions once `limit` is reached, until either a session closes or
//! the admission window expires.
//!
//! # Window
//!
//! ```text
//! first increment ──► window_start = now
//!                     │
//!      now > window_start + window ──► count = 0, window cleared
//! ```
//!
//! An expired window turns a denial into an allow without any decrement.
//!
//! # Pairing
//!
//! Increments are handed out as [`AdmissionLease`]s. A lease decrements
//! exactly once, either through [`AdmissionLease::release`] or on drop, so
//! every exit path (close, dispose, task abort, unwinding) stays paired.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::store::{AdmissionRecord, AdmissionStore, MemoryStore};

/// Source of wall-clock time for the admission window.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared, cloneable session counter.
#[derive(Debug, Clone)]
pub struct SessionAdmission {
    store: Arc<dyn AdmissionStore>,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionAdmission {
    /// Create a process-local counter using the system clock.
    pub fn new(limit: u32, window_minutes: u32) -> Self {
        Self::with_clock(limit, window_minutes, Arc::new(SystemClock))
    }

    /// Create a process-local counter reading time from `clock`.
    pub fn with_clock(limit: u32, window_minutes: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            limit,
            window: Duration::minutes(i64::from(window_minutes)),
            clock,
        }
    }

    /// Keep the counter in `store`, shared with every holder of that store.
    pub fn with_store(mut self, store: Arc<dyn AdmissionStore>) -> Self {
        self.store = store;
        self
    }

    /// Maximum number of concurrent sessions.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether a new session may open right now.
    pub fn is_valid(&self) -> bool {
        self.current().count < self.limit
    }

    /// Record one newly opened transport.
    ///
    /// Prefer [`SessionAdmission::acquire`], which pairs the decrement
    /// automatically.
    pub fn increment(&self) {
        let now = self.clock.now();
        let record = self.update(|record| {
            if record.window_start.is_none() {
                record.window_start = Some(now);
            }
            record.count += 1;
        });
        log::debug!("[admission] Session count incremented to {}", record.count);
    }

    /// Record one closed transport. Saturates at zero.
    pub fn decrement(&self) {
        let record = self.update(|record| record.count = record.count.saturating_sub(1));
        log::debug!("[admission] Session count decremented to {}", record.count);
    }

    /// Current count, after applying window expiry.
    pub fn count(&self) -> u32 {
        self.current().count
    }

    /// Whole minutes until the window resets, rounded up.
    ///
    /// Returns the full window length when no window is running.
    pub fn remaining_minutes(&self) -> i64 {
        match self.current().window_start {
            Some(start) => {
                let remaining = (start + self.window - self.clock.now()).num_seconds().max(0);
                (remaining + 59) / 60
            }
            None => self.window.num_minutes(),
        }
    }

    /// Increment and return a lease that decrements when released.
    pub fn acquire(&self) -> AdmissionLease {
        self.increment();
        AdmissionLease {
            admission: Some(self.clone()),
        }
    }

    fn current(&self) -> AdmissionRecord {
        self.update(|_| {})
    }

    /// Apply window expiry, then `f`, as one store update.
    fn update(&self, mut f: impl FnMut(&mut AdmissionRecord)) -> AdmissionRecord {
        let now = self.clock.now();
        let window = self.window;
        self.store.update(&mut |record| {
            if let Some(start) = record.window_start {
                if now > start + window {
                    log::debug!("[admission] Window expired, resetting count from {}", record.count);
                    record.count = 0;
                    record.window_start = None;
                }
            }
            f(record);
        })
    }
}

/// One counted session slot. Decrements exactly once.
#[derive(Debug)]
pub struct AdmissionLease {
    admission: Option<SessionAdmission>,
}

impl AdmissionLease {
    /// Give the slot back now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.decrement();
        }
    }
}

impl Drop for AdmissionLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
