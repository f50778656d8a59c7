//! Side-channel mirror of session traffic.
//!
//! The controller opens its sink once per session and notifies it of every
//! payload it displays (`output`) or forwards (`input`). Opening returns a
//! [`Closer`] that the controller calls on disposal.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;

/// Kind for text shown on the terminal.
pub const KIND_OUTPUT: &str = "output";
/// Kind for text forwarded to the remote.
pub const KIND_INPUT: &str = "input";

/// Callback that finishes a telemetry session.
pub type Closer = Box<dyn FnOnce() + Send>;

/// Receives a copy of session traffic.
pub trait TelemetrySink: Send + std::fmt::Debug {
    /// Start a telemetry session.
    fn open(&mut self) -> Closer;

    /// Record one payload.
    fn notify(&mut self, kind: &str, payload: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn open(&mut self) -> Closer {
        Box::new(|| {})
    }

    fn notify(&mut self, _kind: &str, _payload: &str) {}
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    ts: String,
    session: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a str>,
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct JsonlTelemetry {
    path: PathBuf,
    session_id: String,
    file: Arc<Mutex<File>>,
}

impl JsonlTelemetry {
    /// Open (or create) `path` for appending.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open telemetry file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            session_id: uuid::Uuid::new_v4().to_string(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Identifier written with every record.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(file: &Mutex<File>, session: &str, kind: &str, data: Option<&str>) {
        let record = Record {
            ts: chrono::Utc::now().to_rfc3339(),
            session,
            kind,
            data,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("[telemetry] Failed to encode record: {e}");
                return;
            }
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}") {
            log::warn!("[telemetry] Failed to write record: {e}");
        }
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn open(&mut self) -> Closer {
        Self::write(&self.file, &self.session_id, "open", None);
        let file = Arc::clone(&self.file);
        let session = self.session_id.clone();
        Box::new(move || Self::write(&file, &session, "close", None))
    }

    fn notify(&mut self, kind: &str, payload: &str) {
        Self::write(&self.file, &self.session_id, kind, Some(payload));
    }
}
