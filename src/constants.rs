//! Application-wide constants for webtty.
//!
//! Timing values and the user-visible texts the session controller writes
//! to the terminal.

use std::time::Duration;

// ============================================================================
// Timing
// ============================================================================

/// Interval between keep-alive pings on an open transport.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long the "Connection Closed" status stays up.
pub const CLOSE_MESSAGE_TIMEOUT: Duration = Duration::from_millis(2000);

// ============================================================================
// Admission
// ============================================================================

/// Default cap on concurrently open sessions per client.
pub const DEFAULT_MAX_SESSIONS: u32 = 1;

/// Default admission window in minutes.
pub const DEFAULT_SESSION_WINDOW_MINUTES: u32 = 15;

/// Admission counter shared by every webtty process, in the config directory.
pub const ADMISSION_STATE_FILE: &str = "admission.json";

// ============================================================================
// Terminal texts
// ============================================================================

/// Transient status shown when a transport closes.
pub const CONNECTION_CLOSED_STATUS: &str = "Connection Closed";

/// Output for a normal remote close (code 1000).
pub const CLOSED_BY_REMOTE: &str = "connection closed by remote host";

/// Output for a close without status (code 1005).
pub const CLOSED_NO_STATUS: &str = "connection closed.";

/// Separator before the resource-unavailable hint.
pub const UNAVAILABLE_SEPARATOR: &str = "\r\n OR";

/// Resource-unavailable hint with the peer suffix after `Resource`.
pub fn unavailable_hint(peer_suffix: &str) -> String {
    format!("\r\nResource{peer_suffix} unavailable, Please try again after some time.")
}

/// Admission denial text.
pub fn admission_denied(remaining_minutes: i64) -> String {
    format!(
        "Maximum no of connections reached, Please close/disconnect the old Terminals \
         to proceed or try after {remaining_minutes} Minutes."
    )
}
