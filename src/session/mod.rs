//! Terminal sessions: the logical session, its lifecycle, and admission.
//!
//! - [`Session`] - what to run remotely and how to reconnect
//! - [`SessionState`] - observable lifecycle state
//! - [`admission`] - per-client concurrent session cap
//! - [`store`] - where the admission counter lives (process or shared file)
//! - [`controller`] - drives one session over reconnecting transports

pub mod admission;
pub mod controller;
pub mod store;

use std::time::Duration;

use serde_json::{Map, Value};

use crate::protocol::{InitMessage, IDE_CONTENT_KEY, IDE_LANG_KEY};

pub use admission::{AdmissionLease, Clock, SessionAdmission, SystemClock};
pub use controller::{ControllerOptions, Disposer, PeerIdListener, SessionController, SessionHandle};
pub use store::{AdmissionRecord, AdmissionStore, FileStore, MemoryStore};

/// Reconnect value meaning "disabled".
pub const RECONNECT_DISABLED: f64 = -1.0;

/// One logical terminal interaction.
///
/// Survives reconnects: only the transport is recreated.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Query-string style arguments for the remote command.
    pub arguments: String,
    /// Credential sent in the handshake.
    pub auth_token: String,
    /// Free-form payload; `IdeLang` + `IdeContent` mark a compile-and-run session.
    pub payload: Map<String, Value>,
    /// Auto-reconnect delay in seconds; non-positive disables.
    pub reconnect_seconds: f64,
    /// Peer identifier this session was opened for, if any.
    pub peer_id: Option<String>,
}

impl Session {
    /// New interactive or compile-and-run session with reconnect disabled.
    pub fn new(
        arguments: impl Into<String>,
        auth_token: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            arguments: arguments.into(),
            auth_token: auth_token.into(),
            payload,
            reconnect_seconds: RECONNECT_DISABLED,
            peer_id: None,
        }
    }

    /// Attach the peer identifier the session was opened for.
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Whether the payload describes a one-shot compilation.
    pub fn is_compile_and_run(&self) -> bool {
        is_truthy(self.payload.get(IDE_LANG_KEY)) && is_truthy(self.payload.get(IDE_CONTENT_KEY))
    }

    /// Delay before reconnecting, `None` when reconnect is disabled.
    ///
    /// Values too large for a [`Duration`] also disable reconnect.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        if self.reconnect_seconds <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.reconnect_seconds).ok()
    }

    /// Handshake frame for a new transport.
    pub fn init_message(&self) -> InitMessage {
        InitMessage {
            arguments: self.arguments.clone(),
            auth_token: self.auth_token.clone(),
            payload: self.payload.clone(),
        }
    }

    /// `": jid-<id>"` when opened for a peer, otherwise empty.
    pub fn peer_suffix(&self) -> String {
        self.peer_id
            .as_deref()
            .map(|id| format!(": jid-{id}"))
            .unwrap_or_default()
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Observable lifecycle of a [`SessionController`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Constructed, not started.
    #[default]
    Idle,
    /// Admission granted.
    Admitted,
    /// Transport created and opening.
    Connecting,
    /// Handshake sent, traffic flowing.
    Streaming,
    /// Transport closed.
    Closed {
        /// Whether a reconnect timer is running.
        reconnect_pending: bool,
    },
    /// Admission refused; nothing was allocated.
    Denied,
    /// Torn down by the disposer.
    Disposed,
}

impl SessionState {
    /// Whether nothing further will happen without outside action.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Closed {
                reconnect_pending: false
            } | Self::Denied
                | Self::Disposed
        )
    }
}
