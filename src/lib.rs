//! webtty - terminal client for remote shell and compile-and-run sessions.
//!
//! A session streams a remote terminal over a WebSocket using the `webtty`
//! subprotocol: single-character tagged frames carrying base64 output,
//! keystrokes, resize requests and keep-alive pings.
//!
//! # Architecture
//!
//! ```text
//! TerminalSurface ──input/resize──►                    ──frames──► Transport
//!   (StdioSurface)                  SessionController             (WebSocketTransport)
//! TerminalSurface ◄──output/title──                    ◄──frames──
//!                                          │
//!                          SessionAdmission (concurrency cap)
//!                          TelemetrySink   (traffic mirror)
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - frame tags, encoding and inbound message parsing
//! - [`session`] - session model, admission and the controller
//! - [`transport`] - transport abstraction and the WebSocket implementation
//! - [`terminal`] - terminal surface abstraction and the stdio implementation
//! - [`telemetry`] - traffic mirror sinks
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod constants;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use protocol::{InboundMessage, InitMessage, ProtocolError, WindowTitle};
pub use session::{
    ControllerOptions, Disposer, Session, SessionAdmission, SessionController, SessionHandle,
    SessionState,
};
pub use telemetry::{JsonlTelemetry, NullTelemetry, TelemetrySink};
pub use terminal::{TerminalSize, TerminalSurface};
pub use transport::{CloseInfo, Transport, TransportError, TransportFactory};
