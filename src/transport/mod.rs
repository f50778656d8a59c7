//! Duplex message transport consumed by the session controller.
//!
//! A [`Transport`] carries text frames to and from the remote terminal
//! server. Notifications are delivered through handlers registered before
//! [`Transport::open`]; each event kind has a single consumer, and
//! registering again replaces the previous handler.
//!
//! ```text
//! TransportFactory::create()
//!     │
//!     ├── on_open(handler)     ─┐
//!     ├── on_receive(handler)   ├─ wiring, before open
//!     ├── on_close(handler)    ─┘
//!     │
//!     └── open() ──► Open ──► Message* ──► Close(code)
//! ```
//!
//! Transport-level failures never surface as errors: they arrive as a
//! close notification carrying a close code (1006 when the connection
//! could not be established or dropped without a close frame).

pub mod websocket;

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Details of a transport close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket-style close code.
    pub code: u16,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

impl CloseInfo {
    /// Build a close notification.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Handler fired once the transport is open.
pub type OpenHandler = Box<dyn FnMut() + Send>;
/// Handler fired for every received text frame.
pub type ReceiveHandler = Box<dyn FnMut(String) + Send>;
/// Handler fired once when the transport closes.
pub type CloseHandler = Box<dyn FnMut(CloseInfo) + Send>;

/// Errors from transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Send attempted before the transport opened.
    NotOpen,
    /// Transport already closed.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOpen => write!(f, "Transport not open"),
            Self::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A duplex, text-framed connection to the terminal server.
pub trait Transport: Send + std::fmt::Debug {
    /// Start connecting. Handlers must already be registered.
    fn open(&mut self);

    /// Close the connection. Safe to call in any state.
    fn close(&mut self);

    /// Queue a text frame. Delivery is best-effort, at most once.
    fn send(&mut self, data: &str) -> Result<(), TransportError>;

    /// Whether the transport is open.
    fn is_open(&self) -> bool;

    /// Whether the transport has closed.
    fn is_closed(&self) -> bool;

    /// Register the open handler.
    fn on_open(&mut self, handler: OpenHandler);

    /// Register the receive handler.
    fn on_receive(&mut self, handler: ReceiveHandler);

    /// Register the close handler.
    fn on_close(&mut self, handler: CloseHandler);
}

/// Creates a fresh [`Transport`] for each connection attempt.
pub trait TransportFactory: Send + std::fmt::Debug {
    /// Build a new, unopened transport.
    fn create(&mut self) -> Box<dyn Transport>;
}
