//! WebSocket [`Transport`] built on [`crate::ws`].
//!
//! Each opened transport spawns one tokio task that owns the socket. The
//! task reads frames and fires the registered handlers; outgoing frames
//! reach it through an unbounded `mpsc` queue, so [`Transport::send`] never
//! blocks the caller.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE ──open()──► CONNECTING ──handshake ok──► OPEN ──close frame / error──► CLOSED
//!                      │                                        ▲
//!                      └──── connect failed (1006) ─────────────┘
//! ```
//!
//! The close handler fires exactly once for every transport that was
//! opened, including when the connection never got established.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{
    CloseHandler, CloseInfo, OpenHandler, ReceiveHandler, Transport, TransportError,
    TransportFactory, CLOSE_ABNORMAL, CLOSE_NO_STATUS,
};
use crate::ws::{self, WsMessage};

const STATUS_IDLE: u8 = 0;
const STATUS_CONNECTING: u8 = 1;
const STATUS_OPEN: u8 = 2;
const STATUS_CLOSED: u8 = 3;

/// Outgoing command from the transport handle to its socket task.
#[derive(Debug)]
enum WsOutgoing {
    /// Send a UTF-8 text frame.
    Text(String),
    /// Initiate a graceful close.
    Close,
}

/// Handlers moved into the socket task on open.
#[derive(Default)]
struct Handlers {
    on_open: Option<OpenHandler>,
    on_receive: Option<ReceiveHandler>,
    on_close: Option<CloseHandler>,
}

impl Handlers {
    fn opened(&mut self) {
        if let Some(handler) = self.on_open.as_mut() {
            handler();
        }
    }

    fn received(&mut self, data: String) {
        if let Some(handler) = self.on_receive.as_mut() {
            handler(data);
        }
    }

    fn finish(&mut self, status: &AtomicU8, info: CloseInfo) {
        status.store(STATUS_CLOSED, Ordering::SeqCst);
        log::info!("[ws] Connection closed: {} {}", info.code, info.reason);
        if let Some(handler) = self.on_close.as_mut() {
            handler(info);
        }
    }
}

/// A single WebSocket connection to the terminal endpoint.
pub struct WebSocketTransport {
    url: String,
    protocols: Vec<String>,
    status: Arc<AtomicU8>,
    handlers: Handlers,
    send_tx: Option<mpsc::UnboundedSender<WsOutgoing>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("protocols", &self.protocols)
            .field("status", &self.status.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create an unopened transport for a `ws://` / `wss://` URL.
    pub fn new(url: impl Into<String>, protocols: &[&str]) -> Self {
        Self {
            url: url.into(),
            protocols: protocols.iter().map(ToString::to_string).collect(),
            status: Arc::new(AtomicU8::new(STATUS_IDLE)),
            handlers: Handlers::default(),
            send_tx: None,
        }
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self) {
        if self.status.load(Ordering::SeqCst) != STATUS_IDLE {
            log::warn!("[ws] open() called twice for {}", self.url);
            return;
        }

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        self.send_tx = Some(send_tx);
        self.status.store(STATUS_CONNECTING, Ordering::SeqCst);

        let mut handlers = std::mem::take(&mut self.handlers);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(run_connection(
                    self.url.clone(),
                    self.protocols.clone(),
                    Arc::clone(&self.status),
                    handlers,
                    send_rx,
                ));
            }
            Err(e) => {
                log::error!("[ws] No tokio runtime to drive {}: {e}", self.url);
                handlers.finish(&self.status, CloseInfo::new(CLOSE_ABNORMAL, e.to_string()));
            }
        }
    }

    fn close(&mut self) {
        let previous = self.status.swap(STATUS_CLOSED, Ordering::SeqCst);
        if previous == STATUS_CONNECTING || previous == STATUS_OPEN {
            if let Some(tx) = self.send_tx.as_ref() {
                let _ = tx.send(WsOutgoing::Close);
            }
        }
    }

    fn send(&mut self, data: &str) -> Result<(), TransportError> {
        match self.status.load(Ordering::SeqCst) {
            STATUS_OPEN => self
                .send_tx
                .as_ref()
                .ok_or(TransportError::NotOpen)?
                .send(WsOutgoing::Text(data.to_string()))
                .map_err(|_| TransportError::Closed),
            STATUS_CLOSED => Err(TransportError::Closed),
            _ => Err(TransportError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_OPEN
    }

    fn is_closed(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_CLOSED
    }

    fn on_open(&mut self, handler: OpenHandler) {
        self.handlers.on_open = Some(handler);
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        self.handlers.on_receive = Some(handler);
    }

    fn on_close(&mut self, handler: CloseHandler) {
        self.handlers.on_close = Some(handler);
    }
}

/// Drive one socket until it closes, firing handlers along the way.
async fn run_connection(
    url: String,
    protocols: Vec<String>,
    status: Arc<AtomicU8>,
    mut handlers: Handlers,
    mut send_rx: mpsc::UnboundedReceiver<WsOutgoing>,
) {
    let protocol_refs: Vec<&str> = protocols.iter().map(String::as_str).collect();

    log::debug!("[ws] Connecting to {url}");
    let (mut writer, mut reader) = match ws::connect(&url, &protocol_refs).await {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("[ws] Failed to connect to {url}: {e:#}");
            handlers.finish(&status, CloseInfo::new(CLOSE_ABNORMAL, format!("{e:#}")));
            return;
        }
    };

    // close() may have raced the handshake
    if status
        .compare_exchange(STATUS_CONNECTING, STATUS_OPEN, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let _ = writer.send_close().await;
        handlers.finish(
            &status,
            CloseInfo::new(CLOSE_NO_STATUS, "closed before open"),
        );
        return;
    }

    log::info!("[ws] Connected to {url}");
    handlers.opened();

    let info = loop {
        tokio::select! {
            frame = reader.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => handlers.received(text),
                    Some(Ok(WsMessage::Binary(data))) => {
                        handlers.received(String::from_utf8_lossy(&data).into_owned());
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        break CloseInfo::new(code, reason);
                    }
                    Some(Err(e)) => break CloseInfo::new(CLOSE_ABNORMAL, e.to_string()),
                    None => break CloseInfo::new(CLOSE_ABNORMAL, "stream ended"),
                }
            }
            outgoing = send_rx.recv() => {
                match outgoing {
                    Some(WsOutgoing::Text(text)) => {
                        if let Err(e) = writer.send_text(&text).await {
                            break CloseInfo::new(CLOSE_ABNORMAL, format!("{e:#}"));
                        }
                    }
                    Some(WsOutgoing::Close) | None => {
                        let _ = writer.send_close().await;
                        break CloseInfo::new(CLOSE_NO_STATUS, "client requested close");
                    }
                }
            }
        }
    };

    handlers.finish(&status, info);
}

/// Builds [`WebSocketTransport`]s for one session page URL.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    /// Factory for the terminal socket behind `page_url`.
    pub fn new(page_url: &str) -> Self {
        Self {
            url: ws::endpoint_url(page_url),
        }
    }

    /// Socket URL every created transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&mut self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(
            self.url.clone(),
            crate::protocol::PROTOCOLS,
        ))
    }
}
