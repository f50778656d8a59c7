//! Session controller: binds a terminal surface to reconnecting transports.
//!
//! # State machine
//!
//! ```text
//! Idle ──start()──► Admitted ──► Connecting ──open──► Streaming ──close──► Closed
//!   │                               ▲                                       │
//!   │ admission refused             └──── reconnect timer (no re-check) ────┘
//!   ▼
//! Denied
//!
//! any state ──dispose──► Disposed
//! ```
//!
//! # Event loop
//!
//! [`SessionController::start`] spawns one tokio task. Transport and
//! surface handlers only push a `ControllerEvent` into the task's channel;
//! the task owns every piece of mutable state and multiplexes that channel
//! with the keep-alive interval, the reconnect sleep and the dispose token
//! in a single `tokio::select!` loop. Reconnecting is one more iteration of
//! that loop, so stack depth stays flat however many times it happens.
//!
//! Each transport gets a generation number. Events carrying an older
//! generation come from a transport that has already been replaced and are
//! dropped.
//!
//! # Admission pairing
//!
//! The controller holds at most one [`AdmissionLease`], acquired when a
//! transport opens and released when that transport closes or the session
//! is disposed. Releasing consumes the lease, so no path can decrement twice.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionLease, SessionAdmission};
use super::{Session, SessionState};
use crate::constants::{
    self, CLOSED_BY_REMOTE, CLOSED_NO_STATUS, CLOSE_MESSAGE_TIMEOUT, CONNECTION_CLOSED_STATUS,
    KEEPALIVE_INTERVAL, UNAVAILABLE_SEPARATOR,
};
use crate::protocol::{self, InboundMessage, OutputDecoder, WindowTitle};
use crate::telemetry::{Closer, NullTelemetry, TelemetrySink, KIND_INPUT, KIND_OUTPUT};
use crate::terminal::{
    ListenerId, TerminalSize, TerminalSurface, INPUT_EVENT_KIND, SLAVE_INPUT_EVENT,
};
use crate::transport::{CloseInfo, Transport, TransportFactory, CLOSE_NORMAL, CLOSE_NO_STATUS};

/// Callback receiving every peer identifier announced in a window title.
pub type PeerIdListener = Box<dyn FnMut(&str) + Send>;

/// Timing knobs for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Display time of the "Connection Closed" status.
    pub close_message_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            close_message_timeout: CLOSE_MESSAGE_TIMEOUT,
        }
    }
}

/// Everything that reaches the controller task from outside.
#[derive(Debug)]
enum ControllerEvent {
    Opened(u64),
    Received(u64, String),
    Closed(u64, CloseInfo),
    Input(String),
    SlaveInput(String),
    Resize(TerminalSize),
}

/// Tears a session down. Cloneable, idempotent, callable from any thread.
#[derive(Debug, Clone, Default)]
pub struct Disposer {
    token: Option<CancellationToken>,
}

impl Disposer {
    /// A disposer with nothing to tear down.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Request disposal. Further calls have no effect.
    pub fn dispose(&self) {
        match &self.token {
            Some(token) => token.cancel(),
            None => log::debug!("[session] Dispose on a session that never started"),
        }
    }
}

/// Handle returned by [`SessionController::start`].
#[derive(Debug)]
pub struct SessionHandle {
    disposer: Disposer,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Cloneable disposer for this session.
    pub fn disposer(&self) -> Disposer {
        self.disposer.clone()
    }

    /// Request disposal.
    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches a final state and return it.
    pub async fn closed(&mut self) -> SessionState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if current.is_final() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }

    /// Dispose and wait for the controller task to finish.
    pub async fn shutdown(mut self) {
        self.dispose();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[session] Controller task ended abnormally: {e}");
            }
        }
    }
}

/// Drives one [`Session`] over a sequence of transports.
pub struct SessionController {
    session: Session,
    surface: Box<dyn TerminalSurface>,
    factory: Box<dyn TransportFactory>,
    telemetry: Box<dyn TelemetrySink>,
    admission: SessionAdmission,
    options: ControllerOptions,
    peer_listener: Option<PeerIdListener>,

    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    transport: Option<Box<dyn Transport>>,
    generation: u64,
    streaming: bool,
    lease: Option<AdmissionLease>,
    keepalive: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    slave_listener: Option<ListenerId>,
    output: OutputDecoder,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session", &self.session)
            .field("state", &*self.state_rx.borrow())
            .field("generation", &self.generation)
            .field("leased", &self.lease.is_some())
            .field("reconnect_pending", &self.reconnect.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Controller for `session`, drawing transports from `factory`.
    pub fn new(
        session: Session,
        surface: Box<dyn TerminalSurface>,
        factory: Box<dyn TransportFactory>,
        admission: SessionAdmission,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            session,
            surface,
            factory,
            telemetry: Box::new(NullTelemetry),
            admission,
            options: ControllerOptions::default(),
            peer_listener: None,
            state_tx,
            state_rx,
            transport: None,
            generation: 0,
            streaming: false,
            lease: None,
            keepalive: None,
            reconnect: None,
            slave_listener: None,
            output: OutputDecoder::new(),
        }
    }

    /// Mirror traffic into `sink`.
    pub fn telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Override timing.
    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Receive peer identifiers from window-title messages.
    pub fn on_peer_id(mut self, listener: PeerIdListener) -> Self {
        self.peer_listener = Some(listener);
        self
    }

    /// Check admission and, if granted, start the session task.
    ///
    /// When admission is refused a single explanatory output is written to
    /// the surface, nothing is allocated, and the returned handle's
    /// disposer does nothing.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(mut self) -> SessionHandle {
        if !self.admission.is_valid() {
            let minutes = self.admission.remaining_minutes();
            log::warn!(
                "[session] Admission refused: {}/{} sessions open, window resets in {minutes} min",
                self.admission.count(),
                self.admission.limit()
            );
            self.term_output(&constants::admission_denied(minutes));
            self.set_state(SessionState::Denied);
            return SessionHandle {
                disposer: Disposer::noop(),
                state: self.state_rx.clone(),
                task: None,
            };
        }

        self.set_state(SessionState::Admitted);
        let token = CancellationToken::new();
        let state = self.state_rx.clone();
        let task = tokio::spawn(self.run(token.clone()));

        SessionHandle {
            disposer: Disposer { token: Some(token) },
            state,
            task: Some(task),
        }
    }

    async fn run(mut self, token: CancellationToken) {
        let closer = self.telemetry.open();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        self.connect(&events_tx);

        loop {
            tokio::select! {
                biased;

                () = token.cancelled() => break,

                Some(event) = events_rx.recv() => self.handle_event(event, &events_tx),

                () = next_keepalive(&mut self.keepalive) => {
                    self.send_frame(&protocol::ping_frame());
                }

                () = reconnect_due(&mut self.reconnect) => {
                    self.reconnect = None;
                    log::info!("[session] Reconnecting");
                    self.surface.reset();
                    self.connect(&events_tx);
                }
            }
        }

        self.dispose(closer);
    }

    /// Create, wire and open a fresh transport.
    fn connect(&mut self, events: &mpsc::UnboundedSender<ControllerEvent>) {
        self.generation += 1;
        let generation = self.generation;
        let mut transport = self.factory.create();

        let tx = events.clone();
        transport.on_open(Box::new(move || {
            let _ = tx.send(ControllerEvent::Opened(generation));
        }));
        let tx = events.clone();
        transport.on_receive(Box::new(move |data| {
            let _ = tx.send(ControllerEvent::Received(generation, data));
        }));
        let tx = events.clone();
        transport.on_close(Box::new(move |info| {
            let _ = tx.send(ControllerEvent::Closed(generation, info));
        }));

        log::info!("[session] Opening transport #{generation}");
        self.set_state(SessionState::Connecting);
        transport.open();
        self.transport = Some(transport);
    }

    fn handle_event(
        &mut self,
        event: ControllerEvent,
        events: &mpsc::UnboundedSender<ControllerEvent>,
    ) {
        match event {
            ControllerEvent::Opened(generation) if generation == self.generation => {
                self.on_open(events);
            }
            ControllerEvent::Received(generation, data) if generation == self.generation => {
                self.on_receive(&data);
            }
            ControllerEvent::Closed(generation, info) if generation == self.generation => {
                self.on_close(&info);
            }
            ControllerEvent::Opened(generation)
            | ControllerEvent::Received(generation, _)
            | ControllerEvent::Closed(generation, _) => {
                log::debug!("[session] Ignoring event from stale transport #{generation}");
            }
            ControllerEvent::Input(text) | ControllerEvent::SlaveInput(text) => {
                if self.streaming {
                    self.send_frame(&protocol::input_frame(&text));
                    self.telemetry.notify(KIND_INPUT, &text);
                }
            }
            ControllerEvent::Resize(size) => {
                if self.streaming {
                    self.send_frame(&protocol::resize_frame(size.columns, size.rows));
                }
            }
        }
    }

    fn on_open(&mut self, events: &mpsc::UnboundedSender<ControllerEvent>) {
        let handshake = self.session.init_message().to_frame();
        self.send_frame(&handshake);

        let size = self.surface.info();
        let tx = events.clone();
        self.surface.on_resize(Box::new(move |columns, rows| {
            let _ = tx.send(ControllerEvent::Resize(TerminalSize { columns, rows }));
        }));
        self.send_frame(&protocol::resize_frame(size.columns, size.rows));

        let tx = events.clone();
        self.surface.on_input(Box::new(move |input| {
            let _ = tx.send(ControllerEvent::Input(input));
        }));

        let period = self.options.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive = Some(keepalive);

        self.lease = Some(self.admission.acquire());

        if let Some(id) = self.slave_listener.take() {
            self.surface.remove_event_listener(SLAVE_INPUT_EVENT, id);
        }
        let tx = events.clone();
        let id = self.surface.add_event_listener(
            SLAVE_INPUT_EVENT,
            Box::new(move |event| {
                if event.kind == INPUT_EVENT_KIND {
                    let _ = tx.send(ControllerEvent::SlaveInput(event.data.clone()));
                }
            }),
        );
        self.slave_listener = Some(id);

        self.streaming = true;
        log::info!(
            "[session] Transport #{} open ({}x{})",
            self.generation,
            size.columns,
            size.rows
        );
        self.set_state(SessionState::Streaming);
    }

    fn on_receive(&mut self, data: &str) {
        let message = match InboundMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[session] Dropping malformed frame: {e}");
                return;
            }
        };

        match message {
            InboundMessage::Output(bytes) => {
                let text = self.output.feed(&bytes);
                if !text.is_empty() {
                    self.term_output(&text);
                }
            }
            InboundMessage::Pong => {}
            InboundMessage::SetWindowTitle(WindowTitle { title, jid }) => {
                self.surface.set_window_title(&title);
                log::debug!("[session] Peer identifier received: {jid:?}");
                if let Some(listener) = self.peer_listener.as_mut() {
                    listener(&jid);
                }
            }
            InboundMessage::SetPreferences(preferences) => {
                self.surface.set_preferences(&preferences);
            }
            InboundMessage::SetReconnect(seconds) => {
                log::info!("[session] Enabling reconnect: {seconds} seconds");
                self.session.reconnect_seconds = seconds;
            }
            InboundMessage::Unknown { tag, payload } => {
                log::warn!(
                    "[session] Unsupported message tag {tag:?} ({} bytes)",
                    payload.len()
                );
            }
        }
    }

    fn on_close(&mut self, info: &CloseInfo) {
        self.streaming = false;
        self.keepalive = None;
        self.surface.deactivate();
        self.surface
            .show_message(CONNECTION_CLOSED_STATUS, self.options.close_message_timeout);
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        self.output.reset();

        log::info!(
            "[session] Transport #{} closed: code {} {:?}",
            self.generation,
            info.code,
            info.reason
        );

        let peer = self.session.peer_suffix();
        match info.code {
            CLOSE_NORMAL => self.term_output(&format!("{CLOSED_BY_REMOTE}{peer}")),
            CLOSE_NO_STATUS => self.term_output(CLOSED_NO_STATUS),
            _ => {
                self.term_output(CLOSED_BY_REMOTE);
                if !self.session.is_compile_and_run() {
                    self.term_output(UNAVAILABLE_SEPARATOR);
                    self.term_output(&constants::unavailable_hint(&peer));
                }
            }
        }

        match self.session.reconnect_delay() {
            Some(delay) => {
                log::info!("[session] Reconnect scheduled in {:.1}s", delay.as_secs_f64());
                self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                self.set_state(SessionState::Closed {
                    reconnect_pending: true,
                });
            }
            None => self.set_state(SessionState::Closed {
                reconnect_pending: false,
            }),
        }
    }

    fn dispose(&mut self, closer: Closer) {
        log::info!("[session] Disposing session");
        self.reconnect = None;
        self.keepalive = None;
        self.streaming = false;
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        if let Some(mut transport) = self.transport.take() {
            if !transport.is_closed() {
                transport.close();
            }
        }
        if let Some(id) = self.slave_listener.take() {
            self.surface.remove_event_listener(SLAVE_INPUT_EVENT, id);
        }
        closer();
        self.set_state(SessionState::Disposed);
    }

    fn send_frame(&mut self, frame: &str) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(frame) {
            log::debug!("[session] Outbound frame dropped: {e}");
        }
    }

    fn term_output(&mut self, text: &str) {
        self.surface.output(text);
        self.telemetry.notify(KIND_OUTPUT, text);
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
