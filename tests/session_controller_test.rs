// Integration tests for the session controller
//
// These tests drive SessionController against in-memory doubles:
// - MockNet records every transport the factory creates, the frames sent
//   on it, and keeps its handlers so a test can fire open/receive/close
// - MockSurface records everything written to the terminal
// - MockTelemetry records the mirrored traffic
//
// All tests run on a paused tokio clock, so keep-alive and reconnect
// timers are exercised without real waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use serde_json::{Map, Value};

use webtty::constants::{
    CLOSED_BY_REMOTE, CLOSED_NO_STATUS, CONNECTION_CLOSED_STATUS, UNAVAILABLE_SEPARATOR,
};
use webtty::protocol::{self, InboundTag, IDE_CONTENT_KEY, IDE_LANG_KEY};
use webtty::session::{SessionAdmission, SessionController, SessionHandle, SessionState};
use webtty::telemetry::{Closer, TelemetrySink, KIND_INPUT, KIND_OUTPUT};
use webtty::terminal::{
    EventBus, EventHandler, InputHandler, ListenerId, ResizeHandler, SurfaceEvent, TerminalSize,
    TerminalSurface, SLAVE_INPUT_EVENT,
};
use webtty::transport::{
    CloseHandler, CloseInfo, OpenHandler, ReceiveHandler, Transport, TransportError,
    TransportFactory,
};
use webtty::Session;

// ============================================================================
// Transport double
// ============================================================================

#[derive(Default)]
struct Endpoint {
    sent: Vec<String>,
    open_calls: usize,
    close_calls: usize,
    open: bool,
    closed: bool,
    on_open: Option<OpenHandler>,
    on_receive: Option<ReceiveHandler>,
    on_close: Option<CloseHandler>,
}

#[derive(Clone, Default)]
struct MockNet {
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
}

impl MockNet {
    fn created(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    fn sent(&self, index: usize) -> Vec<String> {
        self.endpoints.lock().unwrap()[index].sent.clone()
    }

    fn close_calls(&self, index: usize) -> usize {
        self.endpoints.lock().unwrap()[index].close_calls
    }

    fn open_calls(&self, index: usize) -> usize {
        self.endpoints.lock().unwrap()[index].open_calls
    }

    fn fire_open(&self, index: usize) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = &mut endpoints[index];
        endpoint.open = true;
        if let Some(handler) = endpoint.on_open.as_mut() {
            handler();
        }
    }

    fn fire_receive(&self, index: usize, frame: &str) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(handler) = endpoints[index].on_receive.as_mut() {
            handler(frame.to_string());
        }
    }

    fn fire_close(&self, index: usize, code: u16) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = &mut endpoints[index];
        endpoint.open = false;
        endpoint.closed = true;
        if let Some(handler) = endpoint.on_close.as_mut() {
            handler(CloseInfo::new(code, ""));
        }
    }

    fn pings(&self, index: usize) -> usize {
        let ping = protocol::ping_frame();
        self.sent(index).iter().filter(|f| **f == ping).count()
    }
}

#[derive(Debug)]
struct MockTransport {
    net: MockNet,
    index: usize,
}

impl std::fmt::Debug for MockNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNet").finish_non_exhaustive()
    }
}

impl MockTransport {
    fn with<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> R {
        let mut endpoints = self.net.endpoints.lock().unwrap();
        f(&mut endpoints[self.index])
    }
}

impl Transport for MockTransport {
    fn open(&mut self) {
        self.with(|e| e.open_calls += 1);
    }

    fn close(&mut self) {
        self.with(|e| {
            e.close_calls += 1;
            e.open = false;
            e.closed = true;
        });
    }

    fn send(&mut self, data: &str) -> Result<(), TransportError> {
        self.with(|e| {
            if e.open {
                e.sent.push(data.to_string());
                Ok(())
            } else if e.closed {
                Err(TransportError::Closed)
            } else {
                Err(TransportError::NotOpen)
            }
        })
    }

    fn is_open(&self) -> bool {
        self.with(|e| e.open)
    }

    fn is_closed(&self) -> bool {
        self.with(|e| e.closed)
    }

    fn on_open(&mut self, handler: OpenHandler) {
        self.with(|e| e.on_open = Some(handler));
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        self.with(|e| e.on_receive = Some(handler));
    }

    fn on_close(&mut self, handler: CloseHandler) {
        self.with(|e| e.on_close = Some(handler));
    }
}

#[derive(Debug)]
struct MockFactory {
    net: MockNet,
}

impl TransportFactory for MockFactory {
    fn create(&mut self) -> Box<dyn Transport> {
        let mut endpoints = self.net.endpoints.lock().unwrap();
        endpoints.push(Endpoint::default());
        Box::new(MockTransport {
            net: self.net.clone(),
            index: endpoints.len() - 1,
        })
    }
}

// ============================================================================
// Surface double
// ============================================================================

#[derive(Default)]
struct Screen {
    output: Vec<String>,
    messages: Vec<String>,
    titles: Vec<String>,
    preferences: Vec<Value>,
    resets: usize,
    deactivations: usize,
    input: Option<InputHandler>,
    resize: Option<ResizeHandler>,
}

#[derive(Clone, Default)]
struct MockScreen {
    screen: Arc<Mutex<Screen>>,
    events: EventBus,
}

impl MockScreen {
    fn output(&self) -> Vec<String> {
        self.screen.lock().unwrap().output.clone()
    }

    fn output_text(&self) -> String {
        self.output().concat()
    }

    fn type_input(&self, text: &str) {
        if let Some(handler) = self.screen.lock().unwrap().input.as_mut() {
            handler(text.to_string());
        }
    }

    fn resize(&self, columns: u16, rows: u16) {
        if let Some(handler) = self.screen.lock().unwrap().resize.as_mut() {
            handler(columns, rows);
        }
    }
}

struct MockSurface {
    shared: MockScreen,
}

impl TerminalSurface for MockSurface {
    fn info(&self) -> TerminalSize {
        TerminalSize {
            columns: 120,
            rows: 40,
        }
    }

    fn output(&mut self, data: &str) {
        self.shared.screen.lock().unwrap().output.push(data.to_string());
    }

    fn show_message(&mut self, message: &str, _timeout: Duration) {
        self.shared
            .screen
            .lock()
            .unwrap()
            .messages
            .push(message.to_string());
    }

    fn remove_message(&mut self) {}

    fn set_window_title(&mut self, title: &str) {
        self.shared.screen.lock().unwrap().titles.push(title.to_string());
    }

    fn set_preferences(&mut self, preferences: &Value) {
        self.shared
            .screen
            .lock()
            .unwrap()
            .preferences
            .push(preferences.clone());
    }

    fn on_input(&mut self, handler: InputHandler) {
        self.shared.screen.lock().unwrap().input = Some(handler);
    }

    fn on_resize(&mut self, handler: ResizeHandler) {
        self.shared.screen.lock().unwrap().resize = Some(handler);
    }

    fn reset(&mut self) {
        self.shared.screen.lock().unwrap().resets += 1;
    }

    fn hard_reset(&mut self) {}

    fn add_event_listener(&mut self, event: &str, handler: EventHandler) -> ListenerId {
        self.shared.events.add(event, handler)
    }

    fn remove_event_listener(&mut self, event: &str, id: ListenerId) {
        self.shared.events.remove(event, id);
    }

    fn dispatch_event(&mut self, event: &str, detail: &SurfaceEvent) {
        self.shared.events.dispatch(event, detail);
    }

    fn deactivate(&mut self) {
        self.shared.screen.lock().unwrap().deactivations += 1;
    }

    fn close(&mut self) {}
}

// ============================================================================
// Telemetry double
// ============================================================================

#[derive(Debug, Default)]
struct Traffic {
    opened: usize,
    closed: usize,
    records: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct MockTelemetry {
    traffic: Arc<Mutex<Traffic>>,
}

impl TelemetrySink for MockTelemetry {
    fn open(&mut self) -> Closer {
        self.traffic.lock().unwrap().opened += 1;
        let traffic = Arc::clone(&self.traffic);
        Box::new(move || traffic.lock().unwrap().closed += 1)
    }

    fn notify(&mut self, kind: &str, payload: &str) {
        self.traffic
            .lock()
            .unwrap()
            .records
            .push((kind.to_string(), payload.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    net: MockNet,
    screen: MockScreen,
    telemetry: MockTelemetry,
    admission: SessionAdmission,
    peers: Arc<Mutex<Vec<String>>>,
    handle: SessionHandle,
}

fn start(session: Session, admission: SessionAdmission) -> Harness {
    let net = MockNet::default();
    let screen = MockScreen::default();
    let telemetry = MockTelemetry::default();
    let peers = Arc::new(Mutex::new(Vec::new()));

    let peer_log = Arc::clone(&peers);
    let handle = SessionController::new(
        session,
        Box::new(MockSurface {
            shared: screen.clone(),
        }),
        Box::new(MockFactory { net: net.clone() }),
        admission.clone(),
    )
    .telemetry(Box::new(telemetry.clone()))
    .on_peer_id(Box::new(move |jid| peer_log.lock().unwrap().push(jid.to_string())))
    .start();

    Harness {
        net,
        screen,
        telemetry,
        admission,
        peers,
        handle,
    }
}

fn interactive() -> Session {
    Session::new("cmd=bash", "token-1", Map::new())
}

fn compile_and_run() -> Session {
    let mut payload = Map::new();
    payload.insert(IDE_LANG_KEY.into(), "rust".into());
    payload.insert(IDE_CONTENT_KEY.into(), "fn main() {}".into());
    Session::new("", "token-1", payload)
}

/// Let the controller task drain its event queue.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn output_frame(text: &str) -> String {
    protocol::encode(
        InboundTag::Output.as_char(),
        &base64::engine::general_purpose::STANDARD.encode(text),
    )
}

async fn open_first(h: &Harness) {
    settle().await;
    h.net.fire_open(0);
    settle().await;
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_denied_session_allocates_nothing() {
    let admission = SessionAdmission::new(1, 15);
    admission.increment();

    let mut h = start(interactive(), admission);
    settle().await;

    assert_eq!(h.handle.closed().await, SessionState::Denied);
    assert_eq!(h.net.created(), 0);
    let output = h.screen.output();
    assert_eq!(output.len(), 1);
    assert!(output[0].starts_with("Maximum no of connections reached"));
    assert!(output[0].ends_with("try after 15 Minutes."));
    assert_eq!(h.telemetry.traffic.lock().unwrap().opened, 0);

    // Disposing a denied session touches nothing
    h.handle.dispose();
    h.handle.dispose();
    assert_eq!(h.admission.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_admission_counted_on_open_and_released_on_close() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    settle().await;
    assert_eq!(h.admission.count(), 0);
    assert_eq!(h.handle.state(), SessionState::Connecting);

    h.net.fire_open(0);
    settle().await;
    assert_eq!(h.admission.count(), 1);
    assert_eq!(h.handle.state(), SessionState::Streaming);

    h.net.fire_close(0, 1000);
    settle().await;
    assert_eq!(h.admission.count(), 0);
}

// ============================================================================
// Outbound traffic
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_handshake_then_resize_then_input() {
    let session = interactive();
    let handshake = session.init_message().to_frame();
    let h = start(session, SessionAdmission::new(1, 15));
    open_first(&h).await;

    h.screen.type_input("ls\r");
    settle().await;

    let sent = h.net.sent(0);
    assert_eq!(sent[0], handshake);
    assert_eq!(sent[1], protocol::resize_frame(120, 40));
    assert_eq!(sent[2], protocol::input_frame("ls\r"));

    let traffic = h.telemetry.traffic.lock().unwrap();
    assert_eq!(traffic.opened, 1);
    assert!(traffic
        .records
        .contains(&(KIND_INPUT.to_string(), "ls\r".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_resize_forwarded_while_streaming() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;

    h.screen.resize(90, 30);
    settle().await;
    assert_eq!(
        h.net.sent(0).last().cloned(),
        Some(protocol::resize_frame(90, 30))
    );
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_every_interval() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    assert_eq!(h.net.pings(0), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(h.net.pings(0), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(h.net.pings(0), 2);

    // Keep-alive stops with the transport
    h.net.fire_close(0, 1000);
    settle().await;
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(h.net.pings(0), 2);
}

#[tokio::test(start_paused = true)]
async fn test_input_after_close_is_not_forwarded() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_close(0, 1000);
    settle().await;

    let before = h.net.sent(0).len();
    h.screen.type_input("x");
    settle().await;
    assert_eq!(h.net.sent(0).len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_slave_input_forwarded() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    assert_eq!(h.screen.events.listener_count(SLAVE_INPUT_EVENT), 1);

    h.screen
        .events
        .dispatch(SLAVE_INPUT_EVENT, &SurfaceEvent::input("echo hi\r"));
    h.screen.events.dispatch(
        SLAVE_INPUT_EVENT,
        &SurfaceEvent {
            kind: "other".into(),
            data: "ignored".into(),
        },
    );
    settle().await;

    let sent = h.net.sent(0);
    assert_eq!(sent.last().cloned(), Some(protocol::input_frame("echo hi\r")));
    assert!(!sent.contains(&protocol::input_frame("ignored")));
}

// ============================================================================
// Inbound traffic
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_dispatch_to_surface() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;

    h.net.fire_receive(0, &output_frame("hello\r\n"));
    h.net.fire_receive(
        0,
        &protocol::encode(
            InboundTag::SetWindowTitle.as_char(),
            "<x><title>bash@host</title><jid>42</jid></x>",
        ),
    );
    h.net.fire_receive(
        0,
        &protocol::encode(InboundTag::SetPreferences.as_char(), r#"{"font-size":14}"#),
    );
    h.net.fire_receive(0, &protocol::encode(InboundTag::Pong.as_char(), ""));
    settle().await;

    assert_eq!(h.screen.output(), vec!["hello\r\n".to_string()]);
    let screen = h.screen.screen.lock().unwrap();
    assert_eq!(screen.titles, vec!["bash@host".to_string()]);
    assert_eq!(screen.preferences, vec![serde_json::json!({"font-size": 14})]);
    drop(screen);
    assert_eq!(*h.peers.lock().unwrap(), vec!["42".to_string()]);

    let traffic = h.telemetry.traffic.lock().unwrap();
    assert!(traffic
        .records
        .contains(&(KIND_OUTPUT.to_string(), "hello\r\n".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_output_split_across_frames() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;

    let bytes = "é".as_bytes();
    for chunk in [&bytes[..1], &bytes[1..]] {
        let frame = protocol::encode(
            InboundTag::Output.as_char(),
            &base64::engine::general_purpose::STANDARD.encode(chunk),
        );
        h.net.fire_receive(0, &frame);
    }
    settle().await;
    assert_eq!(h.screen.output_text(), "é");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;

    h.net.fire_receive(0, "");
    h.net.fire_receive(0, "1not base64!");
    h.net.fire_receive(0, "4{broken");
    h.net.fire_receive(0, "5\"soon\"");
    h.net.fire_receive(0, &output_frame("still here"));
    settle().await;

    assert_eq!(h.screen.output_text(), "still here");
    assert_eq!(h.handle.state(), SessionState::Streaming);
}

// ============================================================================
// Close handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_normal_close_names_peer() {
    let mut h = start(
        interactive().with_peer_id("7"),
        SessionAdmission::new(1, 15),
    );
    open_first(&h).await;
    h.net.fire_close(0, 1000);
    settle().await;

    assert_eq!(
        h.screen.output_text(),
        format!("{CLOSED_BY_REMOTE}: jid-7")
    );
    let screen = h.screen.screen.lock().unwrap();
    assert_eq!(screen.messages, vec![CONNECTION_CLOSED_STATUS.to_string()]);
    assert_eq!(screen.deactivations, 1);
    drop(screen);
    assert_eq!(
        h.handle.closed().await,
        SessionState::Closed {
            reconnect_pending: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_without_status() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_close(0, 1005);
    settle().await;
    assert_eq!(h.screen.output_text(), CLOSED_NO_STATUS);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_adds_unavailable_hint() {
    let h = start(interactive().with_peer_id("9"), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_close(0, 1006);
    settle().await;

    assert_eq!(
        h.screen.output(),
        vec![
            CLOSED_BY_REMOTE.to_string(),
            UNAVAILABLE_SEPARATOR.to_string(),
            "\r\nResource: jid-9 unavailable, Please try again after some time.".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_compile_session_abnormal_close_has_no_hint() {
    let h = start(compile_and_run(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_close(0, 1006);
    settle().await;
    assert_eq!(h.screen.output(), vec![CLOSED_BY_REMOTE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_before_open() {
    let mut h = start(interactive(), SessionAdmission::new(1, 15));
    settle().await;
    h.net.fire_close(0, 1006);
    settle().await;

    assert_eq!(h.admission.count(), 0);
    assert!(h.screen.output_text().starts_with(CLOSED_BY_REMOTE));
    assert_eq!(
        h.handle.closed().await,
        SessionState::Closed {
            reconnect_pending: false
        }
    );
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_delay_without_admission_check() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "5"));
    settle().await;

    h.net.fire_close(0, 1006);
    settle().await;
    assert_eq!(
        h.handle.state(),
        SessionState::Closed {
            reconnect_pending: true
        }
    );

    // Another client fills the only slot meanwhile
    h.admission.increment();
    assert!(!h.admission.is_valid());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.net.created(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.net.created(), 2);
    assert_eq!(h.net.open_calls(1), 1);
    assert_eq!(h.screen.screen.lock().unwrap().resets, 1);
    assert_eq!(h.handle.state(), SessionState::Connecting);

    h.net.fire_open(1);
    settle().await;
    assert_eq!(h.handle.state(), SessionState::Streaming);
    assert_eq!(h.net.sent(1)[0], interactive().init_message().to_frame());
    assert_eq!(h.screen.events.listener_count(SLAVE_INPUT_EVENT), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reacquires_admission_per_transport() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    assert_eq!(h.admission.count(), 1);

    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "1"));
    h.net.fire_close(0, 1006);
    settle().await;
    assert_eq!(h.admission.count(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.net.created(), 2);
    assert_eq!(h.admission.count(), 0);

    h.net.fire_open(1);
    settle().await;
    assert_eq!(h.admission.count(), 1);

    let admission = h.admission.clone();
    h.handle.shutdown().await;
    assert_eq!(admission.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_reconnect_delay_disables_reconnect() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "51e300"));
    settle().await;

    h.net.fire_close(0, 1006);
    settle().await;
    assert_eq!(
        h.handle.state(),
        SessionState::Closed {
            reconnect_pending: false
        }
    );
    assert!(h.screen.output_text().starts_with(CLOSED_BY_REMOTE));

    let telemetry = h.telemetry.clone();
    let state = h.handle.subscribe();
    h.handle.shutdown().await;
    assert_eq!(*state.borrow(), SessionState::Disposed);
    assert_eq!(telemetry.traffic.lock().unwrap().closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_disabled_by_server() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "5"));
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "-1"));
    settle().await;

    h.net.fire_close(0, 1000);
    settle().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.net.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_transport_events_ignored() {
    let h = start(interactive(), SessionAdmission::new(2, 15));
    open_first(&h).await;
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "1"));
    h.net.fire_close(0, 1006);
    settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.net.created(), 2);

    let output_before = h.screen.output().len();
    h.net.fire_receive(0, &output_frame("ghost"));
    h.net.fire_close(0, 1006);
    h.net.fire_open(0);
    settle().await;

    assert_eq!(h.screen.output().len(), output_before);
    assert_eq!(h.handle.state(), SessionState::Connecting);
    assert_eq!(h.admission.count(), 0);
}

// ============================================================================
// Dispose
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispose_is_idempotent() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    assert_eq!(h.admission.count(), 1);

    let disposer = h.handle.disposer();
    disposer.dispose();
    h.handle.dispose();
    disposer.dispose();

    let net = h.net.clone();
    let admission = h.admission.clone();
    let telemetry = h.telemetry.clone();
    let state = h.handle.subscribe();
    h.handle.shutdown().await;

    assert_eq!(*state.borrow(), SessionState::Disposed);
    assert_eq!(admission.count(), 0);
    assert_eq!(net.close_calls(0), 1);
    let traffic = telemetry.traffic.lock().unwrap();
    assert_eq!(traffic.opened, 1);
    assert_eq!(traffic.closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_after_close_does_not_decrement_again() {
    let admission = SessionAdmission::new(2, 15);
    let h = start(interactive(), admission.clone());
    open_first(&h).await;

    // Another session holds a slot
    admission.increment();
    assert_eq!(admission.count(), 2);

    h.net.fire_close(0, 1000);
    settle().await;
    assert_eq!(admission.count(), 1);

    let net = h.net.clone();
    h.handle.shutdown().await;
    assert_eq!(admission.count(), 1);
    assert_eq!(net.close_calls(0), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_pending_reconnect() {
    let h = start(interactive(), SessionAdmission::new(1, 15));
    open_first(&h).await;
    h.net.fire_receive(0, &protocol::encode(InboundTag::SetReconnect.as_char(), "5"));
    h.net.fire_close(0, 1006);
    settle().await;

    let net = h.net.clone();
    let screen = h.screen.clone();
    h.handle.shutdown().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(net.created(), 1);
    assert_eq!(screen.events.listener_count(SLAVE_INPUT_EVENT), 0);
}
