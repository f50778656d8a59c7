//! [`TerminalSurface`] backed by the process's own terminal.
//!
//! Puts the terminal in raw mode and forwards stdin bytes verbatim, so
//! control keys (including Ctrl-C) reach the remote shell. `Ctrl-]` is
//! reserved locally as the detach key.
//!
//! Two background OS threads feed the handlers:
//! - a stdin reader (keystrokes → input handler)
//! - a SIGWINCH watcher on unix (size change → resize handler)
//!
//! [`forward_injected_input`] adds an optional third one that replays a
//! file or FIFO as injected input on the surface's [`EventBus`].
//!
//! Raw mode is restored by [`TerminalSurface::close`] or on drop.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::{cursor, execute, queue, terminal};

use super::{
    EventBus, EventHandler, InputHandler, ListenerId, ResizeHandler, SurfaceEvent,
    TerminalSize, TerminalSurface, SLAVE_INPUT_EVENT,
};
use crate::protocol::OutputDecoder;

/// Local detach key (`Ctrl-]`).
pub const DETACH_BYTE: u8 = 0x1d;

/// Handler fired when the user presses the detach key.
pub type DetachHandler = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Shared {
    input: Mutex<Option<InputHandler>>,
    resize: Mutex<Option<ResizeHandler>>,
    detach: Mutex<Option<DetachHandler>>,
    active: AtomicBool,
}

impl Shared {
    fn deliver_input(&self, text: String) {
        if text.is_empty() || !self.active.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = self.input.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            handler(text);
        }
    }

    fn deliver_resize(&self, size: TerminalSize) {
        if let Some(handler) = self.resize.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            handler(size.columns, size.rows);
        }
    }

    fn detach(&self) {
        if let Some(handler) = self.detach.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            handler();
        }
    }
}

/// Raw-mode terminal on stdin/stdout.
pub struct StdioSurface {
    stdout: std::io::Stdout,
    shared: Arc<Shared>,
    events: EventBus,
    raw_mode: bool,
}

impl std::fmt::Debug for StdioSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioSurface")
            .field("raw_mode", &self.raw_mode)
            .field("active", &self.shared.active.load(Ordering::SeqCst))
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl StdioSurface {
    /// Enter raw mode and start the input threads.
    pub fn new() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            ..Shared::default()
        });

        let reader = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("webtty-stdin".into())
            .spawn(move || read_stdin(&reader))
            .context("failed to spawn stdin reader")?;

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGWINCH;
            use signal_hook::iterator::Signals;

            let mut signals = Signals::new([SIGWINCH]).context("failed to watch SIGWINCH")?;
            let watcher = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("webtty-winch".into())
                .spawn(move || {
                    for _ in signals.forever() {
                        watcher.deliver_resize(current_size());
                    }
                })
                .context("failed to spawn resize watcher")?;
        }

        Ok(Self {
            stdout: std::io::stdout(),
            shared,
            events: EventBus::new(),
            raw_mode: true,
        })
    }

    /// Register the detach-key handler.
    pub fn on_detach(&mut self, handler: DetachHandler) {
        *self.shared.detach.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Cloneable handle for dispatching named events from other threads.
    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    fn write_raw(&mut self, data: &str) {
        if let Err(e) = self
            .stdout
            .write_all(data.as_bytes())
            .and_then(|()| self.stdout.flush())
        {
            log::warn!("[terminal] stdout write failed: {e}");
        }
    }

    fn restore(&mut self) {
        if self.raw_mode {
            let _ = terminal::disable_raw_mode();
            self.raw_mode = false;
        }
    }
}

fn current_size() -> TerminalSize {
    terminal::size()
        .map(|(columns, rows)| TerminalSize { columns, rows })
        .unwrap_or_default()
}

fn read_stdin(shared: &Shared) {
    let mut stdin = std::io::stdin().lock();
    let mut decoder = OutputDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) => {
                log::debug!("[terminal] stdin reached EOF");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[terminal] stdin read failed: {e}");
                return;
            }
        };

        let chunk = &buf[..n];
        if let Some(before) = split_at_detach(chunk) {
            shared.deliver_input(decoder.feed(before));
            shared.detach();
            continue;
        }
        shared.deliver_input(decoder.feed(chunk));
    }
}

/// Bytes typed before the detach key, or `None` when `chunk` has none.
///
/// Anything after the detach key is discarded with the session.
fn split_at_detach(chunk: &[u8]) -> Option<&[u8]> {
    chunk
        .iter()
        .position(|&b| b == DETACH_BYTE)
        .map(|pos| &chunk[..pos])
}

/// Replay `source` as injected input on `events`.
///
/// Runs on its own thread until `source` reaches EOF. Line feeds are sent
/// as carriage returns, which is what the Enter key produces in raw mode.
/// Input read before the session is streaming has no listener and is lost.
pub fn forward_injected_input(
    mut source: impl Read + Send + 'static,
    events: EventBus,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("webtty-inject".into())
        .spawn(move || {
            let mut decoder = OutputDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => {
                        log::debug!("[terminal] Injected input reached EOF");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("[terminal] Injected input read failed: {e}");
                        return;
                    }
                };
                let text = decoder.feed(&buf[..n]).replace('\n', "\r");
                if !text.is_empty() {
                    events.dispatch(SLAVE_INPUT_EVENT, &SurfaceEvent::input(text));
                }
            }
        })
        .context("failed to spawn injected input reader")
}

impl TerminalSurface for StdioSurface {
    fn info(&self) -> TerminalSize {
        current_size()
    }

    fn output(&mut self, data: &str) {
        self.write_raw(data);
    }

    fn show_message(&mut self, message: &str, timeout: Duration) {
        log::debug!("[terminal] Status '{message}' for {}ms", timeout.as_millis());
        self.write_raw(&format!("\r\n\x1b[7m {message} \x1b[0m\r\n"));
    }

    fn remove_message(&mut self) {
        // Status lines scroll away with the output
    }

    fn set_window_title(&mut self, title: &str) {
        if let Err(e) = execute!(self.stdout, terminal::SetTitle(title)) {
            log::warn!("[terminal] Failed to set title: {e}");
        }
    }

    fn set_preferences(&mut self, preferences: &serde_json::Value) {
        log::debug!("[terminal] Preferences received: {preferences}");
    }

    fn on_input(&mut self, handler: InputHandler) {
        *self.shared.input.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        self.shared.active.store(true, Ordering::SeqCst);
    }

    fn on_resize(&mut self, handler: ResizeHandler) {
        *self.shared.resize.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn reset(&mut self) {
        let result = queue!(
            self.stdout,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0)
        )
        .and_then(|()| self.stdout.flush());
        if let Err(e) = result {
            log::warn!("[terminal] Failed to clear screen: {e}");
        }
    }

    fn hard_reset(&mut self) {
        // RIS
        self.write_raw("\x1bc");
    }

    fn add_event_listener(&mut self, event: &str, handler: EventHandler) -> ListenerId {
        self.events.add(event, handler)
    }

    fn remove_event_listener(&mut self, event: &str, id: ListenerId) {
        self.events.remove(event, id);
    }

    fn dispatch_event(&mut self, event: &str, detail: &SurfaceEvent) {
        self.events.dispatch(event, detail);
    }

    fn deactivate(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.deactivate();
        self.restore();
        self.write_raw("\r\n");
    }
}

impl Drop for StdioSurface {
    fn drop(&mut self) {
        self.restore();
    }
}
