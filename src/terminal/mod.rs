//! Terminal surface consumed by the session controller.
//!
//! The surface displays remote output, reports its size, and feeds
//! keystrokes and resizes back through handlers. Like the transport, each
//! handler kind has a single consumer: registering again replaces it.
//!
//! Besides direct keyboard input, a surface carries named events. The
//! controller listens for [`SLAVE_INPUT_EVENT`] to pick up text injected
//! by something other than the keyboard (paste helpers, scripted input).

pub mod stdio;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub use stdio::{forward_injected_input, StdioSurface};

/// Event name carrying injected input.
pub const SLAVE_INPUT_EVENT: &str = "slaveinputEvent";

/// `SurfaceEvent::kind` value that marks injected input.
pub const INPUT_EVENT_KIND: &str = "input";

/// Terminal dimensions in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Width in cells.
    pub columns: u16,
    /// Height in cells.
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

/// Detail attached to a named surface event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    /// Event sub-kind (`"input"` for injected input).
    pub kind: String,
    /// Event data.
    pub data: String,
}

impl SurfaceEvent {
    /// Injected input event.
    pub fn input(data: impl Into<String>) -> Self {
        Self {
            kind: INPUT_EVENT_KIND.to_string(),
            data: data.into(),
        }
    }
}

/// Identifies a registered event listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Handler for keyboard input.
pub type InputHandler = Box<dyn FnMut(String) + Send>;
/// Handler for size changes `(columns, rows)`.
pub type ResizeHandler = Box<dyn FnMut(u16, u16) + Send>;
/// Handler for named events.
pub type EventHandler = Box<dyn FnMut(&SurfaceEvent) + Send>;

/// Display and input capability driven by the session controller.
pub trait TerminalSurface: Send {
    /// Current size.
    fn info(&self) -> TerminalSize;

    /// Write remote output.
    fn output(&mut self, data: &str);

    /// Show a transient status message.
    fn show_message(&mut self, message: &str, timeout: Duration);

    /// Hide the status message.
    fn remove_message(&mut self);

    /// Set the window title.
    fn set_window_title(&mut self, title: &str);

    /// Apply server-provided preferences.
    fn set_preferences(&mut self, preferences: &serde_json::Value);

    /// Register the keyboard input handler.
    fn on_input(&mut self, handler: InputHandler);

    /// Register the resize handler.
    fn on_resize(&mut self, handler: ResizeHandler);

    /// Clear the screen, keeping modes.
    fn reset(&mut self);

    /// Full terminal reset.
    fn hard_reset(&mut self);

    /// Subscribe to a named event.
    fn add_event_listener(&mut self, event: &str, handler: EventHandler) -> ListenerId;

    /// Unsubscribe a listener. Unknown ids are ignored.
    fn remove_event_listener(&mut self, event: &str, id: ListenerId);

    /// Deliver a named event to its listeners.
    fn dispatch_event(&mut self, event: &str, detail: &SurfaceEvent);

    /// Stop delivering input.
    fn deactivate(&mut self);

    /// Release the terminal.
    fn close(&mut self);
}

#[derive(Default)]
struct EventBusInner {
    next_id: u64,
    listeners: BTreeMap<String, Vec<(ListenerId, EventHandler)>>,
}

/// Shared registry of named event listeners.
///
/// Cloneable so that injected input can be dispatched from outside the
/// task that owns the surface. Handlers run under the registry lock and
/// must not call back into the bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventBus")
            .field("events", &inner.listeners.keys().collect::<Vec<_>>())
            .field("next_id", &inner.next_id)
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    pub fn add(&self, event: &str, handler: EventHandler) -> ListenerId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a listener, returning whether it existed.
    pub fn remove(&self, event: &str, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.listeners.remove(event);
        }
        removed
    }

    /// Call every listener registered for `event`.
    pub fn dispatch(&self, event: &str, detail: &SurfaceEvent) {
        let mut inner = self.lock();
        if let Some(list) = inner.listeners.get_mut(event) {
            for (_, handler) in list.iter_mut() {
                handler(detail);
            }
        }
    }

    /// Number of listeners for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().listeners.get(event).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventBusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
