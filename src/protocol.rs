//! Wire protocol codec for webtty terminal sessions.
//!
//! Every frame after the handshake is a single tag character followed by
//! a tag-specific payload:
//!
//! ```text
//! frame   := tag payload
//! tag     := one character ('0'..'5')
//! payload := UTF-8 text, encoding depends on tag
//! ```
//!
//! Client → server tags:
//! - `'0'`: unknown
//! - `'1'`: input (raw keystroke text)
//! - `'2'`: ping (empty payload)
//! - `'3'`: resize terminal (`{"columns": n, "rows": n}`)
//!
//! Server → client tags:
//! - `'0'`: unknown
//! - `'1'`: output (base64 of raw PTY bytes)
//! - `'2'`: pong
//! - `'3'`: set window title (plain text or `<x><title>..</title><jid>..</jid></x>`)
//! - `'4'`: set preferences (JSON object, passed through to the terminal)
//! - `'5'`: set reconnect (JSON number of seconds, non-positive disables)
//!
//! The handshake ([`InitMessage`]) is the only untagged frame; it is always
//! the first frame a transport sends.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// WebSocket sub-protocols offered when connecting.
pub const PROTOCOLS: &[&str] = &["webtty"];

/// Payload key carrying the language of a compile-and-run session.
pub const IDE_LANG_KEY: &str = "IdeLang";
/// Payload key carrying the source text of a compile-and-run session.
pub const IDE_CONTENT_KEY: &str = "IdeContent";
/// Payload key carrying extra compiler flags for a compile-and-run session.
pub const COMPILER_OPTION_KEY: &str = "CompilerOption";

/// Tags sent from the client to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundTag {
    /// Unrecognised message.
    Unknown,
    /// Keyboard or injected input.
    Input,
    /// Keep-alive ping.
    Ping,
    /// Terminal size change.
    ResizeTerminal,
}

impl OutboundTag {
    /// All outbound tags.
    pub const ALL: [Self; 4] = [Self::Unknown, Self::Input, Self::Ping, Self::ResizeTerminal];

    /// Wire character for this tag.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Unknown => '0',
            Self::Input => '1',
            Self::Ping => '2',
            Self::ResizeTerminal => '3',
        }
    }

    /// Look up a tag by its wire character.
    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_char() == c)
    }
}

/// Tags sent from the server to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTag {
    /// Unrecognised message.
    Unknown,
    /// Base64 terminal output.
    Output,
    /// Reply to a ping.
    Pong,
    /// Window title, optionally carrying a peer identifier.
    SetWindowTitle,
    /// Terminal preferences.
    SetPreferences,
    /// Auto-reconnect delay in seconds.
    SetReconnect,
}

impl InboundTag {
    /// All inbound tags.
    pub const ALL: [Self; 6] = [
        Self::Unknown,
        Self::Output,
        Self::Pong,
        Self::SetWindowTitle,
        Self::SetPreferences,
        Self::SetReconnect,
    ];

    /// Wire character for this tag.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Unknown => '0',
            Self::Output => '1',
            Self::Pong => '2',
            Self::SetWindowTitle => '3',
            Self::SetPreferences => '4',
            Self::SetReconnect => '5',
        }
    }

    /// Look up a tag by its wire character.
    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_char() == c)
    }
}

/// Errors produced while decoding a single inbound frame.
///
/// None of these are fatal to a session: the frame is logged and dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Zero-length frame (no tag character).
    EmptyFrame,
    /// Output payload was not valid base64.
    InvalidBase64(String),
    /// A JSON payload failed to parse.
    InvalidJson {
        /// Tag of the offending frame.
        tag: char,
        /// Parser message.
        message: String,
    },
    /// Reconnect payload parsed but was not a number.
    InvalidReconnect(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFrame => write!(f, "Empty frame"),
            Self::InvalidBase64(msg) => write!(f, "Invalid base64 output: {msg}"),
            Self::InvalidJson { tag, message } => {
                write!(f, "Invalid JSON in frame '{tag}': {message}")
            }
            Self::InvalidReconnect(raw) => write!(f, "Reconnect value is not a number: {raw}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Build a raw frame from a tag character and payload.
///
/// No escaping is applied; the tag is always exactly one leading character.
#[must_use]
pub fn encode(tag: char, payload: &str) -> String {
    let mut frame = String::with_capacity(tag.len_utf8() + payload.len());
    frame.push(tag);
    frame.push_str(payload);
    frame
}

/// Split a raw frame into its tag character and payload.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyFrame`] for a zero-length frame.
pub fn decode(frame: &str) -> Result<(char, &str), ProtocolError> {
    let mut chars = frame.chars();
    let tag = chars.next().ok_or(ProtocolError::EmptyFrame)?;
    Ok((tag, chars.as_str()))
}

/// Handshake sent untagged as the first frame of every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Query-string style arguments forwarded to the remote command.
    #[serde(rename = "Arguments")]
    pub arguments: String,
    /// Credential checked by the server.
    #[serde(rename = "AuthToken")]
    pub auth_token: String,
    /// Free-form session payload (compile-and-run keys live here).
    #[serde(rename = "Payload")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl InitMessage {
    /// Serialize the handshake frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        // A struct of strings and a JSON map always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Resize payload for [`OutboundTag::ResizeTerminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Terminal width in cells.
    pub columns: u16,
    /// Terminal height in cells.
    pub rows: u16,
}

/// Frame carrying keyboard (or injected) input.
#[must_use]
pub fn input_frame(text: &str) -> String {
    encode(OutboundTag::Input.as_char(), text)
}

/// Keep-alive frame.
#[must_use]
pub fn ping_frame() -> String {
    encode(OutboundTag::Ping.as_char(), "")
}

/// Frame announcing a terminal size.
#[must_use]
pub fn resize_frame(columns: u16, rows: u16) -> String {
    let payload = serde_json::to_string(&ResizeRequest { columns, rows }).unwrap_or_default();
    encode(OutboundTag::ResizeTerminal.as_char(), &payload)
}

/// Window title plus the optional peer identifier embedded alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WindowTitle {
    /// Title to display.
    pub title: String,
    /// Peer identifier (`jid`), empty when absent.
    pub jid: String,
}

impl WindowTitle {
    /// Extract title and identifier from a set-window-title payload.
    ///
    /// Payloads that look like markup (`<` after trimming) are parsed as
    /// XML and `title` / `jid` are looked up below the document element.
    /// Anything else, malformed markup, or markup without a `title`
    /// element yields the whole payload as the title and an empty `jid`.
    #[must_use]
    pub fn parse(payload: &str) -> Self {
        let mut parsed = Self {
            title: payload.to_string(),
            jid: String::new(),
        };
        if !payload.trim().starts_with('<') {
            return parsed;
        }

        let doc = match roxmltree::Document::parse(payload) {
            Ok(doc) => doc,
            Err(e) => {
                log::debug!("[protocol] Window title is not well-formed XML: {e}");
                return parsed;
            }
        };
        let root = doc.root_element();

        let Some(title) = descendant_text(root, "title") else {
            return parsed;
        };
        if !title.is_empty() {
            parsed.title = title;
        }
        if let Some(jid) = descendant_text(root, "jid") {
            parsed.jid = jid;
        }
        parsed
    }
}

/// Text content of the first element named `name` below `root`.
fn descendant_text(root: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    root.descendants()
        .skip(1)
        .find(|n| n.is_element() && n.has_tag_name(name))
        .map(|n| {
            n.descendants()
                .filter(roxmltree::Node::is_text)
                .filter_map(|t| t.text())
                .collect()
        })
}

/// A decoded server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Raw terminal bytes (already base64-decoded).
    Output(Vec<u8>),
    /// Keep-alive reply.
    Pong,
    /// New window title.
    SetWindowTitle(WindowTitle),
    /// Terminal preferences, shape opaque to the session.
    SetPreferences(serde_json::Value),
    /// Auto-reconnect delay in seconds.
    SetReconnect(f64),
    /// Unrecognised tag.
    Unknown {
        /// Tag character as received.
        tag: char,
        /// Untouched payload.
        payload: String,
    },
}

impl InboundMessage {
    /// Decode and interpret a raw inbound frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for empty frames, invalid base64 output,
    /// or malformed preference/reconnect JSON.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let (tag, payload) = decode(frame)?;
        let message = match InboundTag::from_char(tag) {
            Some(InboundTag::Output) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))?;
                Self::Output(bytes)
            }
            Some(InboundTag::Pong) => Self::Pong,
            Some(InboundTag::SetWindowTitle) => Self::SetWindowTitle(WindowTitle::parse(payload)),
            Some(InboundTag::SetPreferences) => {
                Self::SetPreferences(parse_json(tag, payload)?)
            }
            Some(InboundTag::SetReconnect) => {
                let value = parse_json(tag, payload)?;
                let seconds = value
                    .as_f64()
                    .ok_or_else(|| ProtocolError::InvalidReconnect(payload.to_string()))?;
                Self::SetReconnect(seconds)
            }
            Some(InboundTag::Unknown) | None => Self::Unknown {
                tag,
                payload: payload.to_string(),
            },
        };
        Ok(message)
    }
}

fn parse_json(tag: char, payload: &str) -> Result<serde_json::Value, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::InvalidJson {
        tag,
        message: e.to_string(),
    })
}

/// Incremental UTF-8 decoder for terminal output.
///
/// PTY chunks can split a multi-byte character across two output frames;
/// the incomplete tail is held back until the next chunk arrives.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning all text that is complete so far.
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to() marks a UTF-8 boundary
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        text
    }

    /// Drop any buffered partial character.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
