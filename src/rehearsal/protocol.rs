//! Wire messages exchanged over the rehearsal WebSocket.
//!
//! Every frame is a JSON object tagged by `type`. Legacy mode names are
//! mapped here, at the decoding boundary, so the scheduler only ever sees
//! a canonical [`RehearsalMode`].

use serde::{Deserialize, Serialize};

use super::error::{ProtocolError, RehearsalError};
use super::{Outcome, RehearsalMode};
use crate::speech::RenderedSpeech;

// ── Client → server ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "run_lines.start")]
    Start(StartRequest),

    #[serde(rename = "run_lines.play")]
    Play { session_id: String },

    #[serde(rename = "run_lines.ack")]
    Ack { session_id: String },

    #[serde(rename = "run_lines.stop")]
    Stop { session_id: String },

    #[serde(rename = "run_lines.set_speed")]
    SetSpeed {
        session_id: String,
        #[serde(default)]
        speed_mult: Option<f64>,
    },

    #[serde(rename = "run_lines.seek")]
    Seek {
        session_id: String,
        from: i64,
        to: i64,
    },

    #[serde(rename = "run_lines.jump")]
    Jump { session_id: String, target_idx: i64 },
}

impl ClientMessage {
    /// Session the message targets; `None` for `start`.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Start(_) => None,
            ClientMessage::Play { session_id }
            | ClientMessage::Ack { session_id }
            | ClientMessage::Stop { session_id }
            | ClientMessage::SetSpeed { session_id, .. }
            | ClientMessage::Seek { session_id, .. }
            | ClientMessage::Jump { session_id, .. } => Some(session_id),
        }
    }
}

/// `run_lines.start` payload. Everything but `script_id` is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub script_id: String,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub read_all: bool,
    #[serde(default)]
    pub pause_mult: Option<f64>,
    #[serde(default)]
    pub pause_min_sec: Option<f64>,
    #[serde(default)]
    pub pause_max_sec: Option<f64>,
    #[serde(default)]
    pub cue_words: Option<u32>,
    #[serde(default)]
    pub reveal_after: Option<bool>,
    #[serde(default)]
    pub speed_mult: Option<f64>,
}

impl StartRequest {
    /// Requested window; a missing bound means "to the edge of the script".
    pub fn window(&self) -> (i64, i64) {
        (self.from.unwrap_or(i64::MIN), self.to.unwrap_or(i64::MAX))
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

// ── Mode compatibility ───────────────────────────────────────────

/// Accepted mode names: `(name, mode, default reveal_after)`.
///
/// The first three are canonical; the rest are names older clients send.
const MODE_NAMES: &[(&str, RehearsalMode, bool)] = &[
    ("read_through", RehearsalMode::ReadThrough, false),
    ("practice", RehearsalMode::Practice, true),
    ("speed_through", RehearsalMode::SpeedThrough, false),
    ("read", RehearsalMode::ReadThrough, false),
    ("listen", RehearsalMode::ReadThrough, false),
    ("run", RehearsalMode::Practice, true),
    ("cue", RehearsalMode::Practice, false),
    ("cue_only", RehearsalMode::Practice, false),
    ("speed", RehearsalMode::SpeedThrough, false),
    ("speed_run", RehearsalMode::SpeedThrough, false),
];

/// Resolve a client mode name to the canonical mode and its default
/// `reveal_after`. An absent or blank name means `practice`.
pub fn resolve_mode(name: Option<&str>) -> Result<(RehearsalMode, bool), RehearsalError> {
    let key = name
        .map(|n| n.trim().to_ascii_lowercase().replace(['-', ' '], "_"))
        .unwrap_or_default();
    if key.is_empty() {
        return Ok((RehearsalMode::Practice, true));
    }
    MODE_NAMES
        .iter()
        .find(|(alias, _, _)| *alias == key)
        .map(|(_, mode, reveal)| (*mode, *reveal))
        .ok_or_else(|| RehearsalError::UnknownMode(name.unwrap_or_default().to_string()))
}

// ── Server → client ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "run_lines.session")]
    Session(SessionNotice),

    #[serde(rename = "run_lines.event")]
    Event(RehearsalEvent),

    #[serde(rename = "error")]
    Error(ErrorNotice),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, session_id: Option<&str>) -> Self {
        ServerMessage::Error(ErrorNotice {
            message: message.into(),
            session_id: session_id.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Started,
    Seeked,
    Jumped,
    Speed,
    Ended,
}

/// Lifecycle notification (`run_lines.session`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionNotice {
    pub event: NoticeKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RehearsalMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mult: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_idx: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Outcome>,
}

impl SessionNotice {
    pub fn new(event: NoticeKind, session_id: &str) -> Self {
        Self {
            event,
            session_id: session_id.to_string(),
            mode: None,
            speed_mult: None,
            line_count: None,
            from: None,
            to: None,
            target_idx: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Direction,
    Pause,
    Line,
    Gap,
}

/// One scheduler emission (`run_lines.event`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RehearsalEvent {
    pub session_id: String,
    /// `"{session_id}_evt_{sequence}"`.
    pub event_id: String,
    pub kind: EventKind,
    /// Script-level line position.
    pub idx: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<RenderedSpeech>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorNotice {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
