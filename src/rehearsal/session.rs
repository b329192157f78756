//! Per-session rehearsal state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use super::error::RehearsalError;
use super::protocol::{ServerMessage, StartRequest, resolve_mode};
use super::{ConnectionId, RehearsalMode, SessionId};
use crate::script::{ScriptLine, VoiceTable};
use crate::speech::RenderedSpeech;
use crate::text::normalize_name;

pub const MIN_PLAYBACK_SPEED: f64 = 0.5;
pub const MAX_PLAYBACK_SPEED: f64 = 3.0;

/// Upper bound on `cue_words`; longer cues just give the line away.
const MAX_CUE_WORDS: usize = 50;

/// Server-side defaults applied when a start request leaves a field out.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub pause_multiplier: f64,
    pub pause_min_sec: f64,
    pub pause_max_sec: f64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            pause_multiplier: 1.0,
            pause_min_sec: 0.8,
            pause_max_sec: 15.0,
        }
    }
}

/// Shape of the silence inserted for the user's own lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseShape {
    pub multiplier: f64,
    pub min_sec: f64,
    /// Always `>= min_sec`.
    pub max_sec: f64,
}

impl PauseShape {
    fn resolve(req: &StartRequest, defaults: &SessionDefaults) -> Self {
        let multiplier = req
            .pause_mult
            .filter(|m| m.is_finite() && *m > 0.0)
            .unwrap_or(defaults.pause_multiplier);
        let min_sec = req
            .pause_min_sec
            .filter(|m| m.is_finite() && *m >= 0.0)
            .unwrap_or(defaults.pause_min_sec);
        let max_sec = req
            .pause_max_sec
            .filter(|m| m.is_finite() && *m >= 0.0)
            .unwrap_or(defaults.pause_max_sec)
            .max(min_sec);
        Self {
            multiplier,
            min_sec,
            max_sec,
        }
    }

    /// Clamp a duration into `[min_sec, max_sec]`.
    pub fn clamp(&self, seconds: f64) -> f64 {
        if seconds.is_nan() {
            return self.min_sec;
        }
        seconds.clamp(self.min_sec, self.max_sec)
    }
}

/// Validate a requested speed. Non-finite or non-positive input yields
/// `None`; anything else is clamped into the supported range.
pub fn sanitize_speed(requested: Option<f64>) -> Option<f64> {
    requested
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| s.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED))
}

/// A self line whose reveal audio was rendered during its pause and is
/// waiting for the next `ack`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLine {
    pub position: i64,
    pub speaker: Option<String>,
    pub text: String,
    pub audio: RenderedSpeech,
}

/// One rehearsal session. Mutated only while its registry lock is held.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Connection that created the session; used for disconnect cleanup.
    pub owner: ConnectionId,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub playback_started_at: Option<Instant>,

    pub script_id: String,
    pub from: i64,
    pub to: i64,
    pub mode: RehearsalMode,
    /// Normalized name of the user's character; empty means none.
    pub self_speaker: String,
    pub read_all_as_other: bool,
    pub pause: PauseShape,
    pub cue_word_count: usize,
    pub reveal_after_pause: bool,
    pub playback_speed: f64,

    pub playing: bool,
    /// Index into `lines`; never past `lines.len()`.
    pub cursor: usize,
    pub last_emitted_line_position: Option<i64>,
    pub pending_self_line: Option<PendingLine>,
    pub event_sequence: u64,
    pub prefetch_in_flight: bool,

    pub lines: Arc<[ScriptLine]>,
    pub characters: Arc<VoiceTable>,

    /// An advance task currently owns pacing for this session.
    pub(crate) advancing: bool,
    /// Bumped by `seek`/`jump`; an in-flight advance re-plans on mismatch.
    pub(crate) generation: u64,
    /// Set once the session has left the registry.
    pub(crate) terminated: bool,

    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    pub fn new(
        id: SessionId,
        owner: ConnectionId,
        req: &StartRequest,
        defaults: &SessionDefaults,
        lines: Vec<ScriptLine>,
        characters: VoiceTable,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Self, RehearsalError> {
        let (mode, default_reveal) = resolve_mode(req.mode.as_deref())?;
        let (from, to) = req.window();
        let now = Instant::now();

        Ok(Self {
            id,
            owner,
            created_at: now,
            last_activity_at: now,
            playback_started_at: None,
            script_id: req.script_id.clone(),
            from,
            to,
            mode,
            self_speaker: req.me.as_deref().map(normalize_name).unwrap_or_default(),
            read_all_as_other: req.read_all,
            pause: PauseShape::resolve(req, defaults),
            cue_word_count: req.cue_words.map_or(0, |c| (c as usize).min(MAX_CUE_WORDS)),
            reveal_after_pause: req.reveal_after.unwrap_or(default_reveal),
            // An absent speed takes the mode default; an invalid one falls back to 1.0.
            playback_speed: match req.speed_mult {
                None => mode.default_speed(),
                requested => sanitize_speed(requested).unwrap_or(1.0),
            },
            playing: false,
            cursor: 0,
            last_emitted_line_position: None,
            pending_self_line: None,
            event_sequence: 0,
            prefetch_in_flight: false,
            lines: lines.into(),
            characters: Arc::new(characters),
            advancing: false,
            generation: 0,
            terminated: false,
            outbound,
        })
    }

    /// Record inbound client activity.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    /// Lower and upper bound of the current window.
    pub fn bounds(&self) -> (i64, i64) {
        if self.from <= self.to {
            (self.from, self.to)
        } else {
            (self.to, self.from)
        }
    }

    /// Replace the window and reset all pacing state.
    pub fn reset_window(&mut self, from: i64, to: i64, lines: Vec<ScriptLine>, characters: VoiceTable) {
        self.from = from;
        self.to = to;
        self.lines = lines.into();
        self.characters = Arc::new(characters);
        self.cursor = 0;
        self.pending_self_line = None;
        self.event_sequence = 0;
        self.last_emitted_line_position = None;
        self.generation += 1;
    }

    /// Move the cursor to the first line at or after `target`, clamped to
    /// the current window. Returns the clamped target.
    pub fn jump_to(&mut self, target: i64) -> i64 {
        let (lo, hi) = self.bounds();
        let target = target.clamp(lo, hi);
        self.cursor = self
            .lines
            .iter()
            .position(|l| l.position >= target)
            .unwrap_or(self.lines.len());
        self.pending_self_line = None;
        self.generation += 1;
        target
    }

    /// Apply a new speed. Invalid input leaves the current speed unchanged.
    pub fn set_speed(&mut self, requested: Option<f64>) -> f64 {
        if let Some(speed) = sanitize_speed(requested) {
            self.playback_speed = speed;
        }
        self.playback_speed
    }

    /// Whether `line` belongs to the rehearsing user.
    pub fn is_self_line(&self, line: &ScriptLine) -> bool {
        !self.read_all_as_other
            && !self.self_speaker.is_empty()
            && line
                .speaker
                .as_deref()
                .is_some_and(|s| normalize_name(s) == self.self_speaker)
    }

    /// Next event id, advancing the sequence.
    pub(crate) fn next_event_id(&mut self) -> String {
        self.event_sequence += 1;
        format!("{}_evt_{}", self.id, self.event_sequence)
    }

    /// Queue a message for the owning connection. A closed connection is
    /// ignored here; disconnect cleanup handles the session.
    pub(crate) fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(msg);
    }
}
