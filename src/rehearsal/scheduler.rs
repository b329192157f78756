//! Turn scheduler: decides the next event for a session.
//!
//! Scheduling is split around the only suspension point, the speech
//! renderer. [`plan`] runs under the session lock and either produces an
//! event directly or returns a [`RenderJob`]. The caller renders without
//! the lock held, re-locks, and hands the result to [`complete`], unless a
//! `seek`/`jump` changed the session generation in the meantime.

use anyhow::Result;
use tracing::{debug, warn};

use super::protocol::{EventKind, RehearsalEvent};
use super::session::{MAX_PLAYBACK_SPEED, MIN_PLAYBACK_SPEED, PendingLine, Session};
use super::RehearsalMode;
use crate::script::{LineKind, ScriptLine};
use crate::speech::RenderedSpeech;
use crate::text::{cue_words, estimate_speech_seconds, sanitize_for_speech};

/// How a single line is paced under a session's current settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTurn {
    /// Stage direction: text only, no audio, no pacing.
    Direction,
    /// Dialogue with nothing speakable; produces no event at all.
    Silent,
    /// Another part skipped silently for a timed gap.
    Gap,
    /// The user's own line. `reveal` renders it for playback afterwards.
    Pause { reveal: bool },
    /// Rendered and played.
    Speak,
}

impl LineTurn {
    /// Whether pacing this line calls the renderer.
    pub fn needs_audio(&self) -> bool {
        matches!(self, LineTurn::Speak | LineTurn::Pause { reveal: true })
    }
}

/// Classify `line` for `session`.
pub fn classify(session: &Session, line: &ScriptLine) -> LineTurn {
    if line.kind == LineKind::Direction {
        return LineTurn::Direction;
    }
    if sanitize_for_speech(&line.text).is_empty() {
        return LineTurn::Silent;
    }
    let mine = session.is_self_line(line);
    match (session.mode, mine) {
        (RehearsalMode::SpeedThrough, false) => LineTurn::Gap,
        (RehearsalMode::ReadThrough, _) => LineTurn::Speak,
        (_, true) => LineTurn::Pause {
            reveal: session.reveal_after_pause,
        },
        (RehearsalMode::Practice, false) => LineTurn::Speak,
    }
}

/// Voice and rate for the line's speaker, falling back to `default_voice`.
pub fn voice_for(session: &Session, line: &ScriptLine, default_voice: &str) -> (String, f64) {
    let speaker = line
        .speaker
        .as_deref()
        .map(crate::text::normalize_name)
        .unwrap_or_default();
    match session.characters.get(&speaker) {
        Some(v) => {
            let rate = if v.rate.is_finite() && v.rate > 0.0 { v.rate } else { 1.0 };
            (v.voice.clone(), rate)
        }
        None => (default_voice.to_string(), 1.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPurpose {
    /// Play the line now; degrade to a gap on failure.
    Speak,
    /// Time the user's pause and buffer the reveal.
    Reveal,
}

/// A render the caller must perform before the turn can complete.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub index: usize,
    pub purpose: RenderPurpose,
    /// Sanitized text to render.
    pub text: String,
    pub voice: String,
    pub rate: f64,
    /// Session generation the job was planned against.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Emit(RehearsalEvent),
    Render(RenderJob),
    /// Nothing left to emit; the session is complete.
    Exhausted,
}

/// Effective playback rate for the current speed.
fn playback_rate(session: &Session) -> f64 {
    session
        .playback_speed
        .clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
}

/// Silent placeholder length for `spoken` text.
pub fn gap_seconds(session: &Session, spoken: &str) -> f64 {
    session
        .pause
        .clamp(estimate_speech_seconds(spoken) / playback_rate(session))
}

/// Pause length for a self line whose natural length is `base` seconds.
pub fn pause_seconds(session: &Session, base: f64) -> f64 {
    session
        .pause
        .clamp(base * session.pause.multiplier / playback_rate(session))
}

fn event(
    session: &mut Session,
    kind: EventKind,
    position: i64,
    speaker: Option<String>,
    text: String,
) -> RehearsalEvent {
    session.last_emitted_line_position = Some(position);
    RehearsalEvent {
        session_id: session.id.clone(),
        event_id: session.next_event_id(),
        kind,
        idx: position,
        speaker,
        text,
        audio: None,
        duration_sec: None,
        playback_rate: None,
        cue: None,
    }
}

fn line_event(
    session: &mut Session,
    position: i64,
    speaker: Option<String>,
    text: String,
    audio: RenderedSpeech,
) -> RehearsalEvent {
    let rate = playback_rate(session);
    let mut ev = event(session, EventKind::Line, position, speaker, text);
    ev.duration_sec = Some(audio.duration_sec / rate);
    ev.playback_rate = Some(rate);
    ev.audio = Some(audio);
    ev
}

fn gap_event(session: &mut Session, line: &ScriptLine, spoken: &str) -> RehearsalEvent {
    let duration = gap_seconds(session, spoken);
    let mut ev = event(
        session,
        EventKind::Gap,
        line.position,
        line.speaker.clone(),
        line.text.clone(),
    );
    ev.duration_sec = Some(duration);
    ev
}

fn pause_event(
    session: &mut Session,
    line: &ScriptLine,
    spoken: &str,
    base: f64,
) -> RehearsalEvent {
    let duration = pause_seconds(session, base);
    let cue = cue_words(spoken, session.cue_word_count);
    let mut ev = event(
        session,
        EventKind::Pause,
        line.position,
        line.speaker.clone(),
        String::new(),
    );
    ev.duration_sec = Some(duration);
    ev.cue = cue;
    ev
}

/// Decide the next step for `session`. Must not be re-entered for the same
/// session while a returned [`RenderJob`] is outstanding.
pub fn plan(session: &mut Session, default_voice: &str) -> Step {
    if let Some(pending) = session.pending_self_line.take() {
        debug!(session_id = %session.id, idx = pending.position, "Flushing revealed self line");
        let ev = line_event(
            session,
            pending.position,
            pending.speaker,
            pending.text,
            pending.audio,
        );
        return Step::Emit(ev);
    }

    let lines = session.lines.clone();
    while let Some(line) = lines.get(session.cursor) {
        let index = session.cursor;
        match classify(session, line) {
            LineTurn::Direction => {
                session.cursor += 1;
                let ev = event(
                    session,
                    EventKind::Direction,
                    line.position,
                    None,
                    line.text.clone(),
                );
                return Step::Emit(ev);
            }
            LineTurn::Silent => {
                debug!(session_id = %session.id, idx = line.position, "Skipping unspeakable line");
                session.cursor += 1;
            }
            LineTurn::Gap => {
                session.cursor += 1;
                let spoken = sanitize_for_speech(&line.text);
                return Step::Emit(gap_event(session, line, &spoken));
            }
            LineTurn::Pause { reveal: false } => {
                session.cursor += 1;
                let spoken = sanitize_for_speech(&line.text);
                let base = estimate_speech_seconds(&spoken);
                return Step::Emit(pause_event(session, line, &spoken, base));
            }
            turn @ (LineTurn::Pause { reveal: true } | LineTurn::Speak) => {
                let (voice, rate) = voice_for(session, line, default_voice);
                let purpose = if turn == LineTurn::Speak {
                    RenderPurpose::Speak
                } else {
                    RenderPurpose::Reveal
                };
                return Step::Render(RenderJob {
                    index,
                    purpose,
                    text: sanitize_for_speech(&line.text),
                    voice,
                    rate,
                    generation: session.generation,
                });
            }
        }
    }

    Step::Exhausted
}

/// Finish a turn whose render has resolved. Returns `None` if the job no
/// longer points at a loaded line.
pub fn complete(
    session: &mut Session,
    job: &RenderJob,
    result: Result<RenderedSpeech>,
) -> Option<RehearsalEvent> {
    let line = session.lines.get(job.index)?.clone();
    session.cursor = job.index + 1;

    match (job.purpose, result) {
        (RenderPurpose::Speak, Ok(audio)) => Some(line_event(
            session,
            line.position,
            line.speaker.clone(),
            line.text.clone(),
            audio,
        )),
        (RenderPurpose::Speak, Err(e)) => {
            warn!(
                session_id = %session.id,
                idx = line.position,
                error = %e,
                "Render failed, degrading to gap"
            );
            Some(gap_event(session, &line, &job.text))
        }
        (RenderPurpose::Reveal, Ok(audio)) => {
            let base = audio.duration_sec;
            session.pending_self_line = Some(PendingLine {
                position: line.position,
                speaker: line.speaker.clone(),
                text: line.text.clone(),
                audio,
            });
            Some(pause_event(session, &line, &job.text, base))
        }
        (RenderPurpose::Reveal, Err(e)) => {
            warn!(
                session_id = %session.id,
                idx = line.position,
                error = %e,
                "Reveal render failed, pausing on estimate"
            );
            session.pending_self_line = None;
            let base = estimate_speech_seconds(&job.text);
            Some(pause_event(session, &line, &job.text, base))
        }
    }
}
