//! Text helpers shared by the scheduler and the prefetcher.
//!
//! Speaker names are compared after [`normalize_name`]; spoken text goes
//! through [`sanitize_for_speech`] before it reaches the renderer or the
//! duration estimate.

use once_cell::sync::Lazy;
use regex::Regex;

/// Speaking rate used for duration estimates when no audio exists yet.
pub const ESTIMATE_WORDS_PER_MINUTE: f64 = 160.0;

/// Shortest estimate returned for any non-empty line, in seconds.
pub const ESTIMATE_MIN_SECONDS: f64 = 0.6;

/// Parenthesized or bracketed asides inside dialogue, e.g. `(beat)` or `[aside]`.
static INLINE_DIRECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").expect("inline direction regex"));

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize a character name for equality comparison.
///
/// Case-folds, collapses every run of non-alphanumeric characters into a
/// single space and trims the result. `"  Lady  MACBETH!"` and
/// `"lady-macbeth"` both become `"lady macbeth"`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Strip inline stage directions and collapse whitespace.
///
/// Returns an empty string when nothing speakable is left, which is how
/// parenthetical-only dialogue lines become invisible to pacing.
pub fn sanitize_for_speech(text: &str) -> String {
    let stripped = INLINE_DIRECTION.replace_all(text, " ");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ");
    if collapsed.chars().any(char::is_alphanumeric) {
        collapsed.into_owned()
    } else {
        String::new()
    }
}

/// Estimated spoken length of `text` in seconds at normal speed.
pub fn estimate_speech_seconds(text: &str) -> f64 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    (words as f64 * 60.0 / ESTIMATE_WORDS_PER_MINUTE).max(ESTIMATE_MIN_SECONDS)
}

/// First `count` words of `text`, joined by single spaces.
pub fn cue_words(text: &str, count: usize) -> Option<String> {
    if count == 0 {
        return None;
    }
    let cue = text
        .split_whitespace()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ");
    if cue.is_empty() { None } else { Some(cue) }
}

/// Shorten `s` to at most `max_chars` characters for log output.
pub fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
