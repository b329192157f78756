//! Script source: the already-parsed line list and the voice table.
//!
//! The engine only reads from here. Parsing scripts and editing voices
//! happen elsewhere.

pub mod directory;
pub mod memory;

pub use directory::DirectoryScriptSource;
pub use memory::MemoryScriptSource;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Dialogue,
    Direction,
}

/// One line of a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptLine {
    /// Script-level position; strictly increasing within a script.
    pub position: i64,
    pub kind: LineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
}

impl ScriptLine {
    pub fn dialogue(position: i64, speaker: &str, text: &str) -> Self {
        Self {
            position,
            kind: LineKind::Dialogue,
            speaker: Some(speaker.to_string()),
            text: text.to_string(),
        }
    }

    pub fn direction(position: i64, text: &str) -> Self {
        Self {
            position,
            kind: LineKind::Direction,
            speaker: None,
            text: text.to_string(),
        }
    }
}

/// Voice assignment for one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterVoice {
    pub voice: String,
    #[serde(default = "default_rate")]
    pub rate: f64,
}

fn default_rate() -> f64 {
    1.0
}

/// Voice table keyed by normalized character name.
pub type VoiceTable = HashMap<String, CharacterVoice>;

/// Read access to parsed scripts.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Lines with `from <= position <= to`, in position order.
    async fn load_window(&self, script_id: &str, from: i64, to: i64) -> Result<Vec<ScriptLine>>;

    /// Voice table keyed by [`crate::text::normalize_name`] of the character.
    async fn load_characters(&self, script_id: &str) -> Result<VoiceTable>;
}

/// Select the `[from, to]` window from a full, position-ordered line list.
pub(crate) fn window(lines: &[ScriptLine], from: i64, to: i64) -> Vec<ScriptLine> {
    let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
    lines
        .iter()
        .filter(|l| l.position >= lo && l.position <= hi)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_deserialize_direction_without_speaker() {
        let json = r#"{"position":3,"kind":"direction","text":"Thunder."}"#;
        let line: ScriptLine = serde_json::from_str(json).unwrap();
        assert_eq!(line, ScriptLine::direction(3, "Thunder."));
    }

    #[test]
    fn character_voice_rate_defaults_to_one() {
        let voice: CharacterVoice = serde_json::from_str(r#"{"voice":"en-GB-1"}"#).unwrap();
        assert_eq!(voice.rate, 1.0);
    }

    #[test]
    fn window_is_inclusive_and_tolerates_reversed_bounds() {
        let lines: Vec<ScriptLine> = (1..=5)
            .map(|p| ScriptLine::direction(p, "x"))
            .collect();
        let w = window(&lines, 2, 4);
        assert_eq!(w.iter().map(|l| l.position).collect::<Vec<_>>(), vec![2, 3, 4]);
        let r = window(&lines, 4, 2);
        assert_eq!(r.len(), 3);
        assert!(window(&lines, 9, 12).is_empty());
    }
}
