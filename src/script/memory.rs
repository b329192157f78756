//! In-memory script source for tests and embedding.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;

use super::{CharacterVoice, ScriptLine, ScriptSource, VoiceTable, window};
use crate::text::normalize_name;

struct StoredScript {
    lines: Vec<ScriptLine>,
    characters: VoiceTable,
}

/// Script source backed by a concurrent map.
#[derive(Default)]
pub struct MemoryScriptSource {
    scripts: DashMap<String, StoredScript>,
}

impl MemoryScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script. Lines are sorted by position; character names
    /// are normalized.
    pub fn insert(
        &self,
        script_id: &str,
        mut lines: Vec<ScriptLine>,
        characters: Vec<(&str, CharacterVoice)>,
    ) {
        lines.sort_by_key(|l| l.position);
        let characters: HashMap<_, _> = characters
            .into_iter()
            .map(|(name, voice)| (normalize_name(name), voice))
            .collect();
        self.scripts
            .insert(script_id.to_string(), StoredScript { lines, characters });
    }
}

#[async_trait]
impl ScriptSource for MemoryScriptSource {
    async fn load_window(&self, script_id: &str, from: i64, to: i64) -> Result<Vec<ScriptLine>> {
        let script = self
            .scripts
            .get(script_id)
            .ok_or_else(|| anyhow!("unknown script: {}", script_id))?;
        Ok(window(&script.lines, from, to))
    }

    async fn load_characters(&self, script_id: &str) -> Result<VoiceTable> {
        let script = self
            .scripts
            .get(script_id)
            .ok_or_else(|| anyhow!("unknown script: {}", script_id))?;
        Ok(script.characters.clone())
    }
}
