//! Script source reading `<dir>/<script_id>.json` files.
//!
//! File format:
//!
//! ```json
//! {
//!   "lines": [{"position": 1, "kind": "dialogue", "speaker": "Hamlet", "text": "..."}],
//!   "characters": [{"name": "Hamlet", "voice": "en-GB-2", "rate": 1.0}]
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CharacterVoice, ScriptLine, ScriptSource, VoiceTable, window};
use crate::text::normalize_name;

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    lines: Vec<ScriptLine>,
    #[serde(default)]
    characters: Vec<CharacterEntry>,
}

#[derive(Debug, Deserialize)]
struct CharacterEntry {
    name: String,
    #[serde(flatten)]
    voice: CharacterVoice,
}

/// Reads scripts from JSON files on every load, so edits are picked up by
/// the next `start` or `seek`.
pub struct DirectoryScriptSource {
    dir: PathBuf,
}

impl DirectoryScriptSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn script_path(&self, script_id: &str) -> Result<PathBuf> {
        // Script ids come from clients; keep them inside `dir`.
        let valid = !script_id.is_empty()
            && script_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("invalid script id: {:?}", script_id);
        }
        Ok(self.dir.join(format!("{}.json", script_id)))
    }

    async fn read(&self, script_id: &str) -> Result<ScriptFile> {
        let path = self.script_path(script_id)?;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read script {}", display(&path)))?;
        let mut file: ScriptFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse script {}", display(&path)))?;
        file.lines.sort_by_key(|l| l.position);
        debug!(script_id, lines = file.lines.len(), "Loaded script file");
        Ok(file)
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl ScriptSource for DirectoryScriptSource {
    async fn load_window(&self, script_id: &str, from: i64, to: i64) -> Result<Vec<ScriptLine>> {
        let file = self.read(script_id).await?;
        Ok(window(&file.lines, from, to))
    }

    async fn load_characters(&self, script_id: &str) -> Result<VoiceTable> {
        let file = self.read(script_id).await?;
        Ok(file
            .characters
            .into_iter()
            .map(|c| (normalize_name(&c.name), c.voice))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::LineKind;

    const SCRIPT: &str = r#"{
        "lines": [
            {"position": 2, "kind": "dialogue", "speaker": "Witch", "text": "When shall we three meet again?"},
            {"position": 1, "kind": "direction", "text": "Thunder and lightning."}
        ],
        "characters": [{"name": "First Witch", "voice": "en-GB-3", "rate": 0.9}]
    }"#;

    fn fixture() -> (tempfile::TempDir, DirectoryScriptSource) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("macbeth.json"), SCRIPT).unwrap();
        let source = DirectoryScriptSource::new(dir.path());
        (dir, source)
    }

    #[tokio::test]
    async fn reads_sorted_window() {
        let (_dir, source) = fixture();
        let lines = source.load_window("macbeth", 0, 10).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].kind, LineKind::Direction);
        assert_eq!(lines[1].speaker.as_deref(), Some("Witch"));
    }

    #[tokio::test]
    async fn reads_normalized_characters() {
        let (_dir, source) = fixture();
        let table = source.load_characters("macbeth").await.unwrap();
        let voice = table.get("first witch").unwrap();
        assert_eq!(voice.voice, "en-GB-3");
        assert!((voice.rate - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, source) = fixture();
        assert!(source.load_window("../etc/passwd", 0, 1).await.is_err());
        assert!(source.load_window("", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let (_dir, source) = fixture();
        assert!(source.load_window("hamlet", 0, 1).await.is_err());
    }
}
