//! Configuration loading.
//!
//! Every key has a default, so a missing `config.toml` yields a working
//! setup (mock renderer, in-memory history).

mod schema;

pub use schema::{parse_duration, validate};

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub rehearsal: RehearsalConfig,
    pub speech: SpeechConfig,
    pub scripts: ScriptsConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8790".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RehearsalConfig {
    /// Sessions without client activity for this long are reaped.
    pub idle_ttl: String,
    /// How often the idle reaper sweeps the registry.
    pub sweep_interval: String,
    /// Upcoming lines rendered ahead of need per prefetch run.
    pub prefetch_depth: usize,
    pub default_pause_multiplier: f64,
    pub default_pause_min_sec: f64,
    pub default_pause_max_sec: f64,
    /// Voice used for speakers missing from the character table.
    pub default_voice: String,
}

impl Default for RehearsalConfig {
    fn default() -> Self {
        Self {
            idle_ttl: "30m".to_string(),
            sweep_interval: "60s".to_string(),
            prefetch_depth: 3,
            default_pause_multiplier: 1.0,
            default_pause_min_sec: 0.8,
            default_pause_max_sec: 15.0,
            default_voice: "default".to_string(),
        }
    }
}

impl RehearsalConfig {
    pub fn idle_ttl(&self) -> Duration {
        parse_duration(&self.idle_ttl).unwrap_or(Duration::from_secs(30 * 60))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// `"mock"` or `"http"`.
    pub provider: String,
    pub endpoint: String,
    pub timeout: String,
    /// Capacity of the in-process render cache; 0 disables it.
    pub cache_entries: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            endpoint: "http://127.0.0.1:5002".to_string(),
            timeout: "20s".to_string(),
            cache_entries: 2048,
        }
    }
}

impl SpeechConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(20))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory holding `<script_id>.json` files. Empty means none.
    pub dir: String,
}

impl ScriptsConfig {
    pub fn dir_path(&self) -> Option<PathBuf> {
        if self.dir.trim().is_empty() {
            return None;
        }
        Some(PathBuf::from(shellexpand::tilde(&self.dir).into_owned()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite database path, or `":memory:"`.
    pub db_path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
        }
    }
}

impl HistoryConfig {
    pub fn resolved_path(&self) -> String {
        if self.db_path == ":memory:" {
            return self.db_path.clone();
        }
        shellexpand::tilde(&self.db_path).into_owned()
    }
}

impl Config {
    /// Load from an explicit path, or from the platform config directory.
    ///
    /// An explicit path must exist; the default location may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                anyhow::bail!("config file not found: {}", path.display());
            }
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("invalid config in {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse TOML")?;
        validate(&config).map_err(anyhow::Error::msg)?;
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "runlines").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8790");
        assert_eq!(config.rehearsal.idle_ttl(), Duration::from_secs(1800));
        assert_eq!(config.rehearsal.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.rehearsal.prefetch_depth, 3);
        assert_eq!(config.speech.provider, "mock");
        assert_eq!(config.history.db_path, ":memory:");
        assert!(config.scripts.dir_path().is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [rehearsal]
            idle_ttl = "10m"
            prefetch_depth = 5

            [scripts]
            dir = "/srv/scripts"
            "#,
        )
        .unwrap();
        assert_eq!(config.rehearsal.idle_ttl(), Duration::from_secs(600));
        assert_eq!(config.rehearsal.prefetch_depth, 5);
        assert_eq!(config.rehearsal.sweep_interval(), Duration::from_secs(60));
        assert_eq!(
            config.scripts.dir_path(),
            Some(PathBuf::from("/srv/scripts"))
        );
    }

    #[test]
    fn invalid_toml_is_error() {
        assert!(Config::from_toml("[rehearsal]\nidle_ttl = \"soon\"").is_err());
        assert!(Config::from_toml("not = [valid").is_err());
    }

    #[test]
    fn load_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9000\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }
}
