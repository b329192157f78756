//! Speech renderer trait and implementations.
//!
//! The engine treats rendering as a black box: text, voice and rate in;
//! an audio handle and its duration out, or an error. Callers must be able
//! to degrade on error, so implementations never retry on their own.

pub mod cache;
pub mod http;
pub mod mock;

pub use cache::CachedSpeechRenderer;
pub use http::HttpSpeechRenderer;
pub use mock::MockSpeechRenderer;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SpeechConfig;

/// A rendered clip the client can fetch and play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedSpeech {
    /// Opaque audio id, stable for identical render inputs.
    #[serde(rename = "id")]
    pub audio_id: String,
    pub url: String,
    pub duration_sec: f64,
}

/// Text-to-speech renderer.
#[async_trait]
pub trait SpeechRenderer: Send + Sync {
    /// Render `text` with the given voice at `rate` (1.0 = natural).
    async fn render(&self, text: &str, voice: &str, rate: f64) -> Result<RenderedSpeech>;

    /// Human-readable renderer name.
    fn name(&self) -> &str;
}

/// Build the renderer described by `config`, wrapped in the render cache
/// unless `cache_entries` is 0.
pub fn from_config(config: &SpeechConfig) -> Result<Arc<dyn SpeechRenderer>> {
    let inner: Arc<dyn SpeechRenderer> = match config.provider.as_str() {
        "http" => Arc::new(HttpSpeechRenderer::new(&config.endpoint, config.timeout())?),
        "mock" => Arc::new(MockSpeechRenderer::default()),
        other => anyhow::bail!("unknown speech provider: {}", other),
    };
    if config.cache_entries == 0 {
        return Ok(inner);
    }
    Ok(Arc::new(CachedSpeechRenderer::new(inner, config.cache_entries)))
}
