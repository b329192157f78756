//! Content-addressed render cache.
//!
//! Wraps any [`SpeechRenderer`] and memoizes successful renders keyed by
//! SHA-256 of the render inputs. Shared by every session; concurrent
//! misses on the same key may both reach the inner renderer, which is
//! accepted. Failures are never cached.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{RenderedSpeech, SpeechRenderer};

/// Parameters used to generate the cache key.
#[derive(Debug, Clone, Serialize)]
pub struct RenderKeyParams<'a> {
    pub text: &'a str,
    pub voice: &'a str,
    pub rate: f64,
}

/// Generate a SHA-256 cache key from render parameters.
pub fn generate_cache_key(params: &RenderKeyParams<'_>) -> String {
    // Field order is fixed by the struct definition, so the encoding is canonical.
    let canonical = serde_json::to_string(params)
        .unwrap_or_else(|_| format!("{}\u{0}{}\u{0}{}", params.text, params.voice, params.rate));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Caching renderer with oldest-insert eviction.
pub struct CachedSpeechRenderer {
    inner: Arc<dyn SpeechRenderer>,
    entries: DashMap<String, RenderedSpeech>,
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
}

impl CachedSpeechRenderer {
    pub fn new(inner: Arc<dyn SpeechRenderer>, max_entries: usize) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of cached renders.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn store(&self, key: String, speech: RenderedSpeech) {
        if self.entries.insert(key.clone(), speech).is_some() {
            return;
        }
        let Ok(mut order) = self.order.lock() else {
            return;
        };
        order.push_back(key);
        while order.len() > self.max_entries {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
                debug!(cache_key = %oldest, "Render cache: evicted oldest entry");
            }
        }
    }
}

#[async_trait]
impl SpeechRenderer for CachedSpeechRenderer {
    async fn render(&self, text: &str, voice: &str, rate: f64) -> Result<RenderedSpeech> {
        let key = generate_cache_key(&RenderKeyParams { text, voice, rate });

        if let Some(hit) = self.entries.get(&key) {
            debug!(cache_key = %key, "Render cache hit");
            return Ok(hit.value().clone());
        }

        debug!(cache_key = %key, "Render cache miss");
        let speech = self.inner.render(text, voice, rate).await?;
        self.store(key, speech.clone());
        Ok(speech)
    }

    fn name(&self) -> &str {
        "cached"
    }
}
