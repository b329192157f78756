//! Mock speech renderer for testing.
//!
//! Produces deterministic durations from the text length, with optional
//! latency and failure injection. Counts calls so tests can assert that a
//! code path made no synthesis request.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::time::sleep;

use super::{RenderedSpeech, SpeechRenderer};

// ── Configuration ────────────────────────────────────────────────

/// Configuration for [`MockSpeechRenderer`].
#[derive(Debug, Clone)]
pub struct MockSpeechConfig {
    pub sec_per_char: f64,
    pub min_duration_sec: f64,
    pub max_duration_sec: f64,
    pub latency_ms: u64,
    /// Every render fails when set.
    pub fail_all: bool,
}

impl Default for MockSpeechConfig {
    fn default() -> Self {
        Self {
            sec_per_char: 0.06,
            min_duration_sec: 0.2,
            max_duration_sec: 30.0,
            latency_ms: 0,
            fail_all: false,
        }
    }
}

// ── Renderer ─────────────────────────────────────────────────────

/// Mock renderer that never touches the network.
#[derive(Default)]
pub struct MockSpeechRenderer {
    config: MockSpeechConfig,
    /// Texts that fail to render.
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    rendered: Mutex<Vec<String>>,
}

impl MockSpeechRenderer {
    pub fn new(config: MockSpeechConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Renderer whose every call fails.
    pub fn failing() -> Self {
        Self::new(MockSpeechConfig {
            fail_all: true,
            ..Default::default()
        })
    }

    /// Set simulated render latency.
    pub fn with_latency(mut self, ms: u64) -> Self {
        self.config.latency_ms = ms;
        self
    }

    /// Make renders of exactly `text` fail.
    pub fn fail_on(self, text: &str) -> Self {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(text.to_string());
        }
        self
    }

    /// Number of render calls so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts passed to `render`, in call order.
    pub fn rendered_texts(&self) -> Vec<String> {
        self.rendered.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Duration the mock reports for `text`.
    pub fn duration_for(&self, text: &str) -> f64 {
        (text.chars().count() as f64 * self.config.sec_per_char)
            .clamp(self.config.min_duration_sec, self.config.max_duration_sec)
    }
}

#[async_trait]
impl SpeechRenderer for MockSpeechRenderer {
    async fn render(&self, text: &str, voice: &str, rate: f64) -> Result<RenderedSpeech> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.push(text.to_string());
        }

        if self.config.latency_ms > 0 {
            sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let fails = self.config.fail_all
            || self
                .failing
                .lock()
                .map(|f| f.contains(text))
                .unwrap_or(false);
        if fails {
            bail!("mock render failure for {:?}", text);
        }

        let audio_id = format!("mock-{}-{}", voice, text.chars().count());
        Ok(RenderedSpeech {
            url: format!("/audio/{}.wav", audio_id),
            audio_id,
            duration_sec: self.duration_for(text) / rate.max(0.1),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
