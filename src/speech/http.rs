//! HTTP speech renderer.
//!
//! Flow:
//! 1. POST `{endpoint}/render` with `{"text", "voice", "rate"}`
//! 2. Expect `{"id", "url", "duration_sec"}` back
//!
//! Relative `url`s are resolved against the endpoint so clients can fetch
//! the audio directly.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{RenderedSpeech, SpeechRenderer};
use crate::text::preview;

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: f64,
}

/// Renderer backed by an external synthesis service.
pub struct HttpSpeechRenderer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSpeechRenderer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Resolve a possibly relative audio url against the endpoint.
    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.endpoint, url.trim_start_matches('/'))
        }
    }

    fn check(speech: &RenderedSpeech) -> Result<()> {
        if speech.audio_id.is_empty() {
            bail!("render response has an empty audio id");
        }
        if !(speech.duration_sec.is_finite() && speech.duration_sec > 0.0) {
            bail!("render response has invalid duration {}", speech.duration_sec);
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechRenderer for HttpSpeechRenderer {
    async fn render(&self, text: &str, voice: &str, rate: f64) -> Result<RenderedSpeech> {
        let mut speech: RenderedSpeech = self
            .client
            .post(format!("{}/render", self.endpoint))
            .json(&RenderRequest { text, voice, rate })
            .send()
            .await
            .context("render request failed")?
            .error_for_status()
            .context("render returned error status")?
            .json()
            .await
            .context("failed to parse render response as JSON")?;

        Self::check(&speech)?;
        speech.url = self.absolute_url(&speech.url);

        debug!(
            voice,
            rate,
            text = preview(text, 40),
            duration_sec = speech.duration_sec,
            "HTTP render complete"
        );

        Ok(speech)
    }

    fn name(&self) -> &str {
        "http"
    }
}
