//! Best-effort render-ahead for upcoming lines.
//!
//! Warms the renderer's cache so the scheduler's own render calls return
//! quickly. Renders are issued one at a time. Nothing here can affect what
//! the client sees: failures are logged and dropped.

use std::sync::Arc;

use tracing::debug;

use super::scheduler::{classify, voice_for};
use super::session::Session;
use crate::speech::SpeechRenderer;
use crate::text::sanitize_for_speech;

/// One render the scheduler is expected to request soon.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchTarget {
    pub position: i64,
    pub text: String,
    pub voice: String,
    pub rate: f64,
}

/// Up to `depth` upcoming lines, from the cursor on, that the scheduler
/// will render under the session's current mode and reveal settings.
pub fn targets(session: &Session, depth: usize, default_voice: &str) -> Vec<PrefetchTarget> {
    session.lines[session.cursor.min(session.lines.len())..]
        .iter()
        .filter(|line| classify(session, line).needs_audio())
        .take(depth)
        .map(|line| {
            let (voice, rate) = voice_for(session, line, default_voice);
            PrefetchTarget {
                position: line.position,
                text: sanitize_for_speech(&line.text),
                voice,
                rate,
            }
        })
        .collect()
}

/// Render `targets` sequentially. Returns how many succeeded.
pub async fn run(
    renderer: Arc<dyn SpeechRenderer>,
    session_id: &str,
    targets: Vec<PrefetchTarget>,
) -> usize {
    let mut rendered = 0;
    for target in targets {
        match renderer
            .render(&target.text, &target.voice, target.rate)
            .await
        {
            Ok(_) => rendered += 1,
            Err(e) => {
                debug!(session_id, idx = target.position, error = %e, "Prefetch render failed");
            }
        }
    }
    debug!(session_id, rendered, "Prefetch run finished");
    rendered
}
