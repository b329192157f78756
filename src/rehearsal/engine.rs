//! Rehearsal engine: message dispatch, session lifecycle and the idle reaper.
//!
//! Connections call [`Engine::handle_text`] for every inbound frame and
//! [`Engine::disconnect`] once when they close. Scheduler turns run on
//! spawned advance tasks, so a slow render never blocks the connection's
//! read loop and `stop` takes effect immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::RehearsalError;
use super::prefetch;
use super::protocol::{
    ClientMessage, NoticeKind, RehearsalEvent, ServerMessage, SessionNotice, StartRequest, decode,
    resolve_mode,
};
use super::registry::{SessionHandle, SessionRegistry};
use super::scheduler::{self, Step};
use super::session::{Session, SessionDefaults};
use super::{ConnectionId, Outcome, SessionId};
use crate::config::RehearsalConfig;
use crate::history::{PracticeRecord, PracticeRecorder};
use crate::script::ScriptSource;
use crate::speech::SpeechRenderer;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub idle_ttl: Duration,
    pub prefetch_depth: usize,
    pub default_voice: String,
    pub defaults: SessionDefaults,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30 * 60),
            prefetch_depth: 3,
            default_voice: "default".to_string(),
            defaults: SessionDefaults::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &RehearsalConfig) -> Self {
        Self {
            idle_ttl: config.idle_ttl(),
            prefetch_depth: config.prefetch_depth,
            default_voice: config.default_voice.clone(),
            defaults: SessionDefaults {
                pause_multiplier: config.default_pause_multiplier,
                pause_min_sec: config.default_pause_min_sec,
                pause_max_sec: config.default_pause_max_sec,
            },
        }
    }
}

pub struct Engine {
    registry: SessionRegistry,
    scripts: Arc<dyn ScriptSource>,
    renderer: Arc<dyn SpeechRenderer>,
    recorder: Arc<dyn PracticeRecorder>,
    settings: EngineSettings,
    next_connection: AtomicU64,
    /// Connections allocated and not yet disconnected.
    open_connections: DashSet<ConnectionId>,
}

impl Engine {
    pub fn new(
        scripts: Arc<dyn ScriptSource>,
        renderer: Arc<dyn SpeechRenderer>,
        recorder: Arc<dyn PracticeRecorder>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            scripts,
            renderer,
            recorder,
            settings,
            next_connection: AtomicU64::new(1),
            open_connections: DashSet::new(),
        }
    }

    /// Allocate an id for a new connection and mark it open.
    pub fn next_connection_id(&self) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.open_connections.insert(id);
        id
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.registry.get(session_id).is_some()
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Decode and dispatch one inbound text frame. Malformed frames are
    /// answered with an `error` message and otherwise ignored.
    pub async fn handle_text(self: &Arc<Self>, conn: ConnectionId, outbound: &Outbound, text: &str) {
        match decode(text) {
            Ok(msg) => self.handle(conn, outbound, msg).await,
            Err(e) => {
                warn!(conn_id = conn, error = %e, "Malformed client message");
                let _ = outbound.send(ServerMessage::error(e.to_string(), None));
            }
        }
    }

    /// Dispatch one decoded client message.
    pub async fn handle(self: &Arc<Self>, conn: ConnectionId, outbound: &Outbound, msg: ClientMessage) {
        debug!(
            conn_id = conn,
            session_id = msg.session_id().unwrap_or("-"),
            "Dispatching client message"
        );
        match msg {
            ClientMessage::Start(req) => {
                if let Err(e) = self.start(conn, outbound.clone(), req).await {
                    warn!(conn_id = conn, error = %e, "Rejected run_lines.start");
                    let _ = outbound.send(ServerMessage::error(e.to_string(), None));
                }
            }
            ClientMessage::Play { session_id } => self.play(&session_id).await,
            ClientMessage::Ack { session_id } => self.ack(&session_id).await,
            ClientMessage::Stop { session_id } => {
                self.stop(&session_id).await;
            }
            ClientMessage::SetSpeed {
                session_id,
                speed_mult,
            } => self.set_speed(&session_id, speed_mult).await,
            ClientMessage::Seek {
                session_id,
                from,
                to,
            } => self.seek(&session_id, from, to).await,
            ClientMessage::Jump {
                session_id,
                target_idx,
            } => self.jump(&session_id, target_idx).await,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Load the requested window and register an idle session. Fails with
    /// [`RehearsalError::ConnectionClosed`] if `conn` disconnected while the
    /// window was loading; the session is then recorded as disconnected.
    pub async fn start(
        &self,
        conn: ConnectionId,
        outbound: Outbound,
        req: StartRequest,
    ) -> Result<SessionId, RehearsalError> {
        if req.script_id.trim().is_empty() {
            return Err(RehearsalError::MissingScript);
        }
        // Reject bad modes before touching the script source.
        resolve_mode(req.mode.as_deref())?;

        let (from, to) = req.window();
        let lines = self
            .scripts
            .load_window(&req.script_id, from, to)
            .await
            .map_err(|e| RehearsalError::script_load(&req.script_id, &e))?;
        let characters = self
            .scripts
            .load_characters(&req.script_id)
            .await
            .map_err(|e| RehearsalError::script_load(&req.script_id, &e))?;

        let id = Uuid::new_v4().to_string();
        let reply = outbound.clone();
        let session = Session::new(
            id.clone(),
            conn,
            &req,
            &self.settings.defaults,
            lines,
            characters,
            outbound,
        )?;

        let mut notice = SessionNotice::new(NoticeKind::Started, &id);
        notice.mode = Some(session.mode);
        notice.speed_mult = Some(session.playback_speed);
        notice.line_count = Some(session.lines.len());
        notice.from = req.from;
        notice.to = req.to;

        info!(
            session_id = %id,
            conn_id = conn,
            script_id = %session.script_id,
            mode = session.mode.as_str(),
            lines = session.lines.len(),
            "Rehearsal session started"
        );
        self.registry.create(session);

        // Register before checking: `disconnect` closes the connection
        // before collecting its sessions, so one of the two sees the other.
        if !self.open_connections.contains(&conn) {
            debug!(session_id = %id, conn_id = conn, "Connection closed during start");
            self.terminate(&id, Outcome::Disconnected).await;
            return Err(RehearsalError::ConnectionClosed);
        }

        let _ = reply.send(ServerMessage::Session(notice));
        Ok(id)
    }

    pub async fn play(self: &Arc<Self>, session_id: &str) {
        let Some((handle, mut s)) = self.lock_active(session_id).await else {
            return;
        };
        if s.playing {
            debug!(session_id, "play ignored, already playing");
            return;
        }
        s.playing = true;
        s.playback_started_at.get_or_insert_with(Instant::now);
        self.trigger(&mut s, &handle);
    }

    pub async fn ack(self: &Arc<Self>, session_id: &str) {
        let Some((handle, mut s)) = self.lock_active(session_id).await else {
            return;
        };
        if !s.playing {
            debug!(session_id, "ack ignored, not playing");
            return;
        }
        self.trigger(&mut s, &handle);
    }

    /// Terminate with [`Outcome::Stopped`]. Returns `false` for unknown or
    /// already-ended sessions.
    pub async fn stop(&self, session_id: &str) -> bool {
        self.terminate(session_id, Outcome::Stopped).await
    }

    pub async fn set_speed(&self, session_id: &str, requested: Option<f64>) {
        let Some((_handle, mut s)) = self.lock_active(session_id).await else {
            return;
        };
        let speed = s.set_speed(requested);
        debug!(session_id, speed, "Playback speed set");
        let mut notice = SessionNotice::new(NoticeKind::Speed, session_id);
        notice.speed_mult = Some(speed);
        s.send(ServerMessage::Session(notice));
    }

    /// Reload the session against a new window. Pacing restarts at the top
    /// of the new window; if playing, the next event follows immediately.
    pub async fn seek(self: &Arc<Self>, session_id: &str, from: i64, to: i64) {
        let Some((handle, s)) = self.lock_active(session_id).await else {
            return;
        };
        let script_id = s.script_id.clone();
        drop(s);

        let loaded = match self.scripts.load_window(&script_id, from, to).await {
            Ok(lines) => self
                .scripts
                .load_characters(&script_id)
                .await
                .map(|characters| (lines, characters)),
            Err(e) => Err(e),
        };

        let mut s = handle.lock().await;
        if s.terminated {
            return;
        }
        let (lines, characters) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                let err = RehearsalError::script_load(&script_id, &e);
                warn!(session_id, error = %err, "Seek failed, window unchanged");
                s.send(ServerMessage::error(err.to_string(), Some(session_id)));
                return;
            }
        };

        s.reset_window(from, to, lines, characters);
        let mut notice = SessionNotice::new(NoticeKind::Seeked, session_id);
        notice.from = Some(from);
        notice.to = Some(to);
        notice.line_count = Some(s.lines.len());
        s.send(ServerMessage::Session(notice));
        debug!(session_id, from, to, lines = s.lines.len(), "Session seeked");

        if s.playing {
            self.trigger(&mut s, &handle);
        }
    }

    /// Move the cursor within the current window.
    pub async fn jump(self: &Arc<Self>, session_id: &str, target: i64) {
        let Some((handle, mut s)) = self.lock_active(session_id).await else {
            return;
        };
        let clamped = s.jump_to(target);
        let mut notice = SessionNotice::new(NoticeKind::Jumped, session_id);
        notice.target_idx = Some(clamped);
        s.send(ServerMessage::Session(notice));
        debug!(session_id, target, clamped, cursor = s.cursor, "Session jumped");

        if s.playing {
            self.trigger(&mut s, &handle);
        }
    }

    /// Terminate every session owned by a closed connection.
    pub async fn disconnect(&self, conn: ConnectionId) -> usize {
        self.open_connections.remove(&conn);
        let mut ended = 0;
        for id in self.registry.owned_by(conn) {
            if self.terminate(&id, Outcome::Disconnected).await {
                ended += 1;
            }
        }
        if ended > 0 {
            info!(conn_id = conn, sessions = ended, "Cleaned up sessions for closed connection");
        }
        ended
    }

    /// Expire sessions idle longer than the TTL as of `now`.
    pub async fn reap_idle(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for (id, handle) in self.registry.snapshot() {
            let idle = {
                let s = handle.lock().await;
                now.saturating_duration_since(s.last_activity_at) > self.settings.idle_ttl
            };
            if idle && self.terminate(&id, Outcome::Expired).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Run [`Engine::reap_idle`] every `every` until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Idle reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = engine.reap_idle(Instant::now()).await;
                        if reaped > 0 {
                            info!(reaped, "Reaped idle rehearsal sessions");
                        }
                    }
                }
            }
        })
    }

    // ── Internals ────────────────────────────────────────────────

    /// Look up and lock a live session, recording client activity.
    async fn lock_active(&self, session_id: &str) -> Option<(SessionHandle, OwnedMutexGuard<Session>)> {
        let Some(handle) = self.registry.get(session_id) else {
            debug!(session_id, "Message for unknown session ignored");
            return None;
        };
        let mut guard = Arc::clone(&handle).lock_owned().await;
        if guard.terminated {
            return None;
        }
        guard.touch();
        Some((handle, guard))
    }

    /// Remove a session and tear it down. Only the caller that wins the
    /// removal records the outcome.
    async fn terminate(&self, session_id: &str, outcome: Outcome) -> bool {
        let Some(handle) = self.registry.remove(session_id) else {
            return false;
        };
        let record = {
            let mut s = handle.lock().await;
            self.finish(&mut s, outcome)
        };
        self.record(record);
        true
    }

    /// Mark a removed session ended and build its history record.
    fn finish(&self, s: &mut Session, outcome: Outcome) -> PracticeRecord {
        s.terminated = true;
        s.playing = false;
        s.pending_self_line = None;

        if outcome != Outcome::Disconnected {
            let mut notice = SessionNotice::new(NoticeKind::Ended, &s.id);
            notice.reason = Some(outcome);
            s.send(ServerMessage::Session(notice));
        }

        let started = s.playback_started_at.unwrap_or(s.created_at);
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            session_id = %s.id,
            outcome = outcome.as_str(),
            last_idx = ?s.last_emitted_line_position,
            duration_ms,
            "Rehearsal session ended"
        );

        PracticeRecord {
            script_id: s.script_id.clone(),
            self_speaker: s.self_speaker.clone(),
            mode: s.mode,
            read_all_as_other: s.read_all_as_other,
            from: s.from,
            to: s.to,
            loops_completed: u32::from(outcome == Outcome::Completed),
            last_emitted_line_position: s.last_emitted_line_position,
            duration_ms,
            outcome,
            ended_at: Utc::now(),
        }
    }

    /// Write a history record. Failures are logged and dropped.
    fn record(&self, record: PracticeRecord) {
        if let Err(e) = self.recorder.record(&record) {
            warn!(
                script_id = %record.script_id,
                outcome = record.outcome.as_str(),
                error = %e,
                "Failed to write practice history"
            );
        }
    }

    /// Start an advance task unless one is already pacing this session.
    fn trigger(self: &Arc<Self>, s: &mut Session, handle: &SessionHandle) {
        if s.advancing {
            debug!(session_id = %s.id, "Advance already in flight");
            return;
        }
        s.advancing = true;
        let engine = Arc::clone(self);
        let handle = Arc::clone(handle);
        tokio::spawn(async move { engine.advance(handle).await });
    }

    /// One scheduler turn. Renders without holding the session lock and
    /// re-plans if a seek or jump superseded the render.
    async fn advance(self: Arc<Self>, handle: SessionHandle) {
        loop {
            let job = {
                let mut s = handle.lock().await;
                if s.terminated {
                    return;
                }
                match scheduler::plan(&mut s, &self.settings.default_voice) {
                    Step::Emit(ev) => {
                        self.emit(&mut s, &handle, ev);
                        return;
                    }
                    Step::Exhausted => {
                        s.advancing = false;
                        s.playing = false;
                        let id = s.id.clone();
                        // A concurrent stop may have won the removal.
                        if self.registry.remove(&id).is_none() {
                            return;
                        }
                        let record = self.finish(&mut s, Outcome::Completed);
                        drop(s);
                        self.record(record);
                        return;
                    }
                    Step::Render(job) => job,
                }
            };

            let result = self
                .renderer
                .render(&job.text, &job.voice, job.rate)
                .await;

            let mut s = handle.lock().await;
            if s.terminated {
                return;
            }
            if s.generation != job.generation {
                debug!(session_id = %s.id, "Render superseded by seek/jump, replanning");
                continue;
            }
            match scheduler::complete(&mut s, &job, result) {
                Some(ev) => self.emit(&mut s, &handle, ev),
                None => s.advancing = false,
            }
            return;
        }
    }

    fn emit(self: &Arc<Self>, s: &mut Session, handle: &SessionHandle, ev: RehearsalEvent) {
        debug!(
            session_id = %s.id,
            event_id = %ev.event_id,
            kind = ?ev.kind,
            idx = ev.idx,
            "Emitting rehearsal event"
        );
        s.send(ServerMessage::Event(ev));
        s.advancing = false;
        self.maybe_prefetch(s, handle);
    }

    fn maybe_prefetch(&self, s: &mut Session, handle: &SessionHandle) {
        if s.prefetch_in_flight || self.settings.prefetch_depth == 0 {
            return;
        }
        let targets = prefetch::targets(s, self.settings.prefetch_depth, &self.settings.default_voice);
        if targets.is_empty() {
            return;
        }
        s.prefetch_in_flight = true;
        let renderer = Arc::clone(&self.renderer);
        let handle = Arc::clone(handle);
        let session_id = s.id.clone();
        tokio::spawn(async move {
            prefetch::run(renderer, &session_id, targets).await;
            handle.lock().await.prefetch_in_flight = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryPracticeLog, MockPracticeRecorder};
    use crate::rehearsal::RehearsalMode;
    use crate::rehearsal::protocol::{EventKind, SessionNotice};
    use crate::rehearsal::session::tests::{request, scenario_lines};
    use crate::script::{CharacterVoice, MemoryScriptSource, ScriptLine, VoiceTable};
    use crate::speech::MockSpeechRenderer;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct Harness {
        engine: Arc<Engine>,
        scripts: Arc<GatedScripts>,
        speech: Arc<MockSpeechRenderer>,
        log: Arc<MemoryPracticeLog>,
        conn: ConnectionId,
        tx: Outbound,
        rx: UnboundedReceiver<ServerMessage>,
    }

    /// Script source with switchable load latency and failure.
    struct GatedScripts {
        inner: MemoryScriptSource,
        delay_ms: AtomicU64,
        failing: AtomicBool,
    }

    impl GatedScripts {
        async fn gate(&self) -> anyhow::Result<()> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("script store offline");
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ScriptSource for GatedScripts {
        async fn load_window(&self, script_id: &str, from: i64, to: i64) -> anyhow::Result<Vec<ScriptLine>> {
            self.gate().await?;
            self.inner.load_window(script_id, from, to).await
        }

        async fn load_characters(&self, script_id: &str) -> anyhow::Result<VoiceTable> {
            self.gate().await?;
            self.inner.load_characters(script_id).await
        }
    }

    fn gated_scripts() -> Arc<GatedScripts> {
        Arc::new(GatedScripts {
            inner: memory_scripts(),
            delay_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn memory_scripts() -> MemoryScriptSource {
        let scripts = MemoryScriptSource::new();
        scripts.insert(
            "mac",
            scenario_lines(),
            vec![(
                "OTHER",
                CharacterVoice {
                    voice: "witch".to_string(),
                    rate: 1.0,
                },
            )],
        );
        scripts.insert(
            "long",
            vec![
                ScriptLine::dialogue(1, "OTHER", "Fair is foul."),
                ScriptLine::dialogue(2, "OTHER", "And foul is fair."),
                ScriptLine::dialogue(3, "OTHER", "Hover through the fog."),
                ScriptLine::dialogue(4, "ME", "And filthy air."),
            ],
            vec![],
        );
        scripts
    }

    fn harness_with(speech: MockSpeechRenderer, settings: EngineSettings) -> Harness {
        let scripts = gated_scripts();
        let speech = Arc::new(speech);
        let log = Arc::new(MemoryPracticeLog::new());
        let engine = Arc::new(Engine::new(scripts.clone(), speech.clone(), log.clone(), settings));
        let conn = engine.next_connection_id();
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            engine,
            scripts,
            speech,
            log,
            conn,
            tx,
            rx,
        }
    }

    fn harness(speech: MockSpeechRenderer) -> Harness {
        harness_with(
            speech,
            EngineSettings {
                prefetch_depth: 0,
                ..Default::default()
            },
        )
    }

    async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("channel closed")
    }

    async fn next_event(rx: &mut UnboundedReceiver<ServerMessage>) -> RehearsalEvent {
        match next(rx).await {
            ServerMessage::Event(ev) => ev,
            other => panic!("expected event, got {:?}", other),
        }
    }

    async fn next_notice(rx: &mut UnboundedReceiver<ServerMessage>) -> SessionNotice {
        match next(rx).await {
            ServerMessage::Session(n) => n,
            other => panic!("expected session notice, got {:?}", other),
        }
    }

    async fn assert_quiet(rx: &mut UnboundedReceiver<ServerMessage>) {
        let got = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "unexpected message: {:?}", got);
    }

    async fn start(h: &mut Harness, req: StartRequest) -> SessionId {
        let id = h.engine.start(h.conn, h.tx.clone(), req).await.unwrap();
        let started = next_notice(&mut h.rx).await;
        assert_eq!(started.event, NoticeKind::Started);
        assert_eq!(started.session_id, id);
        id
    }

    #[tokio::test]
    async fn practice_run_reveals_self_line_and_completes() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;

        h.engine.play(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Direction);
        assert_eq!(ev.idx, 1);
        assert_eq!(ev.event_id, format!("{}_evt_1", id));

        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Line);
        assert_eq!(ev.idx, 2);
        assert_eq!(ev.speaker.as_deref(), Some("OTHER"));
        assert!(ev.audio.is_some());

        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Pause);
        assert_eq!(ev.idx, 3);
        assert!(ev.text.is_empty());
        let pause = ev.duration_sec.unwrap();
        assert!((0.8..=15.0).contains(&pause));

        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Line);
        assert_eq!(ev.idx, 3);
        assert_eq!(ev.text, "When the hurlyburly's done.");
        assert!(ev.audio.is_some());

        h.engine.ack(&id).await;
        let ended = next_notice(&mut h.rx).await;
        assert_eq!(ended.event, NoticeKind::Ended);
        assert_eq!(ended.reason, Some(Outcome::Completed));
        assert!(!h.engine.is_active(&id));

        let records = h.log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Completed);
        assert_eq!(records[0].loops_completed, 1);
        assert_eq!(records[0].last_emitted_line_position, Some(3));
        assert_eq!(records[0].mode, RehearsalMode::Practice);
    }

    #[tokio::test]
    async fn speed_through_never_renders() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("speed_through", "ME")).await;

        h.engine.play(&id).await;
        assert_eq!(next_event(&mut h.rx).await.kind, EventKind::Direction);
        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Gap);
        assert_eq!(ev.idx, 2);
        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Pause);
        assert_eq!(ev.idx, 3);

        assert_eq!(h.speech.calls(), 0);
    }

    #[tokio::test]
    async fn render_failure_degrades_to_gap() {
        let speech = MockSpeechRenderer::default().fail_on("When shall we three meet again?");
        let mut h = harness(speech);
        let id = start(&mut h, request("read_through", "ME")).await;

        h.engine.play(&id).await;
        next_event(&mut h.rx).await;
        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Gap);
        assert_eq!(ev.idx, 2);
        assert!(ev.audio.is_none());
        assert!(ev.duration_sec.unwrap() > 0.0);
        assert!(h.engine.is_active(&id));
    }

    #[tokio::test]
    async fn jump_clamps_to_window() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("read_through", "ME")).await;

        h.engine.jump(&id, 99).await;
        let n = next_notice(&mut h.rx).await;
        assert_eq!(n.event, NoticeKind::Jumped);
        assert_eq!(n.target_idx, Some(3));

        h.engine.jump(&id, -5).await;
        assert_eq!(next_notice(&mut h.rx).await.target_idx, Some(1));
        // Not playing, so nothing follows.
        assert_quiet(&mut h.rx).await;
    }

    #[tokio::test]
    async fn jump_while_playing_continues_from_target() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("read_through", "ME")).await;

        h.engine.play(&id).await;
        assert_eq!(next_event(&mut h.rx).await.idx, 1);
        h.engine.jump(&id, 3).await;
        assert_eq!(next_notice(&mut h.rx).await.event, NoticeKind::Jumped);
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.kind, EventKind::Line);
        assert_eq!(ev.idx, 3);
    }

    #[tokio::test]
    async fn jump_supersedes_in_flight_render() {
        let mut h = harness(MockSpeechRenderer::default().with_latency(150));
        let mut req = request("read_through", "ME");
        req.script_id = "long".to_string();
        req.from = None;
        req.to = None;
        let id = start(&mut h, req).await;

        h.engine.play(&id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.jump(&id, 3).await;
        assert_eq!(next_notice(&mut h.rx).await.target_idx, Some(3));

        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.idx, 3);
        assert_eq!(ev.text, "Hover through the fog.");
        assert_quiet(&mut h.rx).await;
    }

    #[tokio::test]
    async fn expired_session_ignores_later_acks() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;
        h.engine.play(&id).await;
        next_event(&mut h.rx).await;

        let later = Instant::now() + Duration::from_secs(31 * 60);
        assert_eq!(h.engine.reap_idle(later).await, 1);
        let ended = next_notice(&mut h.rx).await;
        assert_eq!(ended.reason, Some(Outcome::Expired));

        h.engine.ack(&id).await;
        assert_quiet(&mut h.rx).await;
        assert_eq!(h.log.records()[0].outcome, Outcome::Expired);
        assert_eq!(h.log.records()[0].loops_completed, 0);
    }

    #[tokio::test]
    async fn reaper_spares_active_sessions() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;
        assert_eq!(h.engine.reap_idle(Instant::now()).await, 0);
        assert!(h.engine.is_active(&id));
    }

    #[tokio::test]
    async fn reaper_task_runs_until_cancelled() {
        let mut h = harness_with(
            MockSpeechRenderer::default(),
            EngineSettings {
                idle_ttl: Duration::ZERO,
                prefetch_depth: 0,
                ..Default::default()
            },
        );
        let id = start(&mut h, request("practice", "ME")).await;

        let cancel = CancellationToken::new();
        let task = h.engine.spawn_reaper(Duration::from_millis(10), cancel.clone());
        let ended = next_notice(&mut h.rx).await;
        assert_eq!(ended.reason, Some(Outcome::Expired));
        assert!(!h.engine.is_active(&id));

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;

        assert!(h.engine.stop(&id).await);
        assert!(!h.engine.stop(&id).await);
        assert!(!h.engine.stop("nope").await);

        assert_eq!(next_notice(&mut h.rx).await.reason, Some(Outcome::Stopped));
        assert_quiet(&mut h.rx).await;
        assert_eq!(h.log.records().len(), 1);
        assert_eq!(h.engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn stop_during_render_emits_nothing_more() {
        let mut h = harness(MockSpeechRenderer::default().with_latency(100));
        let id = start(&mut h, request("read_through", "ME")).await;
        h.engine.play(&id).await;
        next_event(&mut h.rx).await;

        h.engine.ack(&id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.engine.stop(&id).await;
        assert_eq!(next_notice(&mut h.rx).await.reason, Some(Outcome::Stopped));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_quiet(&mut h.rx).await;
        assert_eq!(h.log.records().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_ends_owned_sessions_silently() {
        let mut h = harness(MockSpeechRenderer::default());
        let a = start(&mut h, request("practice", "ME")).await;
        let b = start(&mut h, request("read_through", "ME")).await;
        let (other_tx, _other_rx) = mpsc::unbounded_channel();
        let other_conn = h.engine.next_connection_id();
        let c = h
            .engine
            .start(other_conn, other_tx, request("practice", "ME"))
            .await
            .unwrap();

        assert_eq!(h.engine.disconnect(h.conn).await, 2);
        assert!(!h.engine.is_active(&a));
        assert!(!h.engine.is_active(&b));
        assert!(h.engine.is_active(&c));
        assert_quiet(&mut h.rx).await;

        let records = h.log.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.outcome == Outcome::Disconnected));
        assert_eq!(h.engine.disconnect(h.conn).await, 0);
    }

    #[tokio::test]
    async fn start_racing_disconnect_is_recorded_as_disconnected() {
        let mut h = harness(MockSpeechRenderer::default());
        h.scripts.delay_ms.store(100, Ordering::SeqCst);

        let engine = h.engine.clone();
        let (conn, tx) = (h.conn, h.tx.clone());
        let starting = tokio::spawn(async move { engine.start(conn, tx, request("practice", "ME")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.disconnect(h.conn).await, 0);

        let result = timeout(Duration::from_secs(2), starting).await.unwrap().unwrap();
        assert!(matches!(result, Err(RehearsalError::ConnectionClosed)));
        assert_eq!(h.engine.active_sessions(), 0);

        let records = h.log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Disconnected);
        // No `started` notice for a session nobody can drive.
        assert_quiet(&mut h.rx).await;
    }

    #[tokio::test]
    async fn failed_seek_keeps_window_and_cursor() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("read_through", "ME")).await;
        h.engine.play(&id).await;
        assert_eq!(next_event(&mut h.rx).await.idx, 1);

        h.scripts.failing.store(true, Ordering::SeqCst);
        h.engine.seek(&id, 2, 2).await;
        match next(&mut h.rx).await {
            ServerMessage::Error(e) => {
                assert_eq!(e.session_id.as_deref(), Some(id.as_str()));
                assert!(e.message.contains("script store offline"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        h.scripts.failing.store(false, Ordering::SeqCst);

        // Pacing continues from the old cursor in the old window.
        h.engine.ack(&id).await;
        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.idx, 2);
        assert_eq!(ev.event_id, format!("{}_evt_2", id));
        h.engine.ack(&id).await;
        assert_eq!(next_event(&mut h.rx).await.idx, 3);
    }

    #[tokio::test]
    async fn ack_before_play_is_ignored() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;
        h.engine.ack(&id).await;
        assert_quiet(&mut h.rx).await;

        h.engine.play(&id).await;
        assert_eq!(next_event(&mut h.rx).await.idx, 1);
        // A second play does not emit again.
        h.engine.play(&id).await;
        assert_quiet(&mut h.rx).await;
    }

    #[tokio::test]
    async fn seek_restarts_pacing_in_new_window() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("read_through", "ME")).await;
        h.engine.play(&id).await;
        next_event(&mut h.rx).await;

        h.engine.seek(&id, 2, 2).await;
        let n = next_notice(&mut h.rx).await;
        assert_eq!(n.event, NoticeKind::Seeked);
        assert_eq!(n.line_count, Some(1));

        let ev = next_event(&mut h.rx).await;
        assert_eq!(ev.idx, 2);
        assert_eq!(ev.event_id, format!("{}_evt_1", id));
    }

    #[tokio::test]
    async fn set_speed_clamps_and_reports() {
        let mut h = harness(MockSpeechRenderer::default());
        let id = start(&mut h, request("practice", "ME")).await;

        h.engine.set_speed(&id, Some(10.0)).await;
        let n = next_notice(&mut h.rx).await;
        assert_eq!(n.event, NoticeKind::Speed);
        assert_eq!(n.speed_mult, Some(3.0));

        // Invalid input keeps the current speed.
        h.engine.set_speed(&id, Some(f64::NAN)).await;
        assert_eq!(next_notice(&mut h.rx).await.speed_mult, Some(3.0));
    }

    #[tokio::test]
    async fn start_rejects_bad_requests() {
        let h = harness(MockSpeechRenderer::default());
        let mut req = request("practice", "ME");
        req.script_id = "  ".to_string();
        assert!(matches!(
            h.engine.start(h.conn, h.tx.clone(), req).await,
            Err(RehearsalError::MissingScript)
        ));

        let req = request("interpretive_dance", "ME");
        assert!(matches!(
            h.engine.start(h.conn, h.tx.clone(), req).await,
            Err(RehearsalError::UnknownMode(_))
        ));

        let mut req = request("practice", "ME");
        req.script_id = "hamlet".to_string();
        assert!(matches!(
            h.engine.start(h.conn, h.tx.clone(), req).await,
            Err(RehearsalError::ScriptLoad { .. })
        ));
        assert_eq!(h.engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn malformed_frames_get_error_replies() {
        let mut h = harness(MockSpeechRenderer::default());
        let tx = h.tx.clone();
        h.engine.handle_text(h.conn, &tx, "{not json").await;
        assert!(matches!(next(&mut h.rx).await, ServerMessage::Error(_)));

        h.engine
            .handle_text(h.conn, &tx, r#"{"type":"run_lines.start","script_id":"hamlet"}"#)
            .await;
        match next(&mut h.rx).await {
            ServerMessage::Error(e) => assert!(e.message.contains("hamlet")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn text_frames_drive_a_session() {
        let mut h = harness(MockSpeechRenderer::default());
        let tx = h.tx.clone();
        h.engine
            .handle_text(
                h.conn,
                &tx,
                r#"{"type":"run_lines.start","script_id":"mac","me":"ME","mode":"speed_through"}"#,
            )
            .await;
        let started = next_notice(&mut h.rx).await;
        assert_eq!(started.mode, Some(RehearsalMode::SpeedThrough));
        assert_eq!(started.speed_mult, Some(1.3));

        let play = format!(r#"{{"type":"run_lines.play","session_id":"{}"}}"#, started.session_id);
        h.engine.handle_text(h.conn, &tx, &play).await;
        assert_eq!(next_event(&mut h.rx).await.kind, EventKind::Direction);
    }

    #[tokio::test]
    async fn recorder_failure_does_not_block_teardown() {
        let mut recorder = MockPracticeRecorder::new();
        recorder
            .expect_record()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk full")));

        let engine = Arc::new(Engine::new(
            gated_scripts(),
            Arc::new(MockSpeechRenderer::default()),
            Arc::new(recorder),
            EngineSettings::default(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = engine.next_connection_id();
        let id = engine.start(conn, tx, request("practice", "ME")).await.unwrap();
        next_notice(&mut rx).await;

        assert!(engine.stop(&id).await);
        assert_eq!(next_notice(&mut rx).await.reason, Some(Outcome::Stopped));
        assert!(!engine.is_active(&id));
    }

    #[tokio::test]
    async fn prefetch_warms_upcoming_lines() {
        let mut h = harness_with(MockSpeechRenderer::default(), EngineSettings::default());
        let mut req = request("read_through", "ME");
        req.script_id = "long".to_string();
        req.from = None;
        req.to = None;
        let id = start(&mut h, req).await;

        h.engine.play(&id).await;
        assert_eq!(next_event(&mut h.rx).await.idx, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let texts = h.speech.rendered_texts();
        assert!(texts.contains(&"And foul is fair.".to_string()));
        assert!(texts.contains(&"Hover through the fog.".to_string()));
    }
}
