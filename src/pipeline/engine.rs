//! Public engine handle.
//!
//! [`AudioEngine`] is a thin handle onto the execution context in
//! [`super::runner`]: every call becomes a command on the event channel and
//! waits for the context's acknowledgement.  Two values are mirrored outside
//! the context so they can be read synchronously: the speaking flag (a
//! `tokio::sync::watch` channel) and the microphone mute flag.
//!
//! ```rust,no_run
//! use voice_stream::audio::CpalGraph;
//! use voice_stream::pipeline::{AudioEngine, EngineConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = AudioEngine::new(Box::new(CpalGraph::new()?), EngineConfig::default());
//! engine.setup().await?;
//! engine.start().await?;
//!
//! let batches = futures::stream::iter(vec![anyhow::Ok(vec![0.0_f32; 24_000])]);
//! engine.speak_stream(batches).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::{
    AudioGraph, CaptureBuffer, DEFAULT_CAPACITY_MARGIN_FRAMES, DEFAULT_RESAMPLER_CHUNK_FRAMES,
};
use crate::config::AppConfig;

use super::runner::{Command, EngineError, EngineEvent, EngineRunner, SetupReply};
use super::state::{SessionId, SessionSnapshot};

// ---------------------------------------------------------------------------
// EngineDelegate
// ---------------------------------------------------------------------------

/// Observer of engine activity.
///
/// Both methods run inside the execution context and must return quickly.
pub trait EngineDelegate: Send + Sync {
    /// An unmuted microphone buffer in the device's native format.
    fn on_capture_buffer(&self, buffer: &CaptureBuffer);

    /// The speaking state flipped.
    fn on_speaking_changed(&self, speaking: bool);
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunables of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rate of the mono sample batches handed to `speak`.
    pub source_sample_rate: u32,
    /// Conversion window.
    pub chunk_duration_ms: u32,
    /// Extra destination frames allocated per conversion.
    pub capacity_margin_frames: usize,
    /// Input block size of the resampler.
    pub resampler_chunk_frames: usize,
    /// Requested input tap buffer size; `None` uses the device default.
    pub capture_buffer_frames: Option<u32>,
    pub start_muted: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 24_000,
            chunk_duration_ms: 1_000,
            capacity_margin_frames: DEFAULT_CAPACITY_MARGIN_FRAMES,
            resampler_chunk_frames: DEFAULT_RESAMPLER_CHUNK_FRAMES,
            capture_buffer_frames: None,
            start_muted: false,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            source_sample_rate: config.playback.source_sample_rate,
            chunk_duration_ms: config.playback.chunk_duration_ms,
            capacity_margin_frames: config.playback.capacity_margin_frames,
            resampler_chunk_frames: config.playback.resampler_chunk_frames,
            capture_buffer_frames: config.capture.buffer_frames,
            start_muted: config.capture.start_muted,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionOutcome
// ---------------------------------------------------------------------------

/// Why [`AudioEngine::wait_for_session`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The stream ended and every buffer finished playing.
    Finished,
    /// A newer session replaced the awaited one.
    Replaced,
    /// The interrupt resolved first; speaking was ended.
    Interrupted,
}

// ---------------------------------------------------------------------------
// AudioEngine
// ---------------------------------------------------------------------------

/// Streaming speech output with a gated microphone tap.
///
/// Dropping the handle shuts the engine down; [`shutdown`](Self::shutdown)
/// does the same and waits for it.
pub struct AudioEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    speaking: watch::Receiver<bool>,
    muted: Arc<AtomicBool>,
    context: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Spawn the execution context on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(graph: Box<dyn AudioGraph>, config: EngineConfig) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking) = watch::channel(false);
        let muted = Arc::new(AtomicBool::new(config.start_muted));

        let runner = EngineRunner::new(
            graph,
            config,
            Arc::clone(&muted),
            speaking_tx,
            events.clone(),
        );
        let context = tokio::spawn(runner.run(rx));

        Self {
            events,
            speaking,
            muted,
            context: Some(context),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::Command(command(reply)))
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Install the input tap, subscribe to reconfiguration notices and
    /// prepare the graph.  Safe to call again while stopped.
    ///
    /// # Panics
    ///
    /// Panics if the graph is running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Device`] if the tap or the graph cannot be set
    /// up.
    pub async fn setup(&self) -> Result<(), EngineError> {
        match self.request(|reply| Command::Setup { reply }).await? {
            SetupReply::Done(result) => result,
            SetupReply::Misuse(message) => panic!("{message}"),
        }
    }

    /// Start the device.  Does nothing if it already runs.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Device`] when the device fails to start.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Reset the active session and stop the device.
    pub async fn stop(&self) {
        let _ = self.request(|reply| Command::Stop { reply }).await;
    }

    /// Tear the engine down and wait for the execution context to end.
    pub async fn shutdown(mut self) {
        let _ = self
            .request(|reply| Command::Shutdown { reply: Some(reply) })
            .await;
        if let Some(context) = self.context.take() {
            let _ = context.await;
        }
    }

    // -----------------------------------------------------------------------
    // Speaking
    // -----------------------------------------------------------------------

    /// Play a stream of mono sample batches at the configured source rate,
    /// replacing whatever is currently playing.
    ///
    /// Returns as soon as ingestion has been started.  A failure of the
    /// stream later on resets the session and is only logged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Convert`] when no converter exists for the
    /// device's output format.
    pub async fn speak_stream<S>(&self, stream: S) -> Result<SessionId, EngineError>
    where
        S: Stream<Item = anyhow::Result<Vec<f32>>> + Send + 'static,
    {
        let stream = stream.boxed();
        self.request(|reply| Command::Speak { stream, reply }).await?
    }

    /// Play one batch of samples.
    ///
    /// # Errors
    ///
    /// See [`speak_stream`](Self::speak_stream).
    pub async fn speak(&self, samples: Vec<f32>) -> Result<SessionId, EngineError> {
        let batches: Vec<anyhow::Result<Vec<f32>>> = if samples.is_empty() {
            Vec::new()
        } else {
            vec![Ok(samples)]
        };
        self.speak_stream(futures::stream::iter(batches)).await
    }

    /// Stop speaking immediately.  The device keeps running.
    pub async fn end_speaking(&self) {
        let _ = self.request(|reply| Command::EndSpeaking { reply }).await;
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    /// Receiver that observes every speaking transition.
    pub fn speaking_changes(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }

    /// Check the session every `poll` until it has played out or been
    /// replaced.  If `interrupt` resolves first, speaking is ended.
    ///
    /// `interrupt` is polled across every check, so a signal that arrives
    /// while a snapshot is in flight is still observed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] after shutdown.
    pub async fn wait_for_session<F>(
        &self,
        session: SessionId,
        poll: Duration,
        interrupt: F,
    ) -> Result<SessionOutcome, EngineError>
    where
        F: Future,
    {
        tokio::pin!(interrupt);
        let mut tick = tokio::time::interval(poll);
        loop {
            tokio::select! {
                biased;
                _ = &mut interrupt => {
                    log::info!("engine: wait for {session} interrupted");
                    self.end_speaking().await;
                    return Ok(SessionOutcome::Interrupted);
                }
                _ = tick.tick() => {
                    let snapshot = self.snapshot().await?;
                    if snapshot.session != session {
                        return Ok(SessionOutcome::Replaced);
                    }
                    if snapshot.stream_finished && !snapshot.is_speaking {
                        return Ok(SessionOutcome::Finished);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    pub fn is_microphone_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Open or close the capture gate.  Buffers captured before this call
    /// are judged by the previous value.
    pub async fn set_microphone_muted(&self, muted: bool) {
        let _ = self
            .request(|reply| Command::SetMuted { muted, reply })
            .await;
    }

    pub async fn set_delegate(&self, delegate: Option<Arc<dyn EngineDelegate>>) {
        let _ = self
            .request(|reply| Command::SetDelegate { delegate, reply })
            .await;
    }

    /// Copy of the session counters and lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] after shutdown.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let _ = self
            .events
            .send(EngineEvent::Command(Command::Shutdown { reply: None }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audio::device::fake::FakeGraph;
    use crate::audio::StreamFormat;
    use crate::pipeline::LifecycleState;

    const RATE: u32 = 24_000;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingDelegate {
        speaking: Mutex<Vec<bool>>,
        captured: Mutex<Vec<usize>>,
    }

    impl RecordingDelegate {
        fn speaking(&self) -> Vec<bool> {
            self.speaking.lock().unwrap().clone()
        }

        fn captured(&self) -> Vec<usize> {
            self.captured.lock().unwrap().clone()
        }
    }

    impl EngineDelegate for RecordingDelegate {
        fn on_capture_buffer(&self, buffer: &CaptureBuffer) {
            self.captured.lock().unwrap().push(buffer.samples.len());
        }

        fn on_speaking_changed(&self, speaking: bool) {
            self.speaking.lock().unwrap().push(speaking);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn config() -> EngineConfig {
        EngineConfig {
            source_sample_rate: RATE,
            ..EngineConfig::default()
        }
    }

    /// Engine on a passthrough fake graph, set up and running.
    async fn running_engine() -> (AudioEngine, FakeGraph, Arc<RecordingDelegate>) {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        let engine = AudioEngine::new(Box::new(graph.clone()), config());
        let delegate = Arc::new(RecordingDelegate::default());
        engine.set_delegate(Some(delegate.clone())).await;
        engine.setup().await.unwrap();
        engine.start().await.unwrap();
        (engine, graph, delegate)
    }

    /// Poll the snapshot until `predicate` holds.
    async fn wait_until(
        engine: &AudioEngine,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        for _ in 0..500 {
            let snapshot = engine.snapshot().await.unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached: {:?}", engine.snapshot().await.unwrap());
    }

    fn seconds(secs: f32) -> Vec<f32> {
        vec![0.25; (RATE as f32 * secs) as usize]
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_seconds_schedule_two_buffers() {
        let (engine, graph, _) = running_engine().await;

        engine.speak(seconds(2.0)).await.unwrap();
        let snapshot = wait_until(&engine, |s| s.stream_finished).await;

        assert_eq!(graph.scheduled_frames(), vec![24_000, 24_000]);
        assert_eq!(snapshot.queued, 2);
        assert!(snapshot.first_buffer_queued);
        assert!(graph.state.lock().unwrap().playing);
    }

    #[tokio::test]
    async fn half_second_remainder_schedules_short_buffer() {
        let (engine, graph, _) = running_engine().await;

        engine.speak(seconds(2.5)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished).await;

        assert_eq!(graph.scheduled_frames(), vec![24_000, 24_000, 12_000]);
    }

    #[tokio::test]
    async fn batches_are_rechunked_across_boundaries() {
        let (engine, graph, _) = running_engine().await;

        let batches: Vec<anyhow::Result<Vec<f32>>> =
            vec![Ok(seconds(0.4)), Ok(seconds(0.4)), Ok(seconds(0.4))];
        engine
            .speak_stream(futures::stream::iter(batches))
            .await
            .unwrap();
        wait_until(&engine, |s| s.stream_finished).await;

        assert_eq!(graph.scheduled_frames().iter().sum::<usize>(), 28_800);
        assert_eq!(graph.scheduled_frames()[0], 24_000);
    }

    #[tokio::test]
    async fn resampled_output_keeps_duration() {
        let graph = FakeGraph::new(StreamFormat::mono(48_000));
        let engine = AudioEngine::new(Box::new(graph.clone()), config());
        engine.setup().await.unwrap();
        engine.start().await.unwrap();

        engine.speak(seconds(1.5)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished).await;

        assert_eq!(graph.scheduled_frames().iter().sum::<usize>(), 72_000);
    }

    // -----------------------------------------------------------------------
    // Speaking state
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn speaking_ends_after_stream_and_all_completions() {
        let (engine, graph, delegate) = running_engine().await;

        engine.speak(seconds(2.0)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished).await;
        assert!(engine.is_speaking());
        assert_eq!(delegate.speaking(), vec![true]);

        assert!(graph.complete_next());
        let snapshot = wait_until(&engine, |s| s.queued == 1).await;
        assert!(snapshot.is_speaking);

        assert!(graph.complete_next());
        wait_until(&engine, |s| !s.is_speaking).await;
        assert_eq!(delegate.speaking(), vec![true, false]);
        assert!(!engine.is_speaking());
    }

    #[tokio::test]
    async fn speaking_changes_are_observable() {
        let (engine, graph, _) = running_engine().await;
        let mut changes = engine.speaking_changes();

        engine.speak(seconds(1.0)).await.unwrap();
        changes.wait_for(|speaking| *speaking).await.unwrap();

        wait_until(&engine, |s| s.stream_finished).await;
        graph.complete_next();
        changes.wait_for(|speaking| !*speaking).await.unwrap();
    }

    #[tokio::test]
    async fn empty_stream_never_speaks() {
        let (engine, graph, delegate) = running_engine().await;

        engine.speak(Vec::new()).await.unwrap();
        let snapshot = wait_until(&engine, |s| s.stream_finished).await;

        assert!(!snapshot.is_speaking);
        assert!(graph.scheduled_frames().is_empty());
        assert!(delegate.speaking().is_empty());
    }

    #[tokio::test]
    async fn stop_while_queued_resets_immediately() {
        let (engine, graph, delegate) = running_engine().await;

        engine.speak(seconds(2.0)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished && s.queued == 2).await;

        engine.stop().await;
        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.queued, 0);
        assert!(!snapshot.is_speaking);
        assert_eq!(snapshot.lifecycle, LifecycleState::Stopped);
        assert!(!snapshot.graph_running);
        assert_eq!(graph.outstanding(), 0, "player queue dropped");
        assert_eq!(delegate.speaking(), vec![true, false]);
    }

    // -----------------------------------------------------------------------
    // Waiting on a session
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn wait_for_session_returns_once_played_out() {
        let (engine, graph, _) = running_engine().await;

        let session = engine.speak(seconds(1.0)).await.unwrap();
        let complete = async {
            wait_until(&engine, |s| s.stream_finished).await;
            assert!(graph.complete_next());
        };
        let wait = engine.wait_for_session(
            session,
            Duration::from_millis(1),
            std::future::pending::<()>(),
        );
        let (outcome, ()) = tokio::join!(wait, complete);

        assert_eq!(outcome.unwrap(), SessionOutcome::Finished);
    }

    /// The interrupt outlives many polls; it must still end speaking.
    #[tokio::test]
    async fn wait_for_session_observes_late_interrupt() {
        let (engine, _graph, delegate) = running_engine().await;

        let session = engine.speak(seconds(2.0)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished).await;

        let outcome = engine
            .wait_for_session(
                session,
                Duration::from_millis(1),
                tokio::time::sleep(Duration::from_millis(30)),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Interrupted);
        let snapshot = engine.snapshot().await.unwrap();
        assert!(!snapshot.is_speaking);
        assert_eq!(snapshot.queued, 0);
        assert!(snapshot.graph_running);
        assert_eq!(delegate.speaking(), vec![true, false]);
    }

    #[tokio::test]
    async fn wait_for_session_reports_replacement() {
        let (engine, _graph, _) = running_engine().await;

        let first = engine.speak(seconds(1.0)).await.unwrap();
        engine.speak(seconds(1.0)).await.unwrap();

        let outcome = engine
            .wait_for_session(first, Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Replaced);
    }

    #[tokio::test]
    async fn end_speaking_keeps_device_running() {
        let (engine, _graph, delegate) = running_engine().await;

        engine.speak(seconds(1.0)).await.unwrap();
        wait_until(&engine, |s| s.is_speaking).await;

        engine.end_speaking().await;
        let snapshot = engine.snapshot().await.unwrap();
        assert!(!snapshot.is_speaking);
        assert!(snapshot.graph_running);
        assert_eq!(delegate.speaking(), vec![true, false]);
    }

    #[tokio::test]
    async fn stale_completions_do_not_touch_new_session() {
        let (engine, graph, _) = running_engine().await;

        engine.speak(seconds(2.0)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished && s.queued == 2).await;
        let stale = graph.take_outstanding();

        let second = engine.speak(seconds(1.0)).await.unwrap();
        wait_until(&engine, |s| s.stream_finished && s.queued == 1).await;

        for done in stale {
            done();
        }
        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.session, second);
        assert_eq!(snapshot.queued, 1);
        assert!(snapshot.is_speaking);
    }

    #[tokio::test]
    async fn new_speak_replaces_current_session() {
        let (engine, graph, delegate) = running_engine().await;

        let first = engine.speak(seconds(1.0)).await.unwrap();
        wait_until(&engine, |s| s.is_speaking).await;
        let second = engine.speak(seconds(1.0)).await.unwrap();
        assert!(second > first);

        wait_until(&engine, |s| s.is_speaking && s.stream_finished).await;
        assert_eq!(delegate.speaking(), vec![true, false, true]);
        assert_eq!(graph.outstanding(), 1);
    }

    #[tokio::test]
    async fn producer_error_resets_session() {
        let (engine, graph, delegate) = running_engine().await;

        let batches: Vec<anyhow::Result<Vec<f32>>> = vec![
            Ok(seconds(1.0)),
            Err(anyhow::anyhow!("generation failed")),
        ];
        let session = engine
            .speak_stream(futures::stream::iter(batches))
            .await
            .unwrap();

        let snapshot = wait_until(&engine, |s| s.session != session).await;
        assert_eq!(snapshot.queued, 0);
        assert!(!snapshot.is_speaking);
        assert!(snapshot.graph_running, "a stream failure does not stop the device");
        assert_eq!(graph.outstanding(), 0);
        assert_eq!(delegate.speaking(), vec![true, false]);
    }

    #[tokio::test]
    async fn invalid_source_rate_is_rejected() {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        let engine = AudioEngine::new(
            Box::new(graph),
            EngineConfig {
                source_sample_rate: 0,
                ..EngineConfig::default()
            },
        );

        let err = engine.speak(seconds(1.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Convert(_)));
        assert!(!engine.is_speaking());
    }

    // -----------------------------------------------------------------------
    // Capture tap
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn muted_capture_is_dropped() {
        let (engine, graph, delegate) = running_engine().await;

        engine.set_microphone_muted(true).await;
        assert!(engine.is_microphone_muted());
        graph.deliver_capture(vec![0.0; 256]);
        graph.deliver_capture(vec![0.0; 256]);
        engine.snapshot().await.unwrap();
        assert!(delegate.captured().is_empty());

        engine.set_microphone_muted(false).await;
        graph.deliver_capture(vec![0.0; 128]);
        engine.snapshot().await.unwrap();
        assert_eq!(delegate.captured(), vec![128]);
    }

    #[tokio::test]
    async fn start_muted_gates_from_the_first_buffer() {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        let engine = AudioEngine::new(
            Box::new(graph.clone()),
            EngineConfig {
                start_muted: true,
                ..config()
            },
        );
        let delegate = Arc::new(RecordingDelegate::default());
        engine.set_delegate(Some(delegate.clone())).await;
        engine.setup().await.unwrap();

        graph.deliver_capture(vec![0.0; 64]);
        assert!(engine.snapshot().await.unwrap().microphone_muted);
        assert!(delegate.captured().is_empty());
    }

    #[tokio::test]
    async fn capture_without_delegate_is_ignored() {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        let engine = AudioEngine::new(Box::new(graph.clone()), config());
        engine.setup().await.unwrap();

        graph.deliver_capture(vec![0.0; 64]);
        engine.snapshot().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn setup_is_idempotent_while_stopped() {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        let engine = AudioEngine::new(Box::new(graph.clone()), config());

        engine.setup().await.unwrap();
        engine.setup().await.unwrap();

        let st = graph.state.lock().unwrap();
        assert_eq!(st.tap_installs, 1);
        assert!(st.prepared);
        assert!(st.reconfiguration.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "must be stopped before setup")]
    async fn setup_while_running_panics() {
        let (engine, _graph, _) = running_engine().await;
        let _ = engine.setup().await;
    }

    #[tokio::test]
    async fn start_when_running_is_a_noop() {
        let (engine, graph, _) = running_engine().await;
        engine.start().await.unwrap();
        assert_eq!(graph.state.lock().unwrap().start_calls, 1);
        assert_eq!(
            engine.snapshot().await.unwrap().lifecycle,
            LifecycleState::Running
        );
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let graph = FakeGraph::new(StreamFormat::mono(RATE));
        graph.set_fail_start(true);
        let engine = AudioEngine::new(Box::new(graph), config());
        engine.setup().await.unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Device(_)));
        assert_eq!(
            engine.snapshot().await.unwrap().lifecycle,
            LifecycleState::Configured
        );
    }

    #[tokio::test]
    async fn reconfiguration_restarts_stopped_device() {
        let (engine, graph, _) = running_engine().await;

        graph.set_running(false);
        graph.reconfigure();
        let snapshot = wait_until(&engine, |s| s.graph_running).await;

        assert_eq!(snapshot.lifecycle, LifecycleState::Running);
        assert_eq!(graph.state.lock().unwrap().start_calls, 2);
    }

    #[tokio::test]
    async fn failed_restart_leaves_engine_stopped() {
        let (engine, graph, _) = running_engine().await;

        graph.set_running(false);
        graph.set_fail_start(true);
        graph.reconfigure();
        wait_until(&engine, |_| graph.state.lock().unwrap().start_calls == 2).await;
        assert!(!engine.snapshot().await.unwrap().graph_running);

        // The next notification tries again.
        graph.set_fail_start(false);
        graph.reconfigure();
        wait_until(&engine, |s| s.graph_running).await;
    }

    #[tokio::test]
    async fn reconfiguration_after_stop_does_not_restart() {
        let (engine, graph, _) = running_engine().await;

        engine.stop().await;
        graph.reconfigure();
        let snapshot = engine.snapshot().await.unwrap();

        assert!(!snapshot.graph_running);
        assert_eq!(graph.state.lock().unwrap().start_calls, 1);
    }

    #[tokio::test]
    async fn shutdown_tears_down_graph() {
        let (engine, graph, _) = running_engine().await;

        engine.shutdown().await;

        let st = graph.state.lock().unwrap();
        assert!(st.tap.is_none());
        assert!(st.reconfiguration.is_none());
        assert!(!st.running);
    }

    #[tokio::test]
    async fn app_config_maps_onto_engine_config() {
        let mut app = AppConfig::default();
        app.playback.source_sample_rate = 22_050;
        app.capture.buffer_frames = Some(4_800);
        app.capture.start_muted = true;

        let config = EngineConfig::from(&app);
        assert_eq!(config.source_sample_rate, 22_050);
        assert_eq!(config.capture_buffer_frames, Some(4_800));
        assert!(config.start_muted);
        assert_eq!(config.chunk_duration_ms, 1_000);
    }
}
