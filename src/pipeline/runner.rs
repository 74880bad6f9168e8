//! Engine execution context — the only place session state is touched.
//!
//! [`EngineRunner`] owns the [`AudioGraph`], the [`PlaybackQueue`] and the
//! active ingestion task, and consumes [`EngineEvent`]s from a
//! `tokio::sync::mpsc` unbounded channel.  Device threads (capture tap,
//! playback completions, reconfiguration notices) and the ingestion task only
//! ever *send* on that channel.
//!
//! # Event flow
//!
//! ```text
//! Command::Speak        ─▶ reset session → build FormatConverter → spawn Ingestion
//! Converted{session}    ─▶ PlaybackQueue::enqueue → schedule_buffer (+ play on first)
//! BufferCompleted       ─▶ PlaybackQueue::complete   ─┐
//! StreamFinished        ─▶ PlaybackQueue::finish     ─┴▶ speaking → false
//! StreamFailed          ─▶ log + session reset
//! Captured(buffer)      ─▶ mute gate → delegate.on_capture_buffer
//! Reconfigured          ─▶ restart once if running was intended
//! ```
//!
//! Every session-scoped event carries the [`SessionId`] it was produced for;
//! events from a superseded session are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::{
    required_chunk_bytes, AudioGraph, CaptureBuffer, ConvertError, ConvertedBuffer, DeviceError,
    FormatConverter, PendingBuffer, SharedPendingBuffer, StreamFormat,
};

use super::engine::{EngineConfig, EngineDelegate};
use super::scheduler::{Ingestion, SampleStream};
use super::state::{LifecycleState, PlaybackQueue, SessionId, SessionSnapshot};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the audio engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("format conversion failed: {0}")]
    Convert(#[from] ConvertError),

    /// The sample producer reported a failure.
    #[error("sample source failed: {0:#}")]
    Source(anyhow::Error),

    /// The execution context is gone (engine shut down).
    #[error("audio engine has shut down")]
    Closed,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Outcome of a setup request.
pub(crate) enum SetupReply {
    Done(Result<(), EngineError>),
    /// Precondition violated by the caller; the handle panics.
    Misuse(&'static str),
}

/// Requests issued through [`crate::pipeline::AudioEngine`].
pub(crate) enum Command {
    Setup {
        reply: oneshot::Sender<SetupReply>,
    },
    Start {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Speak {
        stream: SampleStream,
        reply: oneshot::Sender<Result<SessionId, EngineError>>,
    },
    EndSpeaking {
        reply: oneshot::Sender<()>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<()>,
    },
    SetDelegate {
        delegate: Option<Arc<dyn EngineDelegate>>,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// `reply` is `None` when sent from `Drop`.
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Everything the execution context reacts to.
pub(crate) enum EngineEvent {
    Command(Command),
    /// Input tap delivery (device thread).
    Captured(CaptureBuffer),
    /// The device fully rendered one buffer of `session` (device thread).
    BufferCompleted { session: SessionId },
    /// Device configuration changed (device thread).
    Reconfigured,
    /// The ingestion task produced a buffer.
    Converted {
        session: SessionId,
        buffer: ConvertedBuffer,
    },
    /// The producer is exhausted and every chunk has been converted.
    StreamFinished { session: SessionId },
    /// Ingestion stopped on an error.
    StreamFailed {
        session: SessionId,
        error: EngineError,
    },
}

// ---------------------------------------------------------------------------
// EngineRunner
// ---------------------------------------------------------------------------

/// State owned by the execution context.
pub(crate) struct EngineRunner {
    graph: Box<dyn AudioGraph>,
    config: EngineConfig,
    queue: PlaybackQueue,
    lifecycle: LifecycleState,
    pending: SharedPendingBuffer,
    ingestion: Option<JoinHandle<()>>,
    delegate: Option<Arc<dyn EngineDelegate>>,
    muted: Arc<AtomicBool>,
    speaking: watch::Sender<bool>,
    events: mpsc::UnboundedSender<EngineEvent>,
    reconfiguration_subscribed: bool,
    tap_installed: bool,
}

impl EngineRunner {
    pub(crate) fn new(
        graph: Box<dyn AudioGraph>,
        config: EngineConfig,
        muted: Arc<AtomicBool>,
        speaking: watch::Sender<bool>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            graph,
            config,
            queue: PlaybackQueue::new(),
            lifecycle: LifecycleState::Uninitialized,
            pending: PendingBuffer::shared(),
            ingestion: None,
            delegate: None,
            muted,
            speaking,
            events,
            reconfiguration_subscribed: false,
            tap_installed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Process events until shutdown or until every sender is gone.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Command(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                EngineEvent::Captured(buffer) => self.handle_capture(&buffer),
                EngineEvent::BufferCompleted { session } => self.handle_completion(session),
                EngineEvent::Reconfigured => self.handle_reconfiguration(),
                EngineEvent::Converted { session, buffer } => self.enqueue(session, buffer),
                EngineEvent::StreamFinished { session } => self.handle_finished(session),
                EngineEvent::StreamFailed { session, error } => {
                    self.handle_failure(session, &error)
                }
            }
        }

        log::info!("engine: execution context stopped");
    }

    /// Returns `false` once the context must end.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Setup { reply } => {
                let _ = reply.send(self.setup());
            }
            Command::Start { reply } => {
                let _ = reply.send(self.start());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Speak { stream, reply } => {
                let _ = reply.send(self.speak(stream));
            }
            Command::EndSpeaking { reply } => {
                self.reset_session("end speaking");
                let _ = reply.send(());
            }
            Command::SetMuted { muted, reply } => {
                let was = self.muted.swap(muted, Ordering::SeqCst);
                if was != muted {
                    log::info!(
                        "engine: microphone {}",
                        if muted { "muted" } else { "unmuted" }
                    );
                }
                let _ = reply.send(());
            }
            Command::SetDelegate { delegate, reply } => {
                self.delegate = delegate;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn setup(&mut self) -> SetupReply {
        if self.graph.is_running() {
            return SetupReply::Misuse("audio engine must be stopped before setup");
        }

        if !self.reconfiguration_subscribed {
            let events = self.events.clone();
            self.graph.subscribe_reconfiguration(Arc::new(move || {
                let _ = events.send(EngineEvent::Reconfigured);
            }));
            self.reconfiguration_subscribed = true;
        }

        if !self.tap_installed {
            let events = self.events.clone();
            let installed = self.graph.install_input_tap(
                self.config.capture_buffer_frames,
                Arc::new(move |buffer: CaptureBuffer| {
                    let _ = events.send(EngineEvent::Captured(buffer));
                }),
            );
            if let Err(e) = installed {
                return SetupReply::Done(Err(e.into()));
            }
            self.tap_installed = true;
        }

        if let Err(e) = self.graph.prepare() {
            return SetupReply::Done(Err(e.into()));
        }

        self.set_lifecycle(LifecycleState::Configured);
        SetupReply::Done(Ok(()))
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.graph.is_running() {
            log::debug!("engine: start ignored, already running");
            return Ok(());
        }
        self.graph.start()?;
        self.set_lifecycle(LifecycleState::Running);
        Ok(())
    }

    fn stop(&mut self) {
        self.reset_session("stop");
        if self.graph.is_running() {
            self.graph.stop();
        }
        self.set_lifecycle(LifecycleState::Stopped);
    }

    fn teardown(&mut self) {
        log::info!("engine: shutting down");
        if self.reconfiguration_subscribed {
            self.graph.unsubscribe_reconfiguration();
            self.reconfiguration_subscribed = false;
        }
        if self.tap_installed {
            self.graph.remove_input_tap();
            self.tap_installed = false;
        }
        self.stop();
    }

    /// Restart the device once after a configuration change if running was
    /// intended.  A failed restart leaves the graph stopped until the next
    /// notification.
    fn handle_reconfiguration(&mut self) {
        if self.lifecycle != LifecycleState::Running {
            log::debug!(
                "engine: configuration change while {}",
                self.lifecycle.label()
            );
            return;
        }
        if self.graph.is_running() {
            return;
        }

        log::info!("engine: device configuration changed, restarting");
        if let Err(e) = self.graph.start() {
            log::error!("engine: failed to restart after configuration change: {e}");
        }
    }

    fn set_lifecycle(&mut self, next: LifecycleState) {
        if self.lifecycle != next {
            log::info!(
                "engine: {} → {}",
                self.lifecycle.label(),
                next.label()
            );
            self.lifecycle = next;
        }
    }

    // -----------------------------------------------------------------------
    // Speaking session
    // -----------------------------------------------------------------------

    fn speak(&mut self, stream: SampleStream) -> Result<SessionId, EngineError> {
        self.reset_session("new stream");
        let session = self.queue.session();

        let source = StreamFormat::mono(self.config.source_sample_rate);
        let converter = match FormatConverter::for_formats(
            source,
            self.graph.output_format(),
            self.config.resampler_chunk_frames,
            self.config.capacity_margin_frames,
        ) {
            Ok(converter) => converter,
            Err(e) => {
                log::error!("engine: cannot convert {source:?} for output: {e}");
                self.reset_session("converter construction failed");
                return Err(e.into());
            }
        };

        // Fresh buffer per session, so a late write from the aborted task
        // cannot leak into this one.
        self.pending = PendingBuffer::shared();
        let ingestion = Ingestion {
            session,
            pending: Arc::clone(&self.pending),
            converter,
            chunk_bytes: required_chunk_bytes(
                self.config.source_sample_rate,
                self.config.chunk_duration_ms,
            ),
            events: self.events.clone(),
        };
        self.ingestion = Some(ingestion.spawn(stream));

        log::info!("engine: session {session} started");
        Ok(session)
    }

    fn enqueue(&mut self, session: SessionId, buffer: ConvertedBuffer) {
        let Some(enqueued) = self.queue.enqueue(session) else {
            log::trace!("engine: dropping buffer of stale session {session}");
            return;
        };

        log::debug!(
            "engine: scheduling {:.3} s ({session}, {} queued)",
            buffer.duration_secs(),
            self.queue.queued()
        );
        let events = self.events.clone();
        self.graph.schedule_buffer(
            buffer,
            Box::new(move || {
                let _ = events.send(EngineEvent::BufferCompleted { session });
            }),
        );

        if enqueued.start_output {
            self.graph.play();
        }
        if enqueued.started_speaking {
            log::info!("engine: speaking started ({session})");
            self.publish_speaking(true);
        }
    }

    fn handle_completion(&mut self, session: SessionId) {
        if let Some(speaking) = self.queue.complete(session) {
            log::info!("engine: speaking finished ({session})");
            self.publish_speaking(speaking);
        }
    }

    fn handle_finished(&mut self, session: SessionId) {
        if let Some(speaking) = self.queue.finish_stream(session) {
            log::info!("engine: speaking finished ({session})");
            self.publish_speaking(speaking);
        }
    }

    fn handle_failure(&mut self, session: SessionId, error: &EngineError) {
        if session != self.queue.session() {
            log::debug!("engine: ignoring failure of stale session {session}: {error}");
            return;
        }
        log::error!("engine: session {session} failed: {error}");
        self.reset_session("stream failure");
    }

    /// Stop the player, cancel ingestion and zero the counters.
    fn reset_session(&mut self, reason: &str) {
        self.graph.stop_player();
        if let Some(task) = self.ingestion.take() {
            task.abort();
        }
        self.pending.reset();

        let previous = self.queue.session();
        if let Some(speaking) = self.queue.reset() {
            self.publish_speaking(speaking);
        }
        log::debug!("engine: session {previous} reset ({reason})");
    }

    fn publish_speaking(&self, speaking: bool) {
        self.speaking.send_replace(speaking);
        if let Some(delegate) = &self.delegate {
            delegate.on_speaking_changed(speaking);
        }
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    fn handle_capture(&self, buffer: &CaptureBuffer) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_capture_buffer(buffer);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.queue.session(),
            queued: self.queue.queued(),
            first_buffer_queued: self.queue.first_buffer_queued(),
            stream_finished: self.queue.stream_finished(),
            is_speaking: self.queue.is_speaking(),
            lifecycle: self.lifecycle,
            graph_running: self.graph.is_running(),
            microphone_muted: self.muted.load(Ordering::SeqCst),
        }
    }
}
