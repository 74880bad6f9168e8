//! Session bookkeeping and the engine lifecycle state machine.
//!
//! [`PlaybackQueue`] tracks the counters of the active speaking session and
//! derives the "is speaking" transitions from them.  It is plain data owned by
//! the engine's execution context; every mutation is tagged with the
//! [`SessionId`] it belongs to, and anything tagged with a superseded session
//! is ignored.
//!
//! [`LifecycleState`] is the engine-level state machine:
//!
//! ```text
//! Uninitialized ──setup──▶ Configured ──start──▶ Running ──stop──▶ Stopped
//!                                                   ▲                 │
//!                                                   └──────start──────┘
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Monotonically increasing identifier of one `speak` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw counter value.
    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PlaybackQueue
// ---------------------------------------------------------------------------

/// What the engine must do after a buffer was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// First buffer of the session: the player must start rendering.
    pub start_output: bool,
    /// `is_speaking` flipped `false → true`; the delegate must be notified.
    pub started_speaking: bool,
}

/// Counters of the active session.
///
/// Methods returning `Option<bool>` report a speaking-state transition: the
/// new value when it changed, `None` otherwise.
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    session: SessionId,
    queued: usize,
    first_buffer_queued: bool,
    stream_finished: bool,
    is_speaking: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier of the active session.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Buffers scheduled and not yet completed.
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn first_buffer_queued(&self) -> bool {
        self.first_buffer_queued
    }

    pub fn stream_finished(&self) -> bool {
        self.stream_finished
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    fn is_current(&self, session: SessionId) -> bool {
        session == self.session
    }

    /// Zero every counter and advance to a fresh session identifier, so that
    /// late events from the old session no longer match.
    pub fn reset(&mut self) -> Option<bool> {
        self.session = self.session.next();
        self.queued = 0;
        self.first_buffer_queued = false;
        self.stream_finished = false;

        if self.is_speaking {
            self.is_speaking = false;
            Some(false)
        } else {
            None
        }
    }

    /// Record a buffer scheduled for `session`.
    ///
    /// Returns `None` for a superseded session; the buffer must be dropped.
    pub fn enqueue(&mut self, session: SessionId) -> Option<Enqueued> {
        if !self.is_current(session) {
            return None;
        }
        self.queued += 1;

        let start_output = !self.first_buffer_queued;
        self.first_buffer_queued = true;

        let started_speaking = start_output && !self.is_speaking;
        if started_speaking {
            self.is_speaking = true;
        }

        Some(Enqueued {
            start_output,
            started_speaking,
        })
    }

    /// Record that the device finished rendering one buffer of `session`.
    pub fn complete(&mut self, session: SessionId) -> Option<bool> {
        if !self.is_current(session) {
            return None;
        }
        self.queued = self.queued.saturating_sub(1);
        self.settle()
    }

    /// Record that the producer of `session` is exhausted and every chunk has
    /// been converted and enqueued.
    pub fn finish_stream(&mut self, session: SessionId) -> Option<bool> {
        if !self.is_current(session) {
            return None;
        }
        self.stream_finished = true;
        self.settle()
    }

    fn settle(&mut self) -> Option<bool> {
        if self.stream_finished && self.queued == 0 && self.is_speaking {
            self.is_speaking = false;
            Some(false)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// `setup` has not run yet.
    #[default]
    Uninitialized,
    /// Tap installed and player connected; device not started.
    Configured,
    /// Device expected to be running.  A reconfiguration that finds it
    /// stopped triggers a restart attempt.
    Running,
    /// Explicitly stopped.
    Stopped,
}

impl LifecycleState {
    /// A short human-readable label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// SessionSnapshot
// ---------------------------------------------------------------------------

/// Read-only copy of the engine state, taken inside the execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: SessionId,
    pub queued: usize,
    pub first_buffer_queued: bool,
    pub stream_finished: bool,
    pub is_speaking: bool,
    pub lifecycle: LifecycleState,
    pub graph_running: bool,
    pub microphone_muted: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
