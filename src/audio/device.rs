//! Contract between the engine and the device audio graph.
//!
//! The engine never talks to cpal directly.  Everything it needs from the
//! device goes through [`AudioGraph`]: the input tap, the player node
//! connected to the output, start/stop controls and reconfiguration notices.
//! [`crate::audio::CpalGraph`] is the production implementation; tests use
//! the fake in [`fake`].
//!
//! # Threading
//!
//! Callbacks handed to the graph ([`TapCallback`], [`CompletionCallback`],
//! [`ReconfigurationCallback`]) are invoked on device threads.  They must not
//! block; the engine's callbacks only push an event onto an unbounded channel.

use std::sync::Arc;

use thiserror::Error;

use super::converter::ConvertedBuffer;
use super::format::StreamFormat;

// ---------------------------------------------------------------------------
// CaptureBuffer
// ---------------------------------------------------------------------------

/// One microphone buffer as delivered by the input tap.
///
/// Samples are interleaved `f32` in the device's native format.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBuffer {
    pub samples: Vec<f32>,
    pub format: StreamFormat,
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Invoked on the device thread for every captured input buffer.
pub type TapCallback = Arc<dyn Fn(CaptureBuffer) + Send + Sync>;

/// Invoked once a scheduled buffer has been fully rendered by the device.
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Invoked when the device configuration changed underneath the graph
/// (default device switched, device lost …).
pub type ReconfigurationCallback = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Errors raised by an [`AudioGraph`].
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {0} device found on the default audio host")]
    NoDevice(&'static str),

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("failed to install input tap: {0}")]
    Tap(String),

    #[error("audio graph failed to start: {0}")]
    Start(String),
}

// ---------------------------------------------------------------------------
// AudioGraph trait
// ---------------------------------------------------------------------------

/// Device audio graph: an input node with a tap and a single player node
/// connected to the output.
///
/// All methods are called from the engine's execution context only.
pub trait AudioGraph: Send {
    /// Native format of the output connection the player renders into.
    fn output_format(&self) -> StreamFormat;

    /// Register the input tap.  `buffer_frames` requests a device buffer
    /// size; `None` leaves the choice to the device.
    fn install_input_tap(
        &mut self,
        buffer_frames: Option<u32>,
        on_buffer: TapCallback,
    ) -> Result<(), DeviceError>;

    /// Remove the input tap (teardown only).
    fn remove_input_tap(&mut self);

    /// Connect the player to the output and allocate resources.
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// Start the device streams.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop the device streams.
    fn stop(&mut self);

    /// Whether the device streams are currently running.
    fn is_running(&self) -> bool;

    /// Queue `buffer` behind everything already scheduled on the player.
    /// `on_complete` fires once the device has fully rendered it.
    fn schedule_buffer(&mut self, buffer: ConvertedBuffer, on_complete: CompletionCallback);

    /// Start (or resume) rendering scheduled buffers.
    fn play(&mut self);

    /// Stop the player and drop every scheduled buffer.  Completions of the
    /// dropped buffers are not invoked.
    fn stop_player(&mut self);

    /// Subscribe to device reconfiguration notifications.  Replaces any
    /// previous subscription.
    fn subscribe_reconfiguration(&mut self, callback: ReconfigurationCallback);

    /// Drop the reconfiguration subscription.
    fn unsubscribe_reconfiguration(&mut self);
}

// ---------------------------------------------------------------------------
// Fake graph (tests only)
// ---------------------------------------------------------------------------
