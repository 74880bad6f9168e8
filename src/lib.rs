//! Real-time streaming speech output with a microphone capture tap.
//!
//! Float sample batches produced asynchronously (typically by a TTS model)
//! are buffered, converted to the output device's native format one
//! fixed-size window at a time and scheduled for gapless playback.  The
//! engine exposes a single "is speaking" signal and forwards unmuted
//! microphone buffers to a delegate.
//!
//! See [`pipeline::AudioEngine`] for the entry point.

pub mod audio;
pub mod config;
pub mod pipeline;
