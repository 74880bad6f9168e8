//! Audio building blocks — byte buffering, format conversion and the device
//! graph.
//!
//! # Pipeline
//!
//! ```text
//! Vec<f32> batch → samples_to_bytes → PendingBuffer → fixed-size chunk
//!     → FormatConverter::convert_once (SampleConverter: passthrough | rubato)
//!     → ConvertedBuffer → AudioGraph::schedule_buffer → PlayerNode → device
//!
//! device input → InputTap → CaptureBuffer → TapCallback
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use voice_stream::audio::{
//!     required_chunk_bytes, samples_to_bytes, FormatConverter, PendingBuffer, StreamFormat,
//! };
//!
//! let source = StreamFormat::mono(24_000);
//! let mut converter =
//!     FormatConverter::for_formats(source, StreamFormat::mono(24_000), 1_024, 512).unwrap();
//!
//! let pending = PendingBuffer::new();
//! pending.append(&samples_to_bytes(&vec![0.0_f32; 24_000]));
//!
//! let mut chunk = pending.extract_chunk(required_chunk_bytes(24_000, 1_000)).unwrap();
//! let buffer = converter.convert_once(&mut chunk, false).unwrap().unwrap();
//! assert_eq!(buffer.frames(), 24_000);
//! ```

pub mod buffer;
pub mod capture;
pub mod converter;
pub mod device;
pub mod format;
pub mod graph;
pub mod playback;
pub mod resample;

pub use buffer::{PendingBuffer, SharedPendingBuffer};
pub use capture::{InputTap, StreamHandle};
pub use converter::{ConvertedBuffer, FormatConverter, DEFAULT_CAPACITY_MARGIN_FRAMES};
pub use device::{
    AudioGraph, CaptureBuffer, CompletionCallback, DeviceError, ReconfigurationCallback,
    TapCallback,
};
pub use format::{
    bytes_to_samples, required_chunk_bytes, samples_to_bytes, StreamFormat, BYTES_PER_FRAME,
};
pub use graph::CpalGraph;
pub use playback::PlayerNode;
pub use resample::{
    build_converter, ConvertError, ConverterInput, PassthroughConverter, RubatoConverter,
    SampleConverter, DEFAULT_RESAMPLER_CHUNK_FRAMES,
};
