//! Per-call format conversion of pending bytes into device-ready buffers.
//!
//! [`FormatConverter::convert_once`] takes the bytes of one pending window,
//! hands every whole frame to the session's [`SampleConverter`] exactly once
//! and returns the converted frames as a [`ConvertedBuffer`] when anything was
//! produced.  With `end_of_stream` set the converter is told no further input
//! will arrive, which flushes the resampler's buffered tail.

use super::format::{bytes_to_samples, StreamFormat, BYTES_PER_FRAME};
use super::resample::{build_converter, ConvertError, ConverterInput, SampleConverter};

/// Minimum extra destination frames allocated on top of the rate-scaled
/// input size.
///
/// Absorbs rounding. A resampling converter raises the margin to its
/// [`SampleConverter::latency_frames`] so a window never overflows into the
/// next call.
pub const DEFAULT_CAPACITY_MARGIN_FRAMES: usize = 512;

// ---------------------------------------------------------------------------
// ConvertedBuffer
// ---------------------------------------------------------------------------

/// Audio in the device's native rate, ready to be scheduled for playback.
///
/// Frames are mono; the playback node fans them out to `format.channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedBuffer {
    pub samples: Vec<f32>,
    pub format: StreamFormat,
}

impl ConvertedBuffer {
    /// Number of frames in the buffer.
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.format.duration_secs(self.frames())
    }
}

// ---------------------------------------------------------------------------
// FormatConverter
// ---------------------------------------------------------------------------

/// Adapter between raw pending bytes and a [`SampleConverter`].
pub struct FormatConverter {
    inner: Box<dyn SampleConverter>,
    destination: StreamFormat,
    margin_frames: usize,
}

impl std::fmt::Debug for FormatConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatConverter")
            .field("source_rate", &self.inner.source_rate())
            .field("destination", &self.destination)
            .field("margin_frames", &self.margin_frames)
            .finish()
    }
}

impl FormatConverter {
    /// Wrap an existing converter producing `destination` audio.
    pub fn new(
        inner: Box<dyn SampleConverter>,
        destination: StreamFormat,
        margin_frames: usize,
    ) -> Self {
        Self {
            inner,
            destination,
            margin_frames: margin_frames.max(1),
        }
    }

    /// Build the converter for `source` → `destination` (see
    /// [`build_converter`]).
    ///
    /// # Errors
    ///
    /// Returns the construction error of the underlying converter.
    pub fn for_formats(
        source: StreamFormat,
        destination: StreamFormat,
        resampler_chunk_frames: usize,
        margin_frames: usize,
    ) -> Result<Self, ConvertError> {
        let inner = build_converter(source, destination, resampler_chunk_frames)?;
        Ok(Self::new(inner, destination, margin_frames))
    }

    /// Destination frames to allocate for `source_frames` input frames.
    pub fn destination_capacity(&self, source_frames: usize) -> usize {
        let ratio =
            f64::from(self.inner.destination_rate()) / f64::from(self.inner.source_rate());
        (source_frames as f64 * ratio).ceil() as usize + self.effective_margin()
    }

    fn effective_margin(&self) -> usize {
        self.margin_frames.max(self.inner.latency_frames())
    }

    /// Run one conversion pass over `pending`.
    ///
    /// * With no whole frame in `pending` and `end_of_stream == false`
    ///   nothing happens and `None` is returned; retry once more input exists.
    /// * Otherwise every whole frame is offered to the converter.  The source
    ///   buffer is supplied at most once per call; further polls report
    ///   [`ConverterInput::NoDataNow`], or [`ConverterInput::EndOfStream`] when
    ///   `end_of_stream` is set.
    /// * If the converter took the frames, exactly their bytes are removed
    ///   from the head of `pending`.
    ///
    /// Returns the converted buffer only if it holds at least one frame.
    ///
    /// # Errors
    ///
    /// Propagates [`ConvertError`] from the underlying converter.  `pending` is
    /// left untouched in that case.
    pub fn convert_once(
        &mut self,
        pending: &mut Vec<u8>,
        end_of_stream: bool,
    ) -> Result<Option<ConvertedBuffer>, ConvertError> {
        let frames = pending.len() / BYTES_PER_FRAME;
        if frames == 0 && !end_of_stream {
            return Ok(None);
        }

        let frame_bytes = frames * BYTES_PER_FRAME;
        let mut source = (frames > 0).then(|| bytes_to_samples(&pending[..frame_bytes]));
        let capacity = self.destination_capacity(frames);
        let mut output = Vec::with_capacity(capacity);
        let mut consumed = false;

        self.inner.convert(&mut output, capacity, &mut || {
            if let Some(samples) = source.take() {
                consumed = true;
                return ConverterInput::Data(samples);
            }
            if end_of_stream {
                ConverterInput::EndOfStream
            } else {
                ConverterInput::NoDataNow
            }
        })?;

        if consumed {
            pending.drain(..frame_bytes);
        }

        if output.is_empty() {
            return Ok(None);
        }
        Ok(Some(ConvertedBuffer {
            samples: output,
            format: self.destination,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
