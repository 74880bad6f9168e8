//! Pull-based sample-rate conversion primitives.
//!
//! A [`SampleConverter`] is built once per speaking session from a source and
//! a destination format.  Each call to [`SampleConverter::convert`] fills an
//! output buffer up to a fixed capacity, polling an input callback for data as
//! often as it needs to.  The callback answers with a [`ConverterInput`]:
//!
//! * [`ConverterInput::Data`]: a batch of source frames,
//! * [`ConverterInput::NoDataNow`]: nothing right now, return what you have,
//! * [`ConverterInput::EndOfStream`]: no more input will ever arrive; release
//!   any internally buffered tail.
//!
//! Two implementations exist:
//!
//! 1. [`PassthroughConverter`]: source and destination rates are equal, frames
//!    are copied through unchanged.
//! 2. [`RubatoConverter`]: FFT resampling with `rubato::FftFixedIn`.
//!
//! Output that does not fit into the capacity of one call stays queued inside
//! the converter and is delivered first on the next call.

use std::collections::VecDeque;

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

use super::format::StreamFormat;

/// Number of input frames rubato processes per FFT pass.
pub const DEFAULT_RESAMPLER_CHUNK_FRAMES: usize = 1_024;

// ---------------------------------------------------------------------------
// ConvertError
// ---------------------------------------------------------------------------

/// Errors raised while building or running a converter.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The format pair cannot be converted (zero rate, zero channels …).
    #[error("unsupported conversion {from:?} -> {to:?}")]
    UnsupportedFormat { from: StreamFormat, to: StreamFormat },

    /// rubato rejected the resampler parameters.
    #[error("failed to construct resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    /// rubato failed while processing a chunk.
    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

// ---------------------------------------------------------------------------
// ConverterInput
// ---------------------------------------------------------------------------

/// Answer of the input callback polled by [`SampleConverter::convert`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterInput {
    /// Source frames (mono `f32`).
    Data(Vec<f32>),
    /// No input available at the moment; the call should return.
    NoDataNow,
    /// Input is exhausted for good; buffered state must be flushed.
    EndOfStream,
}

// ---------------------------------------------------------------------------
// SampleConverter trait
// ---------------------------------------------------------------------------

/// Stateful, pull-based converter from one mono `f32` rate to another.
pub trait SampleConverter: Send {
    /// Source sample rate in Hz.
    fn source_rate(&self) -> u32;

    /// Destination sample rate in Hz.
    fn destination_rate(&self) -> u32;

    /// Destination frames one `convert` call may deliver beyond the
    /// rate-scaled size of the input it was handed.
    ///
    /// Covers look-ahead held back from earlier calls that completes a pass
    /// now, plus the converter's output delay.
    fn latency_frames(&self) -> usize {
        0
    }

    /// Append converted frames to `output` until it holds `capacity` frames,
    /// the callback reports [`ConverterInput::NoDataNow`], or the stream has
    /// ended and everything buffered has been delivered.
    fn convert(
        &mut self,
        output: &mut Vec<f32>,
        capacity: usize,
        input: &mut dyn FnMut() -> ConverterInput,
    ) -> Result<(), ConvertError>;
}

/// Build the converter for a `source` → `destination` pair.
///
/// Equal rates give a [`PassthroughConverter`]; anything else a
/// [`RubatoConverter`] processing `chunk_frames` input frames per pass.
pub fn build_converter(
    source: StreamFormat,
    destination: StreamFormat,
    chunk_frames: usize,
) -> Result<Box<dyn SampleConverter>, ConvertError> {
    if source.sample_rate == 0
        || destination.sample_rate == 0
        || source.channels == 0
        || destination.channels == 0
    {
        return Err(ConvertError::UnsupportedFormat {
            from: source,
            to: destination,
        });
    }

    if source.sample_rate == destination.sample_rate {
        log::debug!("resample: passthrough at {} Hz", source.sample_rate);
        return Ok(Box::new(PassthroughConverter::new(source.sample_rate)));
    }

    log::debug!(
        "resample: {} Hz -> {} Hz ({} frames per pass)",
        source.sample_rate,
        destination.sample_rate,
        chunk_frames
    );
    Ok(Box::new(RubatoConverter::new(
        source.sample_rate,
        destination.sample_rate,
        chunk_frames,
    )?))
}

// ---------------------------------------------------------------------------
// Shared pull loop
// ---------------------------------------------------------------------------

/// Internal processing stage shared by both converters.
trait Stage {
    fn ready(&mut self) -> &mut VecDeque<f32>;
    fn is_finished(&self) -> bool;
    fn feed(&mut self, samples: Vec<f32>) -> Result<(), ConvertError>;
    fn finish(&mut self) -> Result<(), ConvertError>;
}

fn pull<S: Stage>(
    stage: &mut S,
    output: &mut Vec<f32>,
    capacity: usize,
    input: &mut dyn FnMut() -> ConverterInput,
) -> Result<(), ConvertError> {
    loop {
        let room = capacity.saturating_sub(output.len());
        let ready = stage.ready();
        let n = room.min(ready.len());
        output.extend(ready.drain(..n));

        if output.len() >= capacity || stage.is_finished() {
            return Ok(());
        }

        match input() {
            ConverterInput::Data(samples) => stage.feed(samples)?,
            ConverterInput::NoDataNow => return Ok(()),
            ConverterInput::EndOfStream => stage.finish()?,
        }
    }
}

// ---------------------------------------------------------------------------
// PassthroughConverter
// ---------------------------------------------------------------------------

/// Converter for equal source and destination rates.
#[derive(Debug)]
pub struct PassthroughConverter {
    rate: u32,
    ready: VecDeque<f32>,
    finished: bool,
}

impl PassthroughConverter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            ready: VecDeque::new(),
            finished: false,
        }
    }
}

impl Stage for PassthroughConverter {
    fn ready(&mut self) -> &mut VecDeque<f32> {
        &mut self.ready
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn feed(&mut self, samples: Vec<f32>) -> Result<(), ConvertError> {
        self.ready.extend(samples);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ConvertError> {
        self.finished = true;
        Ok(())
    }
}

impl SampleConverter for PassthroughConverter {
    fn source_rate(&self) -> u32 {
        self.rate
    }

    fn destination_rate(&self) -> u32 {
        self.rate
    }

    fn convert(
        &mut self,
        output: &mut Vec<f32>,
        capacity: usize,
        input: &mut dyn FnMut() -> ConverterInput,
    ) -> Result<(), ConvertError> {
        pull(self, output, capacity, input)
    }
}

// ---------------------------------------------------------------------------
// RubatoConverter
// ---------------------------------------------------------------------------

/// FFT resampler backed by `rubato::FftFixedIn`.
///
/// `FftFixedIn` consumes exactly `input_frames_next()` frames per pass, so
/// input shorter than that is held back until more arrives or the stream
/// ends.  The resampler's start-up delay is trimmed from the output, and at
/// end of stream zero padding is pushed through until the total output equals
/// `round(input_frames * ratio)`.
pub struct RubatoConverter {
    resampler: FftFixedIn<f32>,
    source_rate: u32,
    destination_rate: u32,
    /// Look-ahead input waiting for a full resampler chunk.
    pending: Vec<f32>,
    /// Converted frames not yet delivered.
    ready: VecDeque<f32>,
    /// Output frames still to discard for the resampler delay.
    delay_remaining: usize,
    frames_in: usize,
    frames_out: usize,
    finished: bool,
}

impl std::fmt::Debug for RubatoConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RubatoConverter")
            .field("source_rate", &self.source_rate)
            .field("destination_rate", &self.destination_rate)
            .field("pending", &self.pending.len())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

impl RubatoConverter {
    /// Create a mono resampler from `source_rate` to `destination_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::Construction`] when rubato rejects the rates or
    /// chunk size.
    pub fn new(
        source_rate: u32,
        destination_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self, ConvertError> {
        let resampler = FftFixedIn::<f32>::new(
            source_rate as usize,
            destination_rate as usize,
            chunk_frames.max(1),
            2, // sub_chunks
            1, // mono
        )?;
        let delay = resampler.output_delay();

        Ok(Self {
            resampler,
            source_rate,
            destination_rate,
            pending: Vec::new(),
            ready: VecDeque::new(),
            delay_remaining: delay,
            frames_in: 0,
            frames_out: 0,
            finished: false,
        })
    }

    fn ratio(&self) -> f64 {
        f64::from(self.destination_rate) / f64::from(self.source_rate)
    }

    fn push_output(&mut self, frames: &[f32]) {
        let skip = self.delay_remaining.min(frames.len());
        self.delay_remaining -= skip;
        self.ready.extend(&frames[skip..]);
        self.frames_out += frames.len() - skip;
    }

    fn expected_output(&self) -> usize {
        (self.frames_in as f64 * self.ratio()).round() as usize
    }
}

impl Stage for RubatoConverter {
    fn ready(&mut self) -> &mut VecDeque<f32> {
        &mut self.ready
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn feed(&mut self, samples: Vec<f32>) -> Result<(), ConvertError> {
        self.frames_in += samples.len();
        self.pending.extend(samples);

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }
            let chunk = [self.pending.drain(..needed).collect::<Vec<f32>>()];
            let out = self.resampler.process(&chunk[..], None)?;
            self.push_output(&out[0]);
        }
    }

    fn finish(&mut self) -> Result<(), ConvertError> {
        if !self.pending.is_empty() {
            let tail = [std::mem::take(&mut self.pending)];
            let out = self.resampler.process_partial(Some(&tail[..]), None)?;
            self.push_output(&out[0]);
        }

        // Push zeros through until the delayed tail has come out.
        let expected = self.expected_output();
        while self.frames_out < expected {
            let out = self.resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            if out[0].is_empty() {
                break;
            }
            self.push_output(&out[0]);
        }

        let overshoot = self.frames_out.saturating_sub(expected);
        let keep = self.ready.len().saturating_sub(overshoot);
        self.ready.truncate(keep);
        self.frames_out -= overshoot.min(self.frames_out);

        self.finished = true;
        Ok(())
    }
}

impl SampleConverter for RubatoConverter {
    fn source_rate(&self) -> u32 {
        self.source_rate
    }

    fn destination_rate(&self) -> u32 {
        self.destination_rate
    }

    fn latency_frames(&self) -> usize {
        self.resampler.output_frames_max() + self.resampler.output_delay()
    }

    fn convert(
        &mut self,
        output: &mut Vec<f32>,
        capacity: usize,
        input: &mut dyn FnMut() -> ConverterInput,
    ) -> Result<(), ConvertError> {
        pull(self, output, capacity, input)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
