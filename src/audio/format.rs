//! Stream formats and the raw byte representation of sample batches.
//!
//! The pipeline only ever carries **single-channel `f32`** audio internally,
//! so one frame is exactly one 32-bit float.  Sample batches are appended to
//! the pending buffer verbatim as native-endian bytes and read back the same
//! way, so no scaling or format change happens before conversion.

/// Size in bytes of one source frame (one mono `f32` sample).
pub const BYTES_PER_FRAME: usize = std::mem::size_of::<f32>();

// ---------------------------------------------------------------------------
// StreamFormat
// ---------------------------------------------------------------------------

/// Sample rate and channel layout of a stream.
///
/// Samples are always `f32`; `channels` only matters on the device side where
/// mono frames are fanned out to every output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz (e.g. 24 000, 48 000).
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl StreamFormat {
    /// Single-channel format at `sample_rate`.
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Duration in seconds of `frames` frames in this format.
    pub fn duration_secs(&self, frames: usize) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f32 / self.sample_rate as f32
    }
}

// ---------------------------------------------------------------------------
// Chunk sizing
// ---------------------------------------------------------------------------

/// Number of bytes in one conversion window of `chunk_ms` milliseconds of
/// mono `f32` audio at `source_rate` Hz.
///
/// The result is computed as a whole number of frames times
/// [`BYTES_PER_FRAME`], so it is always frame-aligned.  A window is never
/// smaller than one frame.
///
/// ```
/// use voice_stream::audio::{required_chunk_bytes, BYTES_PER_FRAME};
///
/// // one second at 24 kHz
/// assert_eq!(required_chunk_bytes(24_000, 1_000), 24_000 * BYTES_PER_FRAME);
/// ```
pub fn required_chunk_bytes(source_rate: u32, chunk_ms: u32) -> usize {
    let frames = (u64::from(source_rate) * u64::from(chunk_ms) / 1_000).max(1);
    frames as usize * BYTES_PER_FRAME
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

/// Reinterpret a sample batch as raw native-endian bytes.
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_FRAME);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_ne_bytes());
    }
    bytes
}

/// Read whole frames back out of `bytes`.
///
/// Trailing bytes that do not form a complete frame are ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_FRAME)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
