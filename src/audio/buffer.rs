//! Pending byte buffer between the sample producer and the converter.
//!
//! Producers deliver batches of arbitrary size.  [`PendingBuffer`] absorbs
//! them as raw bytes and hands back fixed-size windows once enough data has
//! accumulated; whatever is left when the producer finishes is flushed as one
//! final short window.
//!
//! The ingestion task and the engine's execution context (during a session
//! reset) both touch the buffer, so it is shared as [`SharedPendingBuffer`]
//! and every operation runs under its own lock.
//!
//! # Example
//!
//! ```rust
//! use voice_stream::audio::PendingBuffer;
//!
//! let buf = PendingBuffer::new();
//! buf.append(&[1, 2, 3]);
//! buf.append(&[4, 5]);
//! assert_eq!(buf.extract_chunk(4), Some(vec![1, 2, 3, 4]));
//! assert_eq!(buf.extract_chunk(4), None);
//! assert_eq!(buf.flush_remaining(), vec![5]);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// PendingBuffer
// ---------------------------------------------------------------------------

/// FIFO byte queue with atomic append / extract / flush.
///
/// Grows only through [`append`](Self::append) and shrinks only through
/// [`extract_chunk`](Self::extract_chunk), [`flush_remaining`](Self::flush_remaining)
/// or [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct PendingBuffer {
    data: Mutex<Vec<u8>>,
}

/// Handle to a [`PendingBuffer`] shared between the ingestion task and the
/// engine.  Cheap to clone.
pub type SharedPendingBuffer = Arc<PendingBuffer>;

impl PendingBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer behind an [`Arc`].
    pub fn shared() -> SharedPendingBuffer {
        Arc::new(Self::new())
    }

    // A poisoned lock only means another thread panicked mid-operation; the
    // byte vector itself is still structurally valid.
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `bytes` to the tail of the queue.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.lock().extend_from_slice(bytes);
    }

    /// Remove and return exactly `size` bytes from the head of the queue.
    ///
    /// Returns `None` (leaving the buffer untouched) while fewer than `size`
    /// bytes are available.
    pub fn extract_chunk(&self, size: usize) -> Option<Vec<u8>> {
        let mut data = self.lock();
        if size == 0 || data.len() < size {
            return None;
        }
        Some(data.drain(..size).collect())
    }

    /// Remove and return every buffered byte.  Returns an empty vector when
    /// the buffer is already empty.
    pub fn flush_remaining(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    /// Discard all buffered bytes, keeping the allocation for reuse.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
