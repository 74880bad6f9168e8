//! Stream scheduler — the ingestion task of one speaking session.
//!
//! [`Ingestion::spawn`] starts a tokio task that consumes the session's
//! sample stream:
//!
//! ```text
//! for each batch:
//!     append raw bytes to PendingBuffer
//!     while a full chunk is available: convert_and_queue(chunk)
//! producer exhausted:
//!     convert_and_queue(flush_remaining)     (short tail, may be empty)
//!     flush_converter()                      (end-of-stream drain)
//!     emit StreamFinished
//! ```
//!
//! Converted buffers are not scheduled here.  They are sent to the engine's
//! execution context as [`EngineEvent::Converted`] together with the session
//! id, and the context does the bookkeeping.  Aborting the task's
//! `JoinHandle` cancels ingestion silently; any other failure is reported as
//! [`EngineEvent::StreamFailed`].

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{samples_to_bytes, ConvertedBuffer, FormatConverter, SharedPendingBuffer};

use super::runner::{EngineError, EngineEvent};
use super::state::SessionId;

/// Lazy, asynchronous, finite sequence of mono `f32` sample batches.
pub type SampleStream = BoxStream<'static, anyhow::Result<Vec<f32>>>;

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Everything one ingestion task owns.
pub(crate) struct Ingestion {
    pub session: SessionId,
    pub pending: SharedPendingBuffer,
    pub converter: FormatConverter,
    /// Size of one conversion window; a whole number of frames.
    pub chunk_bytes: usize,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

impl Ingestion {
    /// Spawn the ingestion task on the current tokio runtime.
    pub fn spawn(self, stream: SampleStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let session = self.session;
            let events = self.events.clone();
            if let Err(error) = self.run(stream).await {
                log::warn!("scheduler: session {session} failed: {error}");
                let _ = events.send(EngineEvent::StreamFailed { session, error });
            }
        })
    }

    /// Consume `stream` to the end.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] when the producer yields an error and
    /// [`EngineError::Convert`] when conversion fails.
    pub async fn run(mut self, mut stream: SampleStream) -> Result<(), EngineError> {
        log::debug!(
            "scheduler: session {} ingesting ({} byte chunks)",
            self.session,
            self.chunk_bytes
        );

        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(EngineError::Source)?;
            if !batch.is_empty() {
                self.pending.append(&samples_to_bytes(&batch));
            }

            while let Some(chunk) = self.pending.extract_chunk(self.chunk_bytes) {
                self.convert_and_queue(chunk)?;
                // Keep the task abortable even when the producer never pends.
                tokio::task::yield_now().await;
            }
        }

        let leftover = self.pending.flush_remaining();
        if !leftover.is_empty() {
            self.convert_and_queue(leftover)?;
        }
        self.flush_converter()?;

        log::debug!("scheduler: session {} stream finished", self.session);
        let _ = self.events.send(EngineEvent::StreamFinished {
            session: self.session,
        });
        Ok(())
    }

    /// Convert one chunk, enqueueing every non-empty result until the chunk's
    /// bytes are used up.
    fn convert_and_queue(&mut self, mut chunk: Vec<u8>) -> Result<(), EngineError> {
        while !chunk.is_empty() {
            let before = chunk.len();
            let converted = self.converter.convert_once(&mut chunk, false)?;
            let progressed = chunk.len() < before || converted.is_some();
            if let Some(buffer) = converted {
                self.enqueue(buffer);
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Drain whatever the converter still buffers internally.
    fn flush_converter(&mut self) -> Result<(), EngineError> {
        let mut empty = Vec::new();
        while let Some(buffer) = self.converter.convert_once(&mut empty, true)? {
            self.enqueue(buffer);
        }
        Ok(())
    }

    fn enqueue(&self, buffer: ConvertedBuffer) {
        let _ = self.events.send(EngineEvent::Converted {
            session: self.session,
            buffer,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{required_chunk_bytes, PendingBuffer, StreamFormat};

    const RATE: u32 = 1_000;

    fn ingestion(
        events: mpsc::UnboundedSender<EngineEvent>,
        destination_rate: u32,
    ) -> Ingestion {
        Ingestion {
            session: SessionId::default(),
            pending: PendingBuffer::shared(),
            converter: FormatConverter::for_formats(
                StreamFormat::mono(RATE),
                StreamFormat::mono(destination_rate),
                256,
                64,
            )
            .unwrap(),
            chunk_bytes: required_chunk_bytes(RATE, 1_000),
            events,
        }
    }

    fn batches(sizes: &[usize]) -> SampleStream {
        let items: Vec<anyhow::Result<Vec<f32>>> =
            sizes.iter().map(|&n| Ok(vec![0.1_f32; n])).collect();
        futures::stream::iter(items).boxed()
    }

    /// Frame counts of converted buffers, and whether the stream finished.
    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> (Vec<usize>, bool) {
        let mut frames = Vec::new();
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::Converted { buffer, .. } => frames.push(buffer.frames()),
                EngineEvent::StreamFinished { .. } => finished = true,
                _ => {}
            }
        }
        (frames, finished)
    }

    #[tokio::test]
    async fn two_exact_chunks_give_two_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingestion(tx, RATE)
            .run(batches(&[700, 700, 600]))
            .await
            .unwrap();

        let (frames, finished) = drain(&mut rx);
        assert_eq!(frames, vec![1_000, 1_000]);
        assert!(finished);
    }

    #[tokio::test]
    async fn half_chunk_remainder_gives_short_third_buffer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingestion(tx, RATE).run(batches(&[2_500])).await.unwrap();

        let (frames, finished) = drain(&mut rx);
        assert_eq!(frames, vec![1_000, 1_000, 500]);
        assert!(finished);
    }

    #[tokio::test]
    async fn empty_stream_finishes_without_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingestion(tx, RATE).run(batches(&[])).await.unwrap();

        let (frames, finished) = drain(&mut rx);
        assert!(frames.is_empty());
        assert!(finished);
    }

    #[tokio::test]
    async fn empty_batches_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingestion(tx, RATE)
            .run(batches(&[0, 1_000, 0]))
            .await
            .unwrap();

        let (frames, _) = drain(&mut rx);
        assert_eq!(frames, vec![1_000]);
    }

    #[tokio::test]
    async fn resampled_stream_preserves_total_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ingestion(tx, 2_000).run(batches(&[1_500])).await.unwrap();

        let (frames, finished) = drain(&mut rx);
        assert_eq!(frames.iter().sum::<usize>(), 3_000);
        assert!(finished);
    }

    #[tokio::test]
    async fn producer_error_fails_without_finishing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let items: Vec<anyhow::Result<Vec<f32>>> = vec![
            Ok(vec![0.2; 1_000]),
            Err(anyhow::anyhow!("model crashed")),
            Ok(vec![0.2; 1_000]),
        ];
        let err = ingestion(tx, RATE)
            .run(futures::stream::iter(items).boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));

        let (frames, finished) = drain(&mut rx);
        assert_eq!(frames, vec![1_000], "output before the error is kept");
        assert!(!finished);
    }

    #[tokio::test]
    async fn spawned_failure_is_reported_as_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let items: Vec<anyhow::Result<Vec<f32>>> = vec![Err(anyhow::anyhow!("boom"))];
        ingestion(tx, RATE)
            .spawn(futures::stream::iter(items).boxed())
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::StreamFailed { .. }));
    }

    #[tokio::test]
    async fn aborted_task_reports_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ingestion(tx, RATE).spawn(futures::stream::pending().boxed());
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(rx.try_recv().is_err());
    }
}
