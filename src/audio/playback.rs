//! Player node: gapless sequential rendering of scheduled buffers.
//!
//! [`PlayerNode`] holds a FIFO of converted buffers shared with the cpal
//! output callback.  The callback pulls frames buffer after buffer without
//! gaps, fanning each mono frame out to every device channel, and fires a
//! buffer's completion as soon as its last frame has been written to the
//! device.  While the node is paused or the queue is empty it renders
//! silence.
//!
//! Completions run on the device thread *after* the queue lock has been
//! released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::converter::ConvertedBuffer;
use super::device::CompletionCallback;

// ---------------------------------------------------------------------------
// ScheduledBuffer
// ---------------------------------------------------------------------------

struct ScheduledBuffer {
    samples: Vec<f32>,
    position: usize,
    on_complete: Option<CompletionCallback>,
}

#[derive(Default)]
struct PlayerState {
    queue: VecDeque<ScheduledBuffer>,
    playing: bool,
}

// ---------------------------------------------------------------------------
// PlayerNode
// ---------------------------------------------------------------------------

/// Shared handle to the player queue.  Cheap to clone; one clone lives in the
/// output stream callback.
#[derive(Clone, Default)]
pub struct PlayerNode {
    state: Arc<Mutex<PlayerState>>,
}

impl PlayerNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `buffer` to the queue.
    pub fn schedule(&self, buffer: ConvertedBuffer, on_complete: CompletionCallback) {
        self.lock().queue.push_back(ScheduledBuffer {
            samples: buffer.samples,
            position: 0,
            on_complete: Some(on_complete),
        });
    }

    /// Start rendering queued buffers.
    pub fn play(&self) {
        self.lock().playing = true;
    }

    /// Pause rendering and drop every queued buffer without firing its
    /// completion.
    pub fn stop(&self) {
        let dropped = {
            let mut st = self.lock();
            st.playing = false;
            std::mem::take(&mut st.queue)
        };
        if !dropped.is_empty() {
            log::debug!("player: dropped {} scheduled buffers", dropped.len());
        }
    }

    /// Number of buffers not yet fully rendered.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Fill an interleaved device buffer with `channels` channels.
    ///
    /// Called from the output stream callback.
    pub fn render(&self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mut finished = Vec::new();

        {
            let mut st = self.lock();
            for frame in data.chunks_mut(channels) {
                let sample = if st.playing {
                    next_sample(&mut st.queue, &mut finished)
                } else {
                    0.0
                };
                frame.fill(sample);
            }
            // A buffer whose last frame landed exactly at the end of this
            // device buffer is complete now, not on the next callback.
            pop_finished(&mut st.queue, &mut finished);
        }

        for done in finished {
            done();
        }
    }
}

fn pop_finished(queue: &mut VecDeque<ScheduledBuffer>, finished: &mut Vec<CompletionCallback>) {
    while queue
        .front()
        .is_some_and(|b| b.position >= b.samples.len())
    {
        if let Some(mut done) = queue.pop_front() {
            if let Some(cb) = done.on_complete.take() {
                finished.push(cb);
            }
        }
    }
}

fn next_sample(
    queue: &mut VecDeque<ScheduledBuffer>,
    finished: &mut Vec<CompletionCallback>,
) -> f32 {
    pop_finished(queue, finished);
    match queue.front_mut() {
        Some(buffer) => {
            let sample = buffer.samples[buffer.position];
            buffer.position += 1;
            sample
        }
        None => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::StreamFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buffer(samples: Vec<f32>) -> ConvertedBuffer {
        ConvertedBuffer {
            samples,
            format: StreamFormat::mono(48_000),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> CompletionCallback {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn paused_player_renders_silence() {
        let node = PlayerNode::new();
        node.schedule(buffer(vec![1.0; 4]), Box::new(|| {}));
        let mut out = vec![9.0_f32; 4];
        node.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(node.queued(), 1);
    }

    #[test]
    fn buffers_play_back_to_back_without_gap() {
        let node = PlayerNode::new();
        node.schedule(buffer(vec![1.0, 2.0]), Box::new(|| {}));
        node.schedule(buffer(vec![3.0, 4.0, 5.0]), Box::new(|| {}));
        node.play();

        let mut out = vec![0.0_f32; 6];
        node.render(&mut out, 1);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0]);
    }

    #[test]
    fn mono_frames_fan_out_to_every_channel() {
        let node = PlayerNode::new();
        node.schedule(buffer(vec![0.5, -0.5]), Box::new(|| {}));
        node.play();

        let mut out = vec![0.0_f32; 4];
        node.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn completions_fire_in_order_once_fully_rendered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let node = PlayerNode::new();
        node.schedule(buffer(vec![0.1; 3]), recorder(&log, 1));
        node.schedule(buffer(vec![0.2; 3]), recorder(&log, 2));
        node.play();

        let mut out = vec![0.0_f32; 2];
        node.render(&mut out, 1);
        assert!(log.lock().unwrap().is_empty(), "first buffer not done yet");

        node.render(&mut out, 1);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        node.render(&mut out, 1);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(node.queued(), 0);
    }

    #[test]
    fn completion_fires_when_buffer_ends_on_callback_boundary() {
        let count = Arc::new(AtomicUsize::new(0));
        let node = PlayerNode::new();
        let c = Arc::clone(&count);
        node.schedule(
            buffer(vec![0.3; 4]),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        node.play();

        let mut out = vec![0.0_f32; 4];
        node.render(&mut out, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_drops_queue_without_completions() {
        let count = Arc::new(AtomicUsize::new(0));
        let node = PlayerNode::new();
        let c = Arc::clone(&count);
        node.schedule(
            buffer(vec![0.3; 4]),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        node.play();
        node.stop();

        assert_eq!(node.queued(), 0);
        let mut out = vec![1.0_f32; 4];
        node.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
