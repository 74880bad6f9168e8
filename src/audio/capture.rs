//! Microphone input tap via `cpal`.
//!
//! [`InputTap`] wraps the cpal host/device/stream setup for the input side of
//! the graph.  [`InputTap::start`] builds and plays an input stream whose
//! callback wraps every hardware buffer in a [`CaptureBuffer`] and hands it
//! to the tap callback.  The returned [`StreamHandle`] is a RAII guard:
//! dropping it stops the underlying cpal stream.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::device::{CaptureBuffer, DeviceError, TapCallback};
use super::format::StreamFormat;

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// RAII guard that keeps a cpal stream alive.
///
/// Dropping this value drops the `cpal::Stream`, which stops the underlying
/// hardware stream.
pub struct StreamHandle {
    _stream: cpal::Stream,
}

// SAFETY: `cpal::Stream` is `!Send` on some backends because it holds raw
// platform handles.  The graph only keeps the stream alive and drops it; it
// never calls into the stream from another thread.  The audio callback runs
// on cpal's own thread.
unsafe impl Send for StreamHandle {}

impl StreamHandle {
    pub(crate) fn new(stream: cpal::Stream) -> Self {
        Self { _stream: stream }
    }
}

// ---------------------------------------------------------------------------
// InputTap
// ---------------------------------------------------------------------------

/// Input-side stream configuration resolved from the default input device.
pub struct InputTap {
    device: cpal::Device,
    config: cpal::StreamConfig,
    format: StreamFormat,
}

impl InputTap {
    /// Resolve the system default input device and its preferred config.
    ///
    /// `buffer_frames` requests a fixed device buffer size; `None` keeps the
    /// device default.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoDevice`] when no input device is available,
    /// or [`DeviceError::DefaultConfig`] when the device cannot report a
    /// default stream configuration.
    pub fn open(buffer_frames: Option<u32>) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoDevice("input"))?;

        let supported = device.default_input_config()?;
        let format = StreamFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        };

        let mut config: cpal::StreamConfig = supported.into();
        if let Some(frames) = buffer_frames {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        Ok(Self {
            device,
            config,
            format,
        })
    }

    /// Native format of the captured buffers.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Build and start the input stream.
    ///
    /// `on_buffer` runs on cpal's audio thread for every hardware buffer;
    /// `on_error` receives stream errors on the same thread.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::BuildStream`] or [`DeviceError::PlayStream`]
    /// if the platform rejects the stream configuration.
    pub fn start<E>(&self, on_buffer: TapCallback, on_error: E) -> Result<StreamHandle, DeviceError>
    where
        E: FnMut(cpal::StreamError) + Send + 'static,
    {
        let format = self.format;

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                on_buffer(CaptureBuffer {
                    samples: data.to_vec(),
                    format,
                });
            },
            on_error,
            None, // no timeout
        )?;

        stream.play()?;
        log::debug!(
            "capture: input tap running ({} Hz, {} ch)",
            format.sample_rate,
            format.channels
        );
        Ok(StreamHandle::new(stream))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Capture buffers cross from cpal's thread into the engine.
    #[test]
    fn capture_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CaptureBuffer>();
        assert_send::<StreamHandle>();
    }

    #[test]
    fn capture_buffer_fields() {
        let buffer = CaptureBuffer {
            samples: vec![0.0_f32; 512],
            format: StreamFormat {
                sample_rate: 48_000,
                channels: 2,
            },
        };
        assert_eq!(buffer.samples.len(), 512);
        assert_eq!(buffer.format.sample_rate, 48_000);
        assert_eq!(buffer.format.channels, 2);
    }
}
