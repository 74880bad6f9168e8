//! Production [`AudioGraph`] on top of `cpal`.
//!
//! cpal has no graph of its own, so [`CpalGraph`] assembles one:
//!
//! ```text
//! default input device ──▶ InputTap stream ──▶ TapCallback (device thread)
//!
//! PlayerNode queue ──▶ output stream callback ──▶ default output device
//!                             │
//!                             └─▶ CompletionCallback per rendered buffer
//! ```
//!
//! Streams are built in [`start`](AudioGraph::start) against the *current*
//! default devices and dropped in [`stop`](AudioGraph::stop).  When cpal
//! reports `StreamError::DeviceNotAvailable` the graph marks itself as not
//! running and notifies the reconfiguration subscriber, which is expected to
//! call `start` again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::capture::{InputTap, StreamHandle};
use super::converter::ConvertedBuffer;
use super::device::{
    AudioGraph, CompletionCallback, DeviceError, ReconfigurationCallback, TapCallback,
};
use super::format::StreamFormat;
use super::playback::PlayerNode;

type SharedSubscriber = Arc<Mutex<Option<ReconfigurationCallback>>>;

// ---------------------------------------------------------------------------
// CpalGraph
// ---------------------------------------------------------------------------

/// Audio graph backed by the system default input and output devices.
pub struct CpalGraph {
    output_config: cpal::StreamConfig,
    output_format: StreamFormat,
    player: PlayerNode,
    tap: Option<(Option<u32>, TapCallback)>,
    input_stream: Option<StreamHandle>,
    output_stream: Option<StreamHandle>,
    device_lost: Arc<AtomicBool>,
    subscriber: SharedSubscriber,
}

impl CpalGraph {
    /// Resolve the default output device and its preferred configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoDevice`] when no output device exists, or
    /// [`DeviceError::DefaultConfig`] when it cannot report a configuration.
    pub fn new() -> Result<Self, DeviceError> {
        let (_, output_config, output_format) = default_output()?;
        log::info!(
            "graph: output device {} Hz, {} ch",
            output_format.sample_rate,
            output_format.channels
        );

        Ok(Self {
            output_config,
            output_format,
            player: PlayerNode::new(),
            tap: None,
            input_stream: None,
            output_stream: None,
            device_lost: Arc::new(AtomicBool::new(false)),
            subscriber: Arc::new(Mutex::new(None)),
        })
    }

    /// Error callback shared by both streams.
    fn error_handler(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let lost = Arc::clone(&self.device_lost);
        let subscriber = Arc::clone(&self.subscriber);
        move |err: cpal::StreamError| match err {
            cpal::StreamError::DeviceNotAvailable => {
                log::warn!("graph: audio device no longer available");
                lost.store(true, Ordering::SeqCst);
                let callback = subscriber
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
            other => log::error!("graph: cpal stream error: {other}"),
        }
    }

    fn build_output_stream(&self, device: &cpal::Device) -> Result<StreamHandle, DeviceError> {
        let player = self.player.clone();
        let channels = usize::from(self.output_config.channels);

        let stream = device.build_output_stream(
            &self.output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                player.render(data, channels);
            },
            self.error_handler(),
            None,
        )?;
        stream.play()?;
        Ok(StreamHandle::new(stream))
    }
}

fn default_output() -> Result<(cpal::Device, cpal::StreamConfig, StreamFormat), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoDevice("output"))?;
    let supported = device.default_output_config()?;
    let format = StreamFormat {
        sample_rate: supported.sample_rate().0,
        channels: supported.channels(),
    };
    Ok((device, supported.into(), format))
}

impl AudioGraph for CpalGraph {
    fn output_format(&self) -> StreamFormat {
        self.output_format
    }

    fn install_input_tap(
        &mut self,
        buffer_frames: Option<u32>,
        on_buffer: TapCallback,
    ) -> Result<(), DeviceError> {
        // Fail at install time rather than on the first start.
        let tap = InputTap::open(buffer_frames).map_err(|e| DeviceError::Tap(e.to_string()))?;
        log::debug!(
            "graph: input tap installed ({} Hz, {} ch)",
            tap.format().sample_rate,
            tap.format().channels
        );
        self.tap = Some((buffer_frames, on_buffer));
        Ok(())
    }

    fn remove_input_tap(&mut self) {
        self.tap = None;
        self.input_stream = None;
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let (_, config, format) = default_output()?;
        if format != self.output_format {
            log::info!(
                "graph: output format changed to {} Hz, {} ch",
                format.sample_rate,
                format.channels
            );
        }
        self.output_config = config;
        self.output_format = format;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        // Drop stale streams from a lost device before rebuilding.
        self.input_stream = None;
        self.output_stream = None;

        let (device, config, format) = default_output()?;
        self.output_config = config;
        self.output_format = format;

        let output = self.build_output_stream(&device)?;
        let input = match &self.tap {
            Some((buffer_frames, on_buffer)) => {
                let tap = InputTap::open(*buffer_frames)?;
                Some(tap.start(Arc::clone(on_buffer), self.error_handler())?)
            }
            None => None,
        };

        self.output_stream = Some(output);
        self.input_stream = input;
        self.device_lost.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
    }

    fn is_running(&self) -> bool {
        self.output_stream.is_some() && !self.device_lost.load(Ordering::SeqCst)
    }

    fn schedule_buffer(&mut self, buffer: ConvertedBuffer, on_complete: CompletionCallback) {
        if buffer.format.sample_rate != self.output_format.sample_rate {
            log::warn!(
                "graph: buffer at {} Hz scheduled on {} Hz output",
                buffer.format.sample_rate,
                self.output_format.sample_rate
            );
        }
        self.player.schedule(buffer, on_complete);
    }

    fn play(&mut self) {
        self.player.play();
    }

    fn stop_player(&mut self) {
        self.player.stop();
    }

    fn subscribe_reconfiguration(&mut self, callback: ReconfigurationCallback) {
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn unsubscribe_reconfiguration(&mut self) {
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
