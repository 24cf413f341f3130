//! Audio capture from microphone
//!
//! The capture callback downmixes and resamples to the wire profile, cuts
//! fixed-duration frames, and hands them to the connection's outbound queue.
//! While the mute flag is set frames are dropped at the source, along with
//! any partial frame and resampler history from before the mute.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::convert::{SampleConverter, WIRE_SAMPLE_RATE, downmix, pcm16_encode};
use super::{CaptureSink, InputStream};
use crate::engine::{ControlEvent, Mailbox};
use crate::realtime::{ClientEvent, OutboundQueue};
use crate::{Error, Result};

/// Converts native capture callbacks into wire-format frames
pub struct CapturePipeline {
    mute: Arc<AtomicBool>,
    channels: usize,
    converter: SampleConverter,
    frame_len: usize,
    framer: Vec<f32>,
    outbound: OutboundQueue,
    mailbox: Mailbox,
    muted: bool,
    dropped: u64,
}

impl CapturePipeline {
    /// Create a pipeline for a device running at `native_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built
    pub fn new(native_rate: u32, channels: usize, sink: CaptureSink) -> Result<Self> {
        let converter = SampleConverter::new(native_rate, WIRE_SAMPLE_RATE)?;
        let frame_len = (WIRE_SAMPLE_RATE as usize * sink.frame_ms as usize / 1000).max(1);

        Ok(Self {
            mute: sink.mute,
            channels: channels.max(1),
            converter,
            frame_len,
            framer: Vec::with_capacity(frame_len * 2),
            outbound: sink.outbound,
            mailbox: sink.mailbox,
            muted: false,
            dropped: 0,
        })
    }

    /// Handle one callback's worth of interleaved samples
    ///
    /// Returns the number of frames handed to the connection.
    pub fn process(&mut self, interleaved: &[f32]) -> usize {
        if self.mute.load(Ordering::Relaxed) {
            if !self.muted {
                self.muted = true;
                self.framer.clear();
                self.converter.reset();
            }
            return 0;
        }
        self.muted = false;

        let mono = downmix(interleaved, self.channels);
        match self.converter.convert(&mono) {
            Ok(converted) => self.framer.extend_from_slice(&converted),
            Err(e) => {
                tracing::error!(error = %e, "capture resample failed");
                return 0;
            }
        }

        let mut sent = 0;
        while self.framer.len() >= self.frame_len {
            let frame: Vec<f32> = self.framer.drain(..self.frame_len).collect();
            match self
                .outbound
                .send(ClientEvent::audio_append(&pcm16_encode(&frame)))
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.dropped += 1;
                    if self.dropped.is_power_of_two() {
                        tracing::warn!(error = %e, dropped = self.dropped, "capture frame dropped");
                        self.mailbox.post(ControlEvent::SendFailed {
                            reason: format!("{e} ({} frames dropped)", self.dropped),
                        });
                    }
                }
            }
        }
        sent
    }

    /// Samples per outbound frame
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Frames the connection refused so far
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Captures audio from the default input device
pub struct AudioCapture {
    #[allow(dead_code)]
    device: Device,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device and start streaming into `sink`
    ///
    /// The device runs at its native configuration; conversion happens in
    /// the callback.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(sink: CaptureSink) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        let pipeline =
            CapturePipeline::new(config.sample_rate.0, usize::from(config.channels), sink)?;

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, pipeline),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, pipeline),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, pipeline),
            other => Err(Error::Audio(format!(
                "unsupported input sample format {other:?}"
            ))),
        }?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            stream: Some(stream),
        })
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl InputStream for AudioCapture {
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "capture pause failed");
            }
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut pipeline: CapturePipeline,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
                pipeline.process(&scratch);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}
