//! Audio processing module
//!
//! Handles sample conversion, microphone capture, and gapless playback.
//! Hardware access sits behind [`AudioDevices`] so the engine can run
//! against any output graph.

mod capture;
pub mod convert;
mod playback;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use cpal::traits::{DeviceTrait, HostTrait};

pub use capture::{AudioCapture, CapturePipeline};
pub use convert::{SampleConverter, WIRE_SAMPLE_RATE};
pub use playback::{
    Completion, CompletionOutcome, CpalOutput, PlaybackBuffer, PlaybackLedger, PlaybackPipeline,
};

use crate::engine::Mailbox;
use crate::realtime::OutboundQueue;
use crate::{Error, Result};

/// Destination for scheduled playback buffers
pub trait OutputNode {
    /// Queue a buffer behind everything already scheduled
    ///
    /// # Errors
    ///
    /// Hands the buffer back if it cannot be queued
    fn schedule(&mut self, buffer: PlaybackBuffer) -> std::result::Result<(), PlaybackBuffer>;

    /// Stop the node, discard queued audio, and start it again
    ///
    /// # Errors
    ///
    /// Returns error if the device refuses to pause or resume
    fn halt_and_restart(&mut self) -> Result<()>;
}

/// A running capture stream
pub trait InputStream {
    /// Stop delivering capture callbacks
    fn stop(&mut self);
}

/// Everything a capture stream needs to feed the connection
#[derive(Debug, Clone)]
pub struct CaptureSink {
    /// Set while the remote side is speaking
    pub mute: Arc<AtomicBool>,

    /// Connection outbound queue
    pub outbound: OutboundQueue,

    /// Where refused frames are reported
    pub mailbox: Mailbox,

    /// Outbound frame duration
    pub frame_ms: u32,
}

/// Opens the capture and playback sides of a session
pub trait AudioDevices {
    /// Open the playback output, reporting completions to `ledger`
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no usable output device exists
    fn open_output(&self, ledger: Arc<PlaybackLedger>) -> Result<Box<dyn OutputNode>>;

    /// Open the microphone and start streaming into `sink`
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no usable input device exists
    fn open_input(&self, sink: CaptureSink) -> Result<Box<dyn InputStream>>;
}

/// Default host devices via cpal
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn open_output(&self, ledger: Arc<PlaybackLedger>) -> Result<Box<dyn OutputNode>> {
        Ok(Box::new(CpalOutput::open(ledger)?))
    }

    fn open_input(&self, sink: CaptureSink) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(AudioCapture::open(sink)?))
    }
}

/// Describe the default host's audio devices, one line each
///
/// # Errors
///
/// Returns error if the host cannot enumerate devices
pub fn describe_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let default_in = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();
    let default_out = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let devices = host.devices().map_err(|e| Error::Audio(e.to_string()))?;

    let mut lines = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());
        let mut roles = Vec::new();
        if let Ok(config) = device.default_input_config() {
            roles.push(format!(
                "in {} Hz x{}",
                config.sample_rate().0,
                config.channels()
            ));
        }
        if let Ok(config) = device.default_output_config() {
            roles.push(format!(
                "out {} Hz x{}",
                config.sample_rate().0,
                config.channels()
            ));
        }
        let marker = if name == default_in || name == default_out {
            "*"
        } else {
            " "
        };
        lines.push(format!("{marker} {name} [{}]", roles.join(", ")));
    }

    Ok(lines)
}
