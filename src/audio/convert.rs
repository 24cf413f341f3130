//! Sample conversion between hardware audio and the wire profile
//!
//! The wire profile is fixed: mono, 16-bit signed little-endian PCM at
//! [`WIRE_SAMPLE_RATE`]. Everything here is synchronous and owns no shared
//! state, so it is safe to call from a real-time audio callback.

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Sample rate of audio on the wire, both directions
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Input frames per resampler chunk
const CHUNK_FRAMES: usize = 1024;

/// FFT sub-chunks per chunk (trades latency for quality)
const SUB_CHUNKS: usize = 2;

/// Streaming mono resampler
///
/// Every sample passed to [`convert`](Self::convert) is consumed exactly once:
/// whole resampler chunks are processed immediately and any undersized tail
/// is carried to the next call. [`flush`](Self::flush) drains the carry.
pub struct SampleConverter {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl SampleConverter {
    /// Create a converter from `from_rate` to `to_rate`
    ///
    /// Equal rates produce a passthrough converter.
    ///
    /// # Errors
    ///
    /// Returns error if either rate is zero or the resampler cannot be built
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(Error::Resample(format!(
                "invalid sample rates {from_rate} -> {to_rate}"
            )));
        }

        let resampler = if from_rate == to_rate {
            None
        } else {
            let r = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                CHUNK_FRAMES,
                SUB_CHUNKS,
                1,
            )
            .map_err(|e| Error::Resample(format!("resampler init failed: {e}")))?;
            Some(r)
        };

        tracing::debug!(from_rate, to_rate, "sample converter created");

        Ok(Self {
            resampler,
            pending: Vec::new(),
            from_rate,
            to_rate,
        })
    }

    /// Feed samples and return whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects a chunk
    pub fn convert(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let out = resampler
                .process(&[chunk], None)
                .map_err(|e| Error::Resample(e.to_string()))?;
            output.extend_from_slice(&out[0]);
        }

        Ok(output)
    }

    /// Resample the carried tail, zero-padding it to a full chunk
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects the partial chunk
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let wave = [std::mem::take(&mut self.pending)];
        let out = resampler
            .process_partial(Some(&wave[..]), None)
            .map_err(|e| Error::Resample(e.to_string()))?;
        Ok(out.into_iter().next().unwrap_or_default())
    }

    /// Forget the carried tail and the resampler's filter history
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Resampler latency in output frames
    #[must_use]
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map_or(0, |r| r.output_delay())
    }

    /// Input samples carried over, not yet resampled
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Source sample rate
    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Target sample rate
    #[must_use]
    pub const fn to_rate(&self) -> u32 {
        self.to_rate
    }
}

/// Resample a complete buffer in one call
///
/// The result is delay-compensated and has `round(len * to / from)` samples
/// (at least one for non-empty input).
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut converter = SampleConverter::new(from_rate, to_rate)?;
    let delay = converter.output_delay();
    let expected = expected_len(samples.len(), from_rate, to_rate);

    // Push enough silence through to flush the filter delay
    let delay_in = usize::try_from(
        (delay as u64 * u64::from(from_rate)).div_ceil(u64::from(to_rate)),
    )
    .unwrap_or(usize::MAX);
    let padding = vec![0.0; delay_in + CHUNK_FRAMES];

    let mut out = converter.convert(samples)?;
    out.extend(converter.convert(&padding)?);
    out.extend(converter.flush()?);

    let mut out = out.split_off(delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

/// Output length for `len` samples converted between rates, rounded
#[must_use]
pub fn expected_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let scaled = (len as u64 * u64::from(to_rate) + u64::from(from_rate) / 2) / u64::from(from_rate);
    usize::try_from(scaled).unwrap_or(usize::MAX).max(1)
}

/// Average interleaved frames down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Encode f32 samples as 16-bit little-endian PCM
#[must_use]
pub fn pcm16_encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Convert f32 [-1.0, 1.0] to i16
        #[allow(clippy::cast_possible_truncation)]
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Decode 16-bit little-endian PCM to f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}
