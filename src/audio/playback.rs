//! Gapless playback of streamed speech
//!
//! Inbound PCM chunks become [`PlaybackBuffer`]s queued on an [`OutputNode`].
//! The [`PlaybackLedger`] counts buffers that are scheduled but not yet
//! heard, stamped with a generation so that completions from audio that was
//! flushed by an interruption are ignored.
//!
//! Speech usually arrives faster than real time. Whatever the output node
//! cannot hold waits in a control-side backlog, and the output side asks for
//! a refill through the mailbox once it has made room.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, SupportedStreamConfigRange};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::OutputNode;
use super::convert::{WIRE_SAMPLE_RATE, pcm16_decode};
use crate::engine::{ControlEvent, Mailbox};
use crate::{Error, Result};

/// Buffers the output node can hold ahead of the device
const QUEUE_CAPACITY: usize = 512;

const PENDING_MASK: u64 = 0xffff_ffff;

fn pack(generation: u32, pending: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(pending)
}

#[allow(clippy::cast_possible_truncation)]
const fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, (state & PENDING_MASK) as u32)
}

/// Result of completing a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Counted; this many buffers remain
    Pending(u32),

    /// Counted and nothing remains; the engine was notified
    Drained,

    /// The buffer belonged to a flushed generation and was not counted
    Stale,
}

/// Generation-stamped count of scheduled, unfinished buffers
///
/// Generation and pending count share one atomic word, so a completion can
/// never decrement the count of a generation it does not belong to.
#[derive(Debug)]
pub struct PlaybackLedger {
    state: AtomicU64,
    room_wanted: AtomicBool,
    mailbox: Mailbox,
}

impl PlaybackLedger {
    /// Create a ledger at generation zero with nothing pending
    #[must_use]
    pub const fn new(mailbox: Mailbox) -> Self {
        Self {
            state: AtomicU64::new(0),
            room_wanted: AtomicBool::new(false),
            mailbox,
        }
    }

    /// Count one more buffer under the current generation
    #[must_use]
    pub fn track(self: &Arc<Self>) -> Completion {
        let (generation, _) = unpack(self.state.fetch_add(1, Ordering::AcqRel));
        Completion {
            ledger: Arc::clone(self),
            generation,
        }
    }

    /// Record that a buffer of `generation` finished playing
    ///
    /// When the count reaches zero a [`ControlEvent::PlaybackDrained`] is
    /// posted to the engine. A pending room request is answered with
    /// [`ControlEvent::PlaybackRoom`]. Completions for an old generation do
    /// nothing.
    pub fn complete(&self, generation: u32) -> CompletionOutcome {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (live, pending) = unpack(current);
            if live != generation || pending == 0 {
                return CompletionOutcome::Stale;
            }

            let remaining = pending - 1;
            match self.state.compare_exchange_weak(
                current,
                pack(live, remaining),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if self.room_wanted.swap(false, Ordering::AcqRel) {
                        self.mailbox.post(ControlEvent::PlaybackRoom);
                    }
                    if remaining > 0 {
                        return CompletionOutcome::Pending(remaining);
                    }
                    self.mailbox
                        .post(ControlEvent::PlaybackDrained { generation });
                    return CompletionOutcome::Drained;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Ask for a [`ControlEvent::PlaybackRoom`] after the next completion
    pub fn request_room(&self) {
        self.room_wanted.store(true, Ordering::Release);
    }

    /// Start a new generation with nothing pending
    ///
    /// Returns the new generation. Any outstanding room request is dropped.
    pub fn invalidate(&self) -> u32 {
        self.room_wanted.store(false, Ordering::Release);
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(pack(unpack(state).0.wrapping_add(1), 0))
            })
            .unwrap_or_else(|state| state);
        unpack(previous).0.wrapping_add(1)
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Buffers scheduled under the current generation and not yet finished
    #[must_use]
    pub fn pending(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).1
    }
}

/// Completion handle for one tracked buffer
#[derive(Debug)]
pub struct Completion {
    ledger: Arc<PlaybackLedger>,
    generation: u32,
}

impl Completion {
    /// Generation the buffer was scheduled under
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the ledger has moved past this buffer's generation
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.ledger.generation() != self.generation
    }

    /// Report the buffer as finished
    pub fn complete(self) -> CompletionOutcome {
        self.ledger.complete(self.generation)
    }
}

/// Mono samples at the wire rate plus their completion handle
#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    completion: Completion,
}

impl PlaybackBuffer {
    #[must_use]
    pub const fn new(samples: Vec<f32>, completion: Completion) -> Self {
        Self {
            samples,
            completion,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.completion.generation
    }

    /// Whether an interruption has flushed this buffer's generation
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.completion.is_stale()
    }

    /// Report this buffer as fully played
    pub fn complete(self) -> CompletionOutcome {
        self.completion.complete()
    }
}

/// Turns inbound PCM16 chunks into scheduled, gain-adjusted buffers
pub struct PlaybackPipeline {
    output: Box<dyn OutputNode>,
    ledger: Arc<PlaybackLedger>,
    backlog: VecDeque<PlaybackBuffer>,
    gain: f32,
}

impl PlaybackPipeline {
    #[must_use]
    pub fn new(output: Box<dyn OutputNode>, ledger: Arc<PlaybackLedger>, gain: f32) -> Self {
        Self {
            output,
            ledger,
            backlog: VecDeque::new(),
            gain,
        }
    }

    /// Decode, amplify, and schedule one chunk of inbound speech
    ///
    /// Empty chunks are ignored. The buffer is counted as pending at once,
    /// even if it has to wait in the backlog.
    pub fn play_chunk(&mut self, pcm: &[u8]) {
        let mut samples = pcm16_decode(pcm);
        if samples.is_empty() {
            return;
        }
        apply_gain(&mut samples, self.gain);

        self.backlog
            .push_back(PlaybackBuffer::new(samples, self.ledger.track()));
        self.refill();
    }

    /// Move backlogged buffers into the output until it is full
    ///
    /// Returns how many buffers are still waiting. If any are, the ledger
    /// posts [`ControlEvent::PlaybackRoom`] after the next completion.
    pub fn refill(&mut self) -> usize {
        while let Some(buffer) = self.backlog.pop_front() {
            if let Err(rejected) = self.output.schedule(buffer) {
                self.backlog.push_front(rejected);
                self.ledger.request_room();
                tracing::trace!(backlog = self.backlog.len(), "output full");
                break;
            }
        }
        self.backlog.len()
    }

    /// Buffers waiting for room in the output
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Discard everything scheduled and restart the output
    ///
    /// The generation advances before the output is touched, so any
    /// completion racing this call is already stale. Returns the new
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot be restarted
    pub fn stop(&mut self) -> Result<u32> {
        let generation = self.ledger.invalidate();
        self.backlog.clear();
        self.output.halt_and_restart()?;
        tracing::debug!(generation, "playback flushed");
        Ok(generation)
    }

    #[must_use]
    pub const fn ledger(&self) -> &Arc<PlaybackLedger> {
        &self.ledger
    }

    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }
}

/// Multiply by `gain` and clamp to the valid sample range
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    for sample in samples {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

/// Callback-side reader of the buffer queue
struct Renderer {
    queue: HeapCons<PlaybackBuffer>,
    ledger: Arc<PlaybackLedger>,
    current: Option<PlaybackBuffer>,
    position: usize,
}

impl Renderer {
    fn render(&mut self, data: &mut [f32], channels: usize) {
        let live = self.ledger.generation();
        for frame in data.chunks_mut(channels) {
            frame.fill(self.next_sample(live));
        }
    }

    fn next_sample(&mut self, live: u32) -> f32 {
        loop {
            if let Some(buffer) = self.current.as_ref() {
                if buffer.generation() != live {
                    // flushed by an interruption; never counted as heard
                    self.current = None;
                    continue;
                }
                if let Some(&sample) = buffer.samples().get(self.position) {
                    self.position += 1;
                    return sample;
                }
                if let Some(done) = self.current.take() {
                    done.complete();
                }
                continue;
            }

            match self.queue.try_pop() {
                Some(next) => {
                    self.current = Some(next);
                    self.position = 0;
                }
                None => return 0.0,
            }
        }
    }
}

/// Default output device running at the wire rate
pub struct CpalOutput {
    stream: Stream,
    queue: HeapProd<PlaybackBuffer>,
}

impl CpalOutput {
    /// Open the default output device and start it
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the wire rate
    pub fn open(ledger: Arc<PlaybackLedger>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports_wire = |c: &SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(WIRE_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(WIRE_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports_wire(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports_wire(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(WIRE_SAMPLE_RATE))
            .config();
        let channels = usize::from(config.channels);

        let (queue, consumer) = HeapRb::<PlaybackBuffer>::new(QUEUE_CAPACITY).split();
        let mut renderer = Renderer {
            queue: consumer,
            ledger,
            current: None,
            position: 0,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render(data, channels);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = WIRE_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { stream, queue })
    }
}

impl OutputNode for CpalOutput {
    fn schedule(&mut self, buffer: PlaybackBuffer) -> std::result::Result<(), PlaybackBuffer> {
        self.queue.try_push(buffer)
    }

    fn halt_and_restart(&mut self) -> Result<()> {
        // Queued buffers of the old generation are dropped by the renderer
        self.stream
            .pause()
            .map_err(|e| Error::Audio(format!("failed to pause output: {e}")))?;
        self.stream
            .play()
            .map_err(|e| Error::Audio(format!("failed to restart output: {e}")))?;
        Ok(())
    }
}
