//! Shared test utilities
//!
//! A scripted remote and in-memory audio devices, so engine behavior can be
//! driven event by event without a network or sound card.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};

use realtime_voice::audio::{
    AudioDevices, CaptureSink, CompletionOutcome, InputStream, OutputNode, PlaybackBuffer,
    PlaybackLedger,
};
use realtime_voice::config::file::VoiceConfigFile;
use realtime_voice::engine::{ControlEvent, EngineEvent, Mailbox, VoiceEngine};
use realtime_voice::realtime::{
    ClientEvent, Connection, Connector, OUTBOUND_CAPACITY, OutboundQueue, ResponseInfo,
    ServerEvent,
};
use realtime_voice::{Config, Error, Result};

/// Everything the doubles record
#[derive(Default)]
pub struct Shared {
    mailboxes: Vec<Mailbox>,
    outbound: Option<mpsc::Receiver<ClientEvent>>,
    shutdown: Option<oneshot::Receiver<()>>,
    sent: Vec<ClientEvent>,
    timeline: Vec<String>,
    queued: VecDeque<PlaybackBuffer>,
    captures: Vec<CaptureSink>,
    input_stops: usize,
    refuse_connect: bool,
    fail_output: bool,
    fail_input: bool,
    output_capacity: Option<usize>,
}

impl Shared {
    /// Move whatever the engine queued for the writer into the log, then
    /// note whether the connection was closed
    fn collect(&mut self) {
        if let Some(rx) = self.outbound.as_mut() {
            while let Ok(event) = rx.try_recv() {
                self.timeline.push(format!("send:{}", event.kind()));
                self.sent.push(event);
            }
        }
        if let Some(shutdown) = self.shutdown.as_mut() {
            if !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                self.timeline.push("close".to_string());
                self.shutdown = None;
            }
        }
    }
}

/// Test rig owning the scripted remote and devices
#[derive(Clone, Default)]
pub struct Rig {
    shared: Arc<Mutex<Shared>>,
}

pub type TestEngine = VoiceEngine<MockConnector, MockDevices>;

impl Rig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// Build an engine wired to this rig
    pub fn engine(&self, config: Config) -> (TestEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        VoiceEngine::new(
            config,
            MockConnector(Arc::clone(&self.shared)),
            MockDevices(Arc::clone(&self.shared)),
        )
    }

    /// Deliver a server event on the most recent session
    pub fn push(&self, event: ServerEvent) {
        self.post(ControlEvent::Server(event));
    }

    /// Post a raw control event on the most recent session
    pub fn post(&self, event: ControlEvent) {
        let mailbox = self.lock().mailboxes.last().cloned().unwrap();
        assert!(mailbox.post(event));
    }

    /// Mailbox handed to the `index`th connection
    pub fn mailbox(&self, index: usize) -> Mailbox {
        self.lock().mailboxes[index].clone()
    }

    pub fn connections(&self) -> usize {
        self.lock().mailboxes.len()
    }

    /// Client events the engine has sent so far
    pub fn sent_events(&self) -> Vec<ClientEvent> {
        let mut shared = self.lock();
        shared.collect();
        shared.sent.clone()
    }

    /// Sends, closes and output halts in the order they happened
    pub fn timeline(&self) -> Vec<String> {
        let mut shared = self.lock();
        shared.collect();
        shared.timeline.clone()
    }

    /// Buffers sitting in the output node
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    /// Play the oldest queued buffer to the end
    pub fn complete_next(&self) -> Option<CompletionOutcome> {
        let buffer = self.lock().queued.pop_front()?;
        Some(buffer.complete())
    }

    /// Take queued buffers out of the output as if the device had them in
    /// flight
    pub fn take_queued(&self) -> Vec<PlaybackBuffer> {
        self.lock().queued.drain(..).collect()
    }

    /// Sink handed to the most recent capture stream
    pub fn capture_sink(&self) -> CaptureSink {
        self.lock().captures.last().cloned().unwrap()
    }

    pub fn input_stops(&self) -> usize {
        self.lock().input_stops
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub fn fail_output(&self, fail: bool) {
        self.lock().fail_output = fail;
    }

    pub fn fail_input(&self, fail: bool) {
        self.lock().fail_input = fail;
    }

    /// Let the output node hold at most `capacity` buffers
    pub fn limit_output(&self, capacity: usize) {
        self.lock().output_capacity = Some(capacity);
    }

    /// Drop the writer end of the current connection, so every later send
    /// is refused
    pub fn sever_writer(&self) {
        let mut shared = self.lock();
        shared.collect();
        shared.outbound = None;
    }
}

/// Connector that hands out in-memory connections
pub struct MockConnector(Arc<Mutex<Shared>>);

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _config: &Config, mailbox: Mailbox) -> Result<Connection> {
        let mut shared = self.0.lock().unwrap();
        if shared.refuse_connect {
            return Err(Error::Transport("connection refused".to_string()));
        }

        // Keep the previous session's traffic before swapping receivers
        shared.collect();
        let (queue, rx) = OutboundQueue::channel(OUTBOUND_CAPACITY);
        let (shutdown, shutdown_rx) = oneshot::channel();
        shared.outbound = Some(rx);
        shared.shutdown = Some(shutdown_rx);
        shared.mailboxes.push(mailbox);
        Ok(Connection::from_parts(queue, None, shutdown))
    }
}

/// Devices backed by the rig
pub struct MockDevices(Arc<Mutex<Shared>>);

impl AudioDevices for MockDevices {
    fn open_output(&self, ledger: Arc<PlaybackLedger>) -> Result<Box<dyn OutputNode>> {
        let mut shared = self.0.lock().unwrap();
        if shared.fail_output {
            return Err(Error::Audio("no output device available".to_string()));
        }
        shared.queued.clear();
        Ok(Box::new(MockOutput {
            shared: Arc::clone(&self.0),
            ledger,
        }))
    }

    fn open_input(&self, sink: CaptureSink) -> Result<Box<dyn InputStream>> {
        let mut shared = self.0.lock().unwrap();
        if shared.fail_input {
            return Err(Error::Audio("no input device available".to_string()));
        }
        shared.captures.push(sink);
        Ok(Box::new(MockInput(Arc::clone(&self.0))))
    }
}

struct MockOutput {
    shared: Arc<Mutex<Shared>>,
    ledger: Arc<PlaybackLedger>,
}

impl OutputNode for MockOutput {
    fn schedule(&mut self, buffer: PlaybackBuffer) -> std::result::Result<(), PlaybackBuffer> {
        let mut shared = self.shared.lock().unwrap();
        if shared
            .output_capacity
            .is_some_and(|capacity| shared.queued.len() >= capacity)
        {
            return Err(buffer);
        }
        shared.queued.push_back(buffer);
        Ok(())
    }

    fn halt_and_restart(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.collect();
        shared.queued.clear();
        let generation = self.ledger.generation();
        shared.timeline.push(format!("halt:{generation}"));
        Ok(())
    }
}

struct MockInput(Arc<Mutex<Shared>>);

impl InputStream for MockInput {
    fn stop(&mut self) {
        self.0.lock().unwrap().input_stops += 1;
    }
}

/// Valid configuration with a dummy key
pub fn test_config() -> Config {
    Config::from_sources(VoiceConfigFile::default(), |key| {
        (key == "OPENAI_API_KEY").then(|| "sk-test".to_string())
    })
}

/// `response.audio.delta` carrying `samples` samples of silence
pub fn audio_delta(response_id: &str, samples: usize) -> ServerEvent {
    ServerEvent::AudioDelta {
        response_id: Some(response_id.to_string()),
        delta: base64::engine::general_purpose::STANDARD.encode(vec![0_u8; samples * 2]),
    }
}

pub fn transcript_delta(response_id: &str, text: &str) -> ServerEvent {
    ServerEvent::TranscriptDelta {
        response_id: Some(response_id.to_string()),
        delta: text.to_string(),
    }
}

pub fn response_done(response_id: &str) -> ServerEvent {
    ServerEvent::ResponseDone {
        response: Some(ResponseInfo {
            id: Some(response_id.to_string()),
            status: Some("completed".to_string()),
        }),
    }
}

/// Everything emitted so far
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Only the error events
pub fn errors(events: &[EngineEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Error { message, fatal } => Some((message.clone(), *fatal)),
            _ => None,
        })
        .collect()
}
