//! Duplex voice engine
//!
//! [`VoiceEngine`] is the control context. It owns the session, the
//! conversation state and the mute flag, and is the only place any of them
//! change. Network tasks and audio callbacks reach it through the
//! [`Mailbox`]; callers drive it with [`EngineCommand`]s and observe it
//! through [`EngineEvent`]s.

mod conversation;
mod dispatch;
mod interrupt;
mod mailbox;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

pub use conversation::{Conversation, ConversationState};
pub use interrupt::InterruptTrigger;
pub use mailbox::{ControlEvent, Envelope, Mailbox, SessionId};

use crate::Result;
use crate::audio::{AudioDevices, CaptureSink, InputStream, PlaybackLedger, PlaybackPipeline};
use crate::config::Config;
use crate::realtime::{ClientEvent, Connection, Connector, SessionUpdate};

/// Notification for whoever is driving the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Conversation state changed
    StateChanged(ConversationState),

    /// Assistant transcript so far for the current utterance
    TranscriptUpdated { text: String },

    /// Assistant utterance finished with this transcript
    AssistantUtterance { text: String },

    /// The service transcribed what the user said
    UserUtterance { text: String },

    /// Something went wrong; `fatal` errors ended the session
    Error { message: String, fatal: bool },
}

/// Request to the engine run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Connect,
    Disconnect,
    Interrupt,
    Shutdown,
}

/// Resources of one connect/disconnect cycle
struct ActiveSession {
    id: SessionId,
    connection: Connection,
    playback: PlaybackPipeline,
    capture: Box<dyn InputStream>,
}

/// Realtime duplex voice engine
pub struct VoiceEngine<C, D> {
    config: Config,
    connector: C,
    devices: D,
    conversation: Conversation,
    mute: Arc<AtomicBool>,
    session: Option<ActiveSession>,
    next_session: SessionId,
    mailbox_tx: mpsc::UnboundedSender<Envelope>,
    mailbox_rx: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl<C, D> VoiceEngine<C, D>
where
    C: Connector,
    D: AudioDevices,
{
    /// Create a disconnected engine and the receiver for its events
    #[must_use]
    pub fn new(
        config: Config,
        connector: C,
        devices: D,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let engine = Self {
            config,
            connector,
            devices,
            conversation: Conversation::default(),
            mute: Arc::new(AtomicBool::new(false)),
            session: None,
            next_session: 1,
            mailbox_tx,
            mailbox_rx,
            events,
        };
        (engine, events_rx)
    }

    /// Open a session
    ///
    /// Connects the transport, sends `session.update`, then opens playback
    /// and capture. Calling this while connected does nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid configuration, or the transport or
    /// device error that stopped the session from opening. Anything opened
    /// before the failure is torn down and the engine stays disconnected.
    pub async fn connect(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            tracing::warn!(session = session.id, "already connected, ignoring connect");
            return Ok(());
        }

        self.config.validate()?;

        let id = self.next_session;
        self.next_session += 1;
        let mailbox = Mailbox::new(id, self.mailbox_tx.clone());

        let connection = self.connector.open(&self.config, mailbox.clone()).await?;

        // Dropping `connection` on any error below closes it
        connection.send(ClientEvent::SessionUpdate {
            session: SessionUpdate::from(&self.config.session),
        })?;

        let ledger = Arc::new(PlaybackLedger::new(mailbox.clone()));
        let output = self.devices.open_output(Arc::clone(&ledger))?;
        let playback = PlaybackPipeline::new(output, ledger, self.config.audio.output_gain);

        self.mute.store(false, Ordering::Relaxed);
        let capture = self.devices.open_input(CaptureSink {
            mute: Arc::clone(&self.mute),
            outbound: connection.outbound().clone(),
            mailbox,
            frame_ms: self.config.audio.frame_ms,
        })?;

        self.session = Some(ActiveSession {
            id,
            connection,
            playback,
            capture,
        });
        self.conversation.open();

        tracing::info!(session = id, voice = %self.config.session.voice, "session opened");
        self.emit(EngineEvent::StateChanged(ConversationState::IdleListening));
        Ok(())
    }

    /// Close the session, if any, and reset all session state
    ///
    /// Safe to call in any state.
    pub fn disconnect(&mut self) {
        if self.teardown() {
            tracing::info!("session closed");
        }
    }

    /// Release session resources; returns whether a session was open
    fn teardown(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            self.conversation.reset();
            self.mute.store(false, Ordering::Relaxed);
            return false;
        };

        session.capture.stop();
        if let Err(e) = session.playback.stop() {
            tracing::debug!(error = %e, "output stop failed during teardown");
        }
        session.connection.close();

        self.conversation.reset();
        self.mute.store(false, Ordering::Relaxed);
        tracing::debug!(session = session.id, "session resources released");
        self.emit(EngineEvent::StateChanged(ConversationState::Disconnected));
        true
    }

    /// Apply one mailbox envelope
    ///
    /// Envelopes from any session other than the current one are dropped.
    pub fn handle(&mut self, envelope: Envelope) {
        let current = self.session.as_ref().map(|s| s.id);
        if current != Some(envelope.session) {
            tracing::trace!(
                session = envelope.session,
                current = ?current,
                "dropping event from stale session"
            );
            return;
        }

        match envelope.event {
            ControlEvent::Server(event) => self.dispatch(event),
            ControlEvent::Malformed { reason } => {
                self.emit(EngineEvent::Error {
                    message: format!("malformed message: {reason}"),
                    fatal: false,
                });
            }
            ControlEvent::SendFailed { reason } => {
                tracing::warn!(%reason, "send failed");
                self.emit(EngineEvent::Error {
                    message: format!("send failed: {reason}"),
                    fatal: false,
                });
            }
            ControlEvent::TransportClosed { reason } => {
                let message = reason.unwrap_or_else(|| "connection closed".to_string());
                tracing::error!(session = envelope.session, %message, "transport lost");
                self.teardown();
                self.emit(EngineEvent::Error {
                    message,
                    fatal: true,
                });
            }
            ControlEvent::PlaybackDrained { generation } => self.on_playback_drained(generation),
            ControlEvent::PlaybackRoom => {
                if let Some(session) = self.session.as_mut() {
                    let waiting = session.playback.refill();
                    tracing::trace!(waiting, "playback refilled");
                }
            }
        }
    }

    /// Apply every envelope already waiting, without blocking
    ///
    /// Returns how many were applied.
    pub fn drain_mailbox(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(envelope) = self.mailbox_rx.try_recv() {
            self.handle(envelope);
            applied += 1;
        }
        applied
    }

    /// Run the control loop until `Shutdown` or the command channel closes
    ///
    /// Connect failures are reported as fatal [`EngineEvent::Error`]s and
    /// leave the loop running.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Connect) => {
                        if let Err(e) = self.connect().await {
                            tracing::error!(error = %e, "connect failed");
                            self.emit(EngineEvent::Error {
                                message: e.to_string(),
                                fatal: true,
                            });
                        }
                    }
                    Some(EngineCommand::Disconnect) => self.disconnect(),
                    Some(EngineCommand::Interrupt) => {
                        self.interrupt(InterruptTrigger::Local);
                    }
                    Some(EngineCommand::Shutdown) | None => {
                        self.disconnect();
                        break;
                    }
                },
                Some(envelope) = self.mailbox_rx.recv() => self.handle(envelope),
            }
        }
        tracing::debug!("engine stopped");
    }

    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.conversation.state()
    }

    #[must_use]
    pub fn transcript(&self) -> &str {
        self.conversation.transcript()
    }

    #[must_use]
    pub fn response_id(&self) -> Option<&str> {
        self.conversation.response_id()
    }

    /// Whether capture is currently muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Current session, if connected
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Playback generation of the current session (0 when disconnected)
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(0, |s| s.playback.ledger().generation())
    }

    /// Buffers scheduled but not yet played (0 when disconnected)
    #[must_use]
    pub fn pending_buffers(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(0, |s| s.playback.ledger().pending())
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: EngineEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.events.send(event);
    }
}
