//! Control-context mailbox
//!
//! Network tasks and audio callbacks never touch engine state directly. They
//! post [`ControlEvent`]s here and the engine applies them one at a time.

use tokio::sync::mpsc;

use crate::realtime::ServerEvent;

/// Identifies one connect/disconnect cycle
pub type SessionId = u64;

/// Event marshaled into the control context
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Decoded message from the remote service
    Server(ServerEvent),

    /// Inbound frame that could not be decoded
    Malformed { reason: String },

    /// Outbound frame could not be written
    SendFailed { reason: String },

    /// Transport closed or failed
    TransportClosed { reason: Option<String> },

    /// Pending-buffer count reached zero for `generation`
    PlaybackDrained { generation: u32 },

    /// The output made room for backlogged buffers
    PlaybackRoom,
}

/// A control event tagged with the session that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub session: SessionId,
    pub event: ControlEvent,
}

/// Sending half of the control mailbox, bound to one session
#[derive(Debug, Clone)]
pub struct Mailbox {
    session: SessionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    /// Bind a sender to a session
    #[must_use]
    pub const fn new(session: SessionId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { session, tx }
    }

    /// Post an event without blocking
    ///
    /// Returns `false` if the control context has gone away.
    pub fn post(&self, event: ControlEvent) -> bool {
        self.tx
            .send(Envelope {
                session: self.session,
                event,
            })
            .is_ok()
    }

    /// Session this mailbox posts for
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }
}
