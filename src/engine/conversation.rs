//! Turn-taking state and the current assistant utterance

use std::fmt;

/// Who holds the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// No session
    #[default]
    Disconnected,

    /// Session open, capture live, waiting for the assistant
    IdleListening,

    /// Assistant audio is streaming or still playing; capture is muted
    AiSpeaking,

    /// Transient while an interruption runs
    Interrupting,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::IdleListening => "listening",
            Self::AiSpeaking => "speaking",
            Self::Interrupting => "interrupting",
        };
        f.write_str(name)
    }
}

/// Conversation bookkeeping owned by the control context
#[derive(Debug, Default)]
pub struct Conversation {
    state: ConversationState,
    transcript: String,
    response_id: Option<String>,
    done_sending: bool,
    cancelled_response: Option<String>,
}

impl Conversation {
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Assistant transcript accumulated for the current utterance
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Response currently being played
    #[must_use]
    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Whether the service finished sending the current response
    #[must_use]
    pub const fn done_sending(&self) -> bool {
        self.done_sending
    }

    /// Set the state, returning whether it changed
    pub fn set_state(&mut self, state: ConversationState) -> bool {
        let changed = self.state != state;
        self.state = state;
        changed
    }

    /// Fresh session: clear everything and start listening
    pub fn open(&mut self) {
        self.reset();
        self.state = ConversationState::IdleListening;
    }

    /// Back to `Disconnected` with nothing remembered
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Remember the response the service just started, if none is tracked
    pub fn note_response(&mut self, response_id: Option<&str>) {
        if self.response_id.is_none() {
            self.response_id = response_id.map(str::to_string);
        }
    }

    /// Whether an event for `response_id` belongs to a cancelled response
    #[must_use]
    pub fn is_cancelled(&self, response_id: Option<&str>) -> bool {
        response_id.is_some() && self.cancelled_response.as_deref() == response_id
    }

    /// Forget the cancelled response once the service confirms it is done
    pub fn clear_cancelled(&mut self) {
        self.cancelled_response = None;
    }

    /// Assistant output arrived
    ///
    /// Returns `true` when this starts a new utterance (listening to
    /// speaking). Output after `response.done` but before playback drained
    /// reopens the current utterance.
    pub fn begin_output(&mut self, response_id: Option<&str>) -> bool {
        self.note_response(response_id);
        match self.state {
            ConversationState::IdleListening => {
                self.state = ConversationState::AiSpeaking;
                self.done_sending = false;
                true
            }
            ConversationState::AiSpeaking => {
                self.done_sending = false;
                false
            }
            ConversationState::Disconnected | ConversationState::Interrupting => false,
        }
    }

    pub fn append_transcript(&mut self, delta: &str) {
        self.transcript.push_str(delta);
    }

    /// The service finished the current response
    ///
    /// Returns the completed transcript and clears it.
    pub fn finish_sending(&mut self) -> String {
        self.done_sending = true;
        self.response_id = None;
        std::mem::take(&mut self.transcript)
    }

    /// Drop the current utterance and remember its response as cancelled
    pub fn abandon_utterance(&mut self) {
        self.cancelled_response = self.response_id.take();
        self.transcript.clear();
        self.done_sending = false;
    }

    /// Forget the tracked response without finishing an utterance
    pub fn clear_response(&mut self) {
        self.response_id = None;
    }

    /// Whether speaking is over: everything sent and everything heard
    #[must_use]
    pub fn ready_to_listen(&self, pending_buffers: u32) -> bool {
        self.state == ConversationState::AiSpeaking && self.done_sending && pending_buffers == 0
    }

    /// Hand the floor back to the user
    pub fn finish_speaking(&mut self) {
        self.state = ConversationState::IdleListening;
        self.done_sending = false;
    }
}
