//! Barge-in
//!
//! An interruption cancels the remote response, flushes local playback and
//! hands the floor back to the user, all inside one control-context call.

use std::sync::atomic::Ordering;

use super::{ConversationState, EngineEvent, VoiceEngine};
use crate::audio::AudioDevices;
use crate::realtime::{ClientEvent, Connector};

/// What asked for the interruption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptTrigger {
    /// Local affordance (key press, command)
    Local,

    /// The service detected the user talking over the assistant
    RemoteSpeech,
}

impl<C, D> VoiceEngine<C, D>
where
    C: Connector,
    D: AudioDevices,
{
    /// Stop the assistant mid-utterance
    ///
    /// Does nothing unless the assistant is speaking. Returns whether an
    /// interruption happened.
    pub fn interrupt(&mut self, trigger: InterruptTrigger) -> bool {
        if self.conversation.state() != ConversationState::AiSpeaking {
            tracing::debug!(?trigger, state = %self.conversation.state(), "nothing to interrupt");
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        self.conversation.set_state(ConversationState::Interrupting);

        // Best-effort; a cancel racing the end of the response comes back
        // as an error event that dispatch swallows
        let response_id = self.conversation.response_id().map(str::to_string);
        let cancel_error = session
            .connection
            .send(ClientEvent::ResponseCancel {
                response_id: response_id.clone(),
            })
            .err();
        if let Some(e) = &cancel_error {
            tracing::warn!(error = %e, "could not queue response.cancel");
        }

        let generation = match session.playback.stop() {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(error = %e, "output restart failed");
                session.playback.ledger().generation()
            }
        };

        self.conversation.abandon_utterance();
        self.conversation.finish_speaking();
        self.mute.store(false, Ordering::Relaxed);

        tracing::info!(?trigger, generation, response_id = ?response_id, "assistant interrupted");
        if let Some(e) = cancel_error {
            self.emit(EngineEvent::Error {
                message: e.to_string(),
                fatal: false,
            });
        }
        self.emit(EngineEvent::StateChanged(ConversationState::IdleListening));
        true
    }
}
