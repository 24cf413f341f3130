//! Routing of decoded server events

use std::sync::atomic::Ordering;

use super::{ConversationState, EngineEvent, InterruptTrigger, VoiceEngine};
use crate::audio::AudioDevices;
use crate::realtime::protocol::decode_audio;
use crate::realtime::{Connector, ServerEvent};

impl<C, D> VoiceEngine<C, D>
where
    C: Connector,
    D: AudioDevices,
{
    /// Apply one server event to the session
    pub fn dispatch(&mut self, event: ServerEvent) {
        if self.session.is_none() {
            tracing::trace!(?event, "no session, ignoring server event");
            return;
        }

        match event {
            ServerEvent::SessionCreated => tracing::debug!("session created"),
            ServerEvent::SessionUpdated => tracing::debug!("session configuration acknowledged"),
            ServerEvent::ResponseCreated { response } => {
                tracing::debug!(response_id = ?response.id, "response created");
                self.conversation.note_response(response.id.as_deref());
            }
            ServerEvent::AudioDelta { response_id, delta } => {
                if self.conversation.is_cancelled(response_id.as_deref()) {
                    tracing::trace!(?response_id, "dropping audio for cancelled response");
                    return;
                }
                self.on_audio(response_id.as_deref(), &delta);
            }
            ServerEvent::TranscriptDelta { response_id, delta } => {
                if self.conversation.is_cancelled(response_id.as_deref()) {
                    return;
                }
                self.begin_output(response_id.as_deref());
                if self.conversation.state() == ConversationState::AiSpeaking {
                    self.conversation.append_transcript(&delta);
                    self.emit(EngineEvent::TranscriptUpdated {
                        text: self.conversation.transcript().to_string(),
                    });
                }
            }
            ServerEvent::TranscriptDone { .. } => tracing::trace!("transcript done"),
            ServerEvent::ResponseDone { response } => {
                let response_id = response.as_ref().and_then(|r| r.id.as_deref());
                self.on_response_done(response_id);
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                let text = transcript.trim();
                if !text.is_empty() {
                    self.emit(EngineEvent::UserUtterance {
                        text: text.to_string(),
                    });
                }
            }
            ServerEvent::SpeechStarted => {
                if self.conversation.state() == ConversationState::AiSpeaking {
                    self.interrupt(InterruptTrigger::RemoteSpeech);
                } else {
                    tracing::debug!("user speech started");
                }
            }
            ServerEvent::SpeechStopped => tracing::debug!("user speech stopped"),
            ServerEvent::Error { error } => {
                if error.is_cancel_race() {
                    tracing::debug!(message = %error.message, "cancel arrived after response ended");
                    return;
                }
                tracing::warn!(
                    message = %error.message,
                    kind = ?error.kind,
                    code = ?error.code,
                    "service error"
                );
                self.emit(EngineEvent::Error {
                    message: error.message,
                    fatal: false,
                });
            }
            ServerEvent::Unknown => tracing::trace!("ignoring unhandled event type"),
        }
    }

    fn on_audio(&mut self, response_id: Option<&str>, delta: &str) {
        let pcm = match decode_audio(delta) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable audio delta");
                self.emit(EngineEvent::Error {
                    message: format!("bad audio delta: {e}"),
                    fatal: false,
                });
                return;
            }
        };

        self.begin_output(response_id);
        if self.conversation.state() != ConversationState::AiSpeaking {
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.playback.play_chunk(&pcm);
    }

    /// Enter speaking on the first fragment of an utterance
    fn begin_output(&mut self, response_id: Option<&str>) {
        if self.conversation.begin_output(response_id) {
            self.mute.store(true, Ordering::Relaxed);
            tracing::debug!(response_id = ?self.conversation.response_id(), "assistant speaking");
            self.emit(EngineEvent::StateChanged(ConversationState::AiSpeaking));
        }
    }

    fn on_response_done(&mut self, response_id: Option<&str>) {
        if self.conversation.is_cancelled(response_id) {
            tracing::debug!(?response_id, "cancelled response finished");
            self.conversation.clear_cancelled();
            return;
        }

        if self.conversation.state() != ConversationState::AiSpeaking {
            // Nothing audible was produced
            self.conversation.clear_response();
            return;
        }

        let text = self.conversation.finish_sending();
        tracing::debug!(pending = self.pending_buffers(), "response done");
        if !text.is_empty() {
            self.emit(EngineEvent::AssistantUtterance { text });
        }
        self.finish_if_drained();
    }

    pub(super) fn on_playback_drained(&mut self, generation: u32) {
        if generation != self.generation() {
            tracing::trace!(generation, "drain from flushed generation");
            return;
        }
        self.finish_if_drained();
    }

    /// Speaking to listening once everything was sent and heard
    fn finish_if_drained(&mut self) {
        if self.conversation.ready_to_listen(self.pending_buffers()) {
            self.conversation.finish_speaking();
            self.mute.store(false, Ordering::Relaxed);
            tracing::debug!("playback drained, listening");
            self.emit(EngineEvent::StateChanged(ConversationState::IdleListening));
        }
    }
}

