//! Engine integration tests
//!
//! Drives the control context through scripted server events against
//! in-memory devices.

use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use realtime_voice::audio::{CapturePipeline, CompletionOutcome, WIRE_SAMPLE_RATE};
use realtime_voice::config::file::VoiceConfigFile;
use realtime_voice::engine::{ControlEvent, InterruptTrigger};
use realtime_voice::realtime::{ClientEvent, ErrorDetail, ServerEvent};
use realtime_voice::{Config, ConversationState, EngineCommand, EngineEvent, Error};

mod common;

use common::{
    Rig, audio_delta, drain_events, errors, response_done, test_config, transcript_delta,
};

async fn connected(rig: &Rig) -> (common::TestEngine, mpsc::UnboundedReceiver<EngineEvent>) {
    let (mut engine, mut events) = rig.engine(test_config());
    assert_ok!(engine.connect().await);
    assert_eq!(engine.state(), ConversationState::IdleListening);
    drain_events(&mut events);
    (engine, events)
}

#[tokio::test]
async fn test_connect_sends_session_update_first() {
    let rig = Rig::new();
    let (mut engine, mut events) = rig.engine(test_config());
    assert_eq!(engine.state(), ConversationState::Disconnected);

    assert_ok!(engine.connect().await);

    let sent = rig.sent_events();
    assert_eq!(sent.len(), 1);
    let ClientEvent::SessionUpdate { session } = &sent[0] else {
        panic!("expected session.update, got {:?}", sent[0]);
    };
    assert_eq!(session.voice, "alloy");
    assert!(engine.is_connected());
    assert!(!engine.is_muted());
    assert_eq!(
        drain_events(&mut events),
        vec![EngineEvent::StateChanged(ConversationState::IdleListening)]
    );
}

#[tokio::test]
async fn test_connect_while_connected_is_noop() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;
    let session = engine.session_id();

    assert_ok!(engine.connect().await);

    assert_eq!(engine.session_id(), session);
    assert_eq!(rig.connections(), 1);
    assert_eq!(rig.sent_events().len(), 1);
}

/// The first transcript fragment starts speaking
#[tokio::test]
async fn test_transcript_fragment_starts_speaking() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(transcript_delta("resp_1", "Hi"));
    assert_eq!(engine.drain_mailbox(), 1);

    assert_eq!(engine.state(), ConversationState::AiSpeaking);
    assert_eq!(engine.transcript(), "Hi");
    assert_eq!(engine.response_id(), Some("resp_1"));
    assert!(engine.is_muted());
    assert_eq!(
        drain_events(&mut events),
        vec![
            EngineEvent::StateChanged(ConversationState::AiSpeaking),
            EngineEvent::TranscriptUpdated {
                text: "Hi".to_string()
            },
        ]
    );
}

/// Done only arms the transition; the last completion fires it
#[tokio::test]
async fn test_done_waits_for_playback_to_drain() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 480));
    rig.push(transcript_delta("resp_1", "Hello "));
    rig.push(audio_delta("resp_1", 480));
    rig.push(transcript_delta("resp_1", "there"));
    engine.drain_mailbox();
    assert_eq!(engine.pending_buffers(), 2);

    rig.push(response_done("resp_1"));
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::AiSpeaking);
    assert!(engine.is_muted());
    assert_eq!(engine.transcript(), "");

    assert_eq!(rig.complete_next(), Some(CompletionOutcome::Pending(1)));
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::AiSpeaking);

    assert_eq!(rig.complete_next(), Some(CompletionOutcome::Drained));
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert!(!engine.is_muted());
    assert_eq!(engine.pending_buffers(), 0);

    let events = drain_events(&mut events);
    assert!(events.contains(&EngineEvent::AssistantUtterance {
        text: "Hello there".to_string()
    }));
    assert_eq!(
        events.last(),
        Some(&EngineEvent::StateChanged(ConversationState::IdleListening))
    );
}

#[tokio::test]
async fn test_done_with_nothing_pending_listens_immediately() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;

    rig.push(transcript_delta("resp_1", "ok"));
    rig.push(response_done("resp_1"));
    engine.drain_mailbox();

    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert!(!engine.is_muted());
}

#[tokio::test]
async fn test_next_response_reopens_utterance() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    rig.push(response_done("resp_1"));
    rig.push(audio_delta("resp_2", 240));
    engine.drain_mailbox();
    assert_eq!(engine.pending_buffers(), 2);

    // resp_1 finishing playback must not end resp_2
    rig.complete_next();
    rig.complete_next();
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::AiSpeaking);

    rig.push(response_done("resp_2"));
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::IdleListening);
}

/// Interruption is immediate and old completions are no-ops
#[tokio::test]
async fn test_interrupt_flushes_playback() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 480));
    rig.push(audio_delta("resp_1", 480));
    engine.drain_mailbox();
    assert_eq!(engine.generation(), 0);
    assert_eq!(engine.pending_buffers(), 2);

    // The device already holds these when the interruption lands
    let in_flight = rig.take_queued();
    drain_events(&mut events);

    assert!(engine.interrupt(InterruptTrigger::Local));

    assert_eq!(engine.generation(), 1);
    assert_eq!(engine.pending_buffers(), 0);
    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert!(!engine.is_muted());
    assert_eq!(engine.response_id(), None);

    for buffer in in_flight {
        assert_eq!(buffer.complete(), CompletionOutcome::Stale);
    }
    assert_eq!(engine.drain_mailbox(), 0);
    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert_eq!(engine.pending_buffers(), 0);
    assert_eq!(
        drain_events(&mut events),
        vec![EngineEvent::StateChanged(ConversationState::IdleListening)]
    );
}

#[tokio::test]
async fn test_interrupt_cancels_before_halting_output() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;

    rig.push(audio_delta("resp_7", 240));
    engine.drain_mailbox();
    assert!(engine.interrupt(InterruptTrigger::Local));

    let timeline = rig.timeline();
    assert_eq!(
        &timeline[timeline.len() - 2..],
        &["send:response.cancel".to_string(), "halt:1".to_string()]
    );
    assert_eq!(
        rig.sent_events().last(),
        Some(&ClientEvent::ResponseCancel {
            response_id: Some("resp_7".to_string())
        })
    );
}

#[tokio::test]
async fn test_interrupt_when_listening_does_nothing() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    assert!(!engine.interrupt(InterruptTrigger::Local));
    assert_eq!(engine.generation(), 0);
    assert_eq!(rig.sent_events().len(), 1);
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test]
async fn test_remote_speech_interrupts() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    rig.push(ServerEvent::SpeechStarted);
    engine.drain_mailbox();

    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert_eq!(engine.generation(), 1);
    assert!(
        rig.sent_events()
            .contains(&ClientEvent::ResponseCancel {
                response_id: Some("resp_1".to_string())
            })
    );
}

#[tokio::test]
async fn test_late_deltas_for_cancelled_response_are_ignored() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    rig.push(transcript_delta("resp_1", "I was say"));
    engine.drain_mailbox();
    engine.interrupt(InterruptTrigger::Local);
    drain_events(&mut events);

    rig.push(audio_delta("resp_1", 240));
    rig.push(transcript_delta("resp_1", "ing"));
    rig.push(response_done("resp_1"));
    engine.drain_mailbox();

    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert_eq!(engine.pending_buffers(), 0);
    assert_eq!(engine.transcript(), "");
    assert_eq!(rig.queued(), 0);
    assert!(drain_events(&mut events).is_empty());

    rig.push(audio_delta("resp_2", 240));
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::AiSpeaking);
}

/// A cancel that races the end of the response is not an error
#[tokio::test]
async fn test_cancel_race_error_is_swallowed() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();
    engine.interrupt(InterruptTrigger::Local);

    rig.push(ServerEvent::Error {
        error: ErrorDetail {
            message: "Cancellation failed: no active response found".to_string(),
            kind: Some("invalid_request_error".to_string()),
            code: None,
        },
    });
    engine.drain_mailbox();
    assert!(errors(&drain_events(&mut events)).is_empty());

    rig.push(ServerEvent::Error {
        error: ErrorDetail {
            message: "Invalid value for voice".to_string(),
            ..ErrorDetail::default()
        },
    });
    engine.drain_mailbox();
    assert_eq!(
        errors(&drain_events(&mut events)),
        vec![("Invalid value for voice".to_string(), false)]
    );
    assert!(engine.is_connected());
}

/// Nothing is captured while the assistant speaks
#[tokio::test]
async fn test_capture_is_muted_while_speaking() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;
    let mut capture = CapturePipeline::new(WIRE_SAMPLE_RATE, 1, rig.capture_sink()).unwrap();
    let frame = vec![0.25; 960];

    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();
    assert!(rig.capture_sink().mute.load(Ordering::Relaxed));

    assert_eq!(capture.process(&frame), 0);
    assert!(
        !rig.sent_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::InputAudioBufferAppend { .. }))
    );

    rig.push(response_done("resp_1"));
    engine.drain_mailbox();
    rig.complete_next();
    engine.drain_mailbox();
    assert_eq!(engine.state(), ConversationState::IdleListening);

    assert_eq!(capture.process(&frame), 1);
    assert!(
        rig.sent_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::InputAudioBufferAppend { .. }))
    );
}

#[tokio::test]
async fn test_user_transcript_is_reported() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(ServerEvent::InputTranscriptionCompleted {
        transcript: " what time is it?\n".to_string(),
    });
    rig.push(ServerEvent::InputTranscriptionCompleted {
        transcript: "  ".to_string(),
    });
    engine.drain_mailbox();

    assert_eq!(
        drain_events(&mut events),
        vec![EngineEvent::UserUtterance {
            text: "what time is it?".to_string()
        }]
    );
}

#[tokio::test]
async fn test_malformed_frame_is_not_fatal() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.post(ControlEvent::Malformed {
        reason: "expected value at line 1".to_string(),
    });
    engine.drain_mailbox();

    let errors = errors(&drain_events(&mut events));
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].1);
    assert!(engine.is_connected());
}

#[tokio::test]
async fn test_send_failure_is_not_fatal() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.post(ControlEvent::SendFailed {
        reason: "broken pipe".to_string(),
    });
    engine.drain_mailbox();

    assert_eq!(
        errors(&drain_events(&mut events)),
        vec![("send failed: broken pipe".to_string(), false)]
    );
    assert!(engine.is_connected());
}

#[tokio::test]
async fn test_unqueued_cancel_is_reported() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();
    drain_events(&mut events);

    rig.sever_writer();
    assert!(engine.interrupt(InterruptTrigger::Local));

    // The interruption still completes locally
    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert_eq!(engine.pending_buffers(), 0);
    assert!(engine.is_connected());

    let errors = errors(&drain_events(&mut events));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("response.cancel"), "{}", errors[0].0);
    assert!(!errors[0].1);
}

#[tokio::test]
async fn test_refused_capture_frames_are_reported() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;
    let mut capture = CapturePipeline::new(WIRE_SAMPLE_RATE, 1, rig.capture_sink()).unwrap();

    rig.sever_writer();
    assert_eq!(capture.process(&[0.1; 960]), 0);
    assert_eq!(capture.dropped(), 1);
    engine.drain_mailbox();

    let errors = errors(&drain_events(&mut events));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.starts_with("send failed:"), "{}", errors[0].0);
    assert!(!errors[0].1);
    assert!(engine.is_connected());
}

#[tokio::test]
async fn test_speech_beyond_output_capacity_is_backlogged() {
    let rig = Rig::new();
    rig.limit_output(2);
    let (mut engine, mut events) = connected(&rig).await;

    for _ in 0..5 {
        rig.push(audio_delta("resp_1", 240));
    }
    rig.push(response_done("resp_1"));
    engine.drain_mailbox();

    assert_eq!(rig.queued(), 2);
    assert_eq!(engine.pending_buffers(), 5);
    assert!(errors(&drain_events(&mut events)).is_empty());

    let mut played = 0;
    while rig.complete_next().is_some() {
        played += 1;
        engine.drain_mailbox();
        if played < 5 {
            assert_eq!(engine.state(), ConversationState::AiSpeaking);
        }
    }

    assert_eq!(played, 5);
    assert_eq!(engine.pending_buffers(), 0);
    assert_eq!(engine.state(), ConversationState::IdleListening);
}

#[tokio::test]
async fn test_transport_loss_is_fatal_once() {
    let rig = Rig::new();
    let (mut engine, mut events) = connected(&rig).await;
    let mailbox = rig.mailbox(0);

    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();

    mailbox.post(ControlEvent::TransportClosed {
        reason: Some("connection reset".to_string()),
    });
    mailbox.post(ControlEvent::TransportClosed { reason: None });
    engine.drain_mailbox();

    assert_eq!(engine.state(), ConversationState::Disconnected);
    assert!(!engine.is_connected());
    assert!(!engine.is_muted());
    assert_eq!(engine.pending_buffers(), 0);

    let events = drain_events(&mut events);
    assert_eq!(
        errors(&events),
        vec![("connection reset".to_string(), true)]
    );
    assert!(events.contains(&EngineEvent::StateChanged(ConversationState::Disconnected)));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let rig = Rig::new();
    let (mut engine, mut events) = rig.engine(test_config());

    engine.disconnect();
    assert_eq!(engine.state(), ConversationState::Disconnected);
    assert!(drain_events(&mut events).is_empty());

    assert_ok!(engine.connect().await);
    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();
    drain_events(&mut events);

    engine.disconnect();
    engine.disconnect();

    assert_eq!(engine.state(), ConversationState::Disconnected);
    assert_eq!(engine.transcript(), "");
    assert_eq!(engine.response_id(), None);
    assert!(!engine.is_muted());
    assert_eq!(rig.input_stops(), 1);
    assert_eq!(
        rig.timeline().iter().filter(|s| *s == "close").count(),
        1
    );
    assert_eq!(
        drain_events(&mut events),
        vec![EngineEvent::StateChanged(ConversationState::Disconnected)]
    );
}

#[tokio::test]
async fn test_events_from_previous_session_are_ignored() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;
    let old = rig.mailbox(0);

    engine.disconnect();
    assert_ok!(engine.connect().await);
    assert_eq!(rig.connections(), 2);
    assert_ne!(rig.mailbox(1).session(), old.session());

    old.post(ControlEvent::Server(transcript_delta("resp_old", "stale")));
    old.post(ControlEvent::TransportClosed { reason: None });
    old.post(ControlEvent::PlaybackDrained { generation: 0 });
    assert_eq!(engine.drain_mailbox(), 3);

    assert!(engine.is_connected());
    assert_eq!(engine.state(), ConversationState::IdleListening);
    assert_eq!(engine.transcript(), "");
}

#[tokio::test]
async fn test_session_state_resets_between_sessions() {
    let rig = Rig::new();
    let (mut engine, _events) = connected(&rig).await;

    rig.push(audio_delta("resp_1", 240));
    engine.drain_mailbox();
    engine.interrupt(InterruptTrigger::Local);
    assert_eq!(engine.generation(), 1);

    engine.disconnect();
    assert_ok!(engine.connect().await);
    assert_eq!(engine.generation(), 0);
    assert_eq!(engine.pending_buffers(), 0);
}

#[tokio::test]
async fn test_missing_key_fails_before_connecting() {
    let rig = Rig::new();
    let config = Config::from_sources(VoiceConfigFile::default(), |_| None);
    let (mut engine, _events) = rig.engine(config);

    let err = assert_err!(engine.connect().await);
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(engine.state(), ConversationState::Disconnected);
    assert_eq!(rig.connections(), 0);
}

#[tokio::test]
async fn test_refused_connection_leaves_engine_usable() {
    let rig = Rig::new();
    let (mut engine, _events) = rig.engine(test_config());

    rig.refuse_connect(true);
    let err = assert_err!(engine.connect().await);
    assert!(matches!(err, Error::Transport(_)));
    assert!(!engine.is_connected());

    rig.refuse_connect(false);
    assert_ok!(engine.connect().await);
    assert!(engine.is_connected());
}

#[tokio::test]
async fn test_device_failure_tears_down_connection() {
    let rig = Rig::new();
    let (mut engine, mut events) = rig.engine(test_config());

    rig.fail_input(true);
    let err = assert_err!(engine.connect().await);
    assert!(matches!(err, Error::Audio(_)));
    assert_eq!(engine.state(), ConversationState::Disconnected);
    assert!(!engine.is_connected());
    assert!(rig.timeline().contains(&"close".to_string()));
    assert!(drain_events(&mut events).is_empty());

    rig.fail_input(false);
    rig.fail_output(true);
    assert_err!(engine.connect().await);
    assert!(!engine.is_connected());

    rig.fail_output(false);
    assert_ok!(engine.connect().await);
    assert_eq!(engine.state(), ConversationState::IdleListening);
}

#[tokio::test]
async fn test_run_loop_handles_commands() {
    let rig = Rig::new();
    let (mut engine, mut events) = rig.engine(test_config());
    let (commands, rx) = mpsc::channel(8);

    commands.send(EngineCommand::Connect).await.unwrap();
    commands.send(EngineCommand::Interrupt).await.unwrap();
    commands.send(EngineCommand::Shutdown).await.unwrap();
    engine.run(rx).await;

    assert!(!engine.is_connected());
    assert_eq!(
        drain_events(&mut events),
        vec![
            EngineEvent::StateChanged(ConversationState::IdleListening),
            EngineEvent::StateChanged(ConversationState::Disconnected),
        ]
    );
}

#[tokio::test]
async fn test_run_loop_reports_connect_failure() {
    let rig = Rig::new();
    rig.refuse_connect(true);
    let (mut engine, mut events) = rig.engine(test_config());
    let (commands, rx) = mpsc::channel(8);

    commands.send(EngineCommand::Connect).await.unwrap();
    drop(commands);
    engine.run(rx).await;

    let errors = errors(&drain_events(&mut events));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1);
}
