// Tests for the turn-taking state machine
//
// All tests run on a paused clock: scripted microphones emit a frame every
// 16ms and the runtime advances time whenever every task is idle.

mod common;

use anyhow::Result;
use common::{
    response, silence, speech, FakeGenerator, FakeSynthesizer, FakeTranscriber, RecordingOutput,
    Script, ScriptedBackend, ScriptedService, SlowStore,
};
use speak_practice::audio::{AudioCapture, AudioDevices, CaptureError, Playback, PlaybackOutcome};
use speak_practice::config::{PipelineConfig, VadConfig};
use speak_practice::pipeline::DialoguePipeline;
use speak_practice::session::{EndReason, InMemorySessionStore, Role, ScenarioContext, SessionStore};
use speak_practice::turn::{
    LocalTurnService, TurnConfig, TurnEvent, TurnHandle, TurnMachine, TurnService, TurnState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const FALLBACK: &str = "Sorry, something went wrong. Let's keep going.";

struct Rig {
    handle: TurnHandle,
    events: broadcast::Receiver<TurnEvent>,
    devices: Arc<AudioDevices>,
    starts: Arc<AtomicUsize>,
    output: Arc<RecordingOutput>,
}

fn rig(
    session_id: &str,
    backend: ScriptedBackend,
    service: Arc<dyn TurnService>,
    output: RecordingOutput,
) -> Rig {
    let devices = AudioDevices::new();
    let starts = backend.starts();
    let output = Arc::new(output);
    let capture = AudioCapture::new(Box::new(backend), devices.clone());
    let playback = Arc::new(Playback::new(output.clone(), devices.clone()));

    let handle = TurnMachine::spawn(
        TurnConfig {
            session_id: session_id.to_string(),
            vad: VadConfig::default(),
            fallback_reply: FALLBACK.to_string(),
        },
        capture,
        playback,
        service,
    );
    let events = handle.subscribe();

    Rig {
        handle,
        events,
        devices,
        starts,
        output,
    }
}

fn hello() -> Script {
    vec![speech(480), silence(1300)]
}

fn playback_output() -> RecordingOutput {
    RecordingOutput::new(Duration::from_millis(800))
}

/// Collect the next `count` state transitions
async fn transitions(
    events: &mut broadcast::Receiver<TurnEvent>,
    count: usize,
) -> Result<Vec<TurnState>> {
    let mut states = Vec::new();
    timeout(Duration::from_secs(120), async {
        while states.len() < count {
            if let TurnEvent::StateChanged { to, .. } = events.recv().await? {
                states.push(to);
            }
        }
        anyhow::Ok(())
    })
    .await??;
    Ok(states)
}

/// Drain whatever events are already queued
fn drain(events: &mut broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

struct Server {
    service: Arc<LocalTurnService>,
    store: Arc<InMemorySessionStore>,
    session_id: String,
}

async fn local_server(generator: FakeGenerator, synthesizer: FakeSynthesizer) -> Server {
    let store = Arc::new(InMemorySessionStore::new());
    let session = store.create_session(ScenarioContext::default()).await;
    let pipeline = Arc::new(DialoguePipeline::new(
        Arc::new(FakeTranscriber::returning("Hello")),
        Arc::new(generator),
        Arc::new(synthesizer),
        store.clone(),
        PipelineConfig::default(),
    ));

    Server {
        service: Arc::new(LocalTurnService::new(pipeline)),
        store,
        session_id: session.id,
    }
}

fn assert_devices_released(devices: &AudioDevices) {
    assert!(!devices.capture_active(), "microphone still held");
    assert!(!devices.playback_active(), "output still held");
    assert_eq!(devices.overlaps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_spoken_turn_round_trip() -> Result<()> {
    let server = local_server(FakeGenerator::replying("Hi there!"), FakeSynthesizer::working()).await;
    let mut rig = rig(
        &server.session_id,
        ScriptedBackend::new(vec![hello()]),
        server.service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 4).await?;
    assert_eq!(
        states,
        vec![
            TurnState::Listening,
            TurnState::Processing,
            TurnState::AiSpeaking,
            TurnState::Listening,
        ]
    );
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 1);
    assert_eq!(rig.starts.load(Ordering::SeqCst), 2);

    let session = server.store.session(&server.session_id).await?;
    let persisted: Vec<(Role, &str)> = session
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        persisted,
        vec![(Role::User, "Hello"), (Role::Assistant, "Hi there!")]
    );

    let stats = rig.handle.end().await?;
    assert_eq!(stats.turns_completed, 1);
    assert_eq!(stats.fallback_replies, 0);
    assert_eq!(stats.end_reason, Some(EndReason::UserEnded));
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reply_without_audio_skips_speaking() -> Result<()> {
    let server = local_server(FakeGenerator::replying("Hi there!"), FakeSynthesizer::failing()).await;
    let mut rig = rig(
        &server.session_id,
        ScriptedBackend::new(vec![hello()]),
        server.service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 3).await?;
    assert_eq!(
        states,
        vec![TurnState::Listening, TurnState::Processing, TurnState::Listening]
    );
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 0);

    // Text is still persisted
    let session = server.store.session(&server.session_id).await?;
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].content, "Hi there!");

    rig.handle.end().await?;
    assert_devices_released(&rig.devices);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_end_while_listening_submits_nothing() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![]));
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![vec![speech(320), silence(400)]]),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Listening).await?;
    // Mid-utterance: speech heard, endpoint not yet reached
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.handle.state(), TurnState::Listening);
    assert!(rig.devices.capture_active());

    let stats = rig.handle.end().await?;
    assert_eq!(stats.end_reason, Some(EndReason::UserEnded));
    assert_eq!(stats.turns_completed, 0);
    assert_eq!(service.calls(), 0);
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_generation_failure_is_persisted_as_fallback() -> Result<()> {
    let server = local_server(FakeGenerator::failing(), FakeSynthesizer::working()).await;
    let mut rig = rig(
        &server.session_id,
        ScriptedBackend::new(vec![hello()]),
        server.service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 4).await?;
    assert_eq!(states.last(), Some(&TurnState::Listening));

    let session = server.store.session(&server.session_id).await?;
    assert_eq!(session.messages.len(), 2);
    assert_eq!(
        session.messages[1].content,
        PipelineConfig::default().fallback_reply
    );
    assert!(!session.ended);

    let stats = rig.handle.end().await?;
    // The server recovered, so the client saw a regular exchange
    assert_eq!(stats.turns_completed, 1);
    assert_eq!(stats.fallback_replies, 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_uses_local_reply() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![Err(
        "connection reset".to_string()
    )]));
    let mut rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 3).await?;
    assert_eq!(
        states,
        vec![TurnState::Listening, TurnState::Processing, TurnState::Listening]
    );

    let events = drain(&mut rig.events);
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::TransportFailed { message, .. } if message.contains("connection reset")
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::LocalReply { text, .. } if text == FALLBACK)));

    let stats = rig.handle.end().await?;
    assert_eq!(stats.fallback_replies, 1);
    assert_eq!(stats.turns_completed, 0);
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_conversation_ends_after_playback() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![Ok(response(
        "Goodbye",
        "See you next time!",
        true,
        true,
    ))]));
    let mut rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 4).await?;
    assert_eq!(
        states,
        vec![
            TurnState::Listening,
            TurnState::Processing,
            TurnState::AiSpeaking,
            TurnState::Ended,
        ]
    );

    let stats = rig.handle.finished().await?;
    assert_eq!(stats.end_reason, Some(EndReason::ConversationFinished));
    assert_eq!(stats.turns_completed, 1);
    // The microphone never reopened
    assert_eq!(rig.starts.load(Ordering::SeqCst), 1);
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 1);
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_without_audio_ends_immediately() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![Ok(response(
        "Goodbye", "Bye!", false, true,
    ))]));
    let mut rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service,
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 3).await?;
    assert_eq!(
        states,
        vec![TurnState::Listening, TurnState::Processing, TurnState::Ended]
    );
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_ends_conversation() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![]));
    let mut rig = rig(
        "session-test",
        ScriptedBackend::denied(),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 1).await?;
    assert_eq!(states, vec![TurnState::Ended]);

    let stats = rig.handle.finished().await?;
    assert_eq!(stats.end_reason, Some(EndReason::CaptureFailed));
    assert_eq!(service.calls(), 0);
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_event_precedes_end() -> Result<()> {
    let rig = rig(
        "session-test",
        ScriptedBackend::denied(),
        Arc::new(ScriptedService::new(vec![])),
        playback_output(),
    );
    let mut events = rig.handle.subscribe();

    rig.handle.start().await?;
    let first = timeout(Duration::from_secs(5), events.recv()).await??;
    assert!(matches!(
        first,
        TurnEvent::CaptureFailed {
            error: CaptureError::PermissionDenied
        }
    ));
    assert!(rig.handle.wait_for_state(TurnState::Listening).await.is_err());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_playback_failure_still_completes_turn() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![Ok(response(
        "Hello", "Hi there!", true, false,
    ))]));
    let mut rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service,
        RecordingOutput::failing(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 4).await?;
    assert_eq!(
        states,
        vec![
            TurnState::Listening,
            TurnState::Processing,
            TurnState::AiSpeaking,
            TurnState::Listening,
        ]
    );

    let events = drain(&mut rig.events);
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::PlaybackFinished {
            outcome: PlaybackOutcome::Failed(_),
            ..
        }
    )));

    rig.handle.end().await?;
    assert_devices_released(&rig.devices);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_end_while_processing_discards_late_result() -> Result<()> {
    let service = Arc::new(
        ScriptedService::new(vec![Ok(response("Hello", "Hi there!", true, false))])
            .with_delay(Duration::from_secs(5)),
    );
    let mut rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Processing).await?;
    assert!(!rig.devices.capture_active());

    let stats = rig.handle.end().await?;
    assert_eq!(stats.end_reason, Some(EndReason::UserEnded));
    assert_eq!(stats.turns_completed, 0);
    assert_eq!(service.calls(), 1);

    // Let the original deadline pass; nothing may surface
    tokio::time::sleep(Duration::from_secs(10)).await;
    let events = drain(&mut rig.events);
    assert!(!events.iter().any(|e| matches!(
        e,
        TurnEvent::Exchange { .. } | TurnEvent::PlaybackFinished { .. }
    )));
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 0);
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_end_while_speaking_stops_playback() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![Ok(response(
        "Hello", "Hi there!", true, false,
    ))]));
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        service,
        RecordingOutput::new(Duration::from_secs(30)),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::AiSpeaking).await?;
    assert!(rig.devices.playback_active());

    let stats = rig.handle.end().await?;
    assert_eq!(stats.end_reason, Some(EndReason::UserEnded));
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_captured_utterance_reaches_service() -> Result<()> {
    let service = Arc::new(ScriptedService::new(vec![]));
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![vec![silence(160), speech(480), silence(1300)]]),
        service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Processing).await?;
    rig.handle.wait_for_state(TurnState::Listening).await?;
    rig.handle.end().await?;

    let received = service.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let audio = &received[0];
    // Leading silence, speech and the full endpointing pause are all kept
    assert!(audio.duration_ms() >= 160 + 480 + 1200);
    assert!(audio.samples.iter().any(|&s| s == common::LOUD));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_start_is_ignored_once_running() -> Result<()> {
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![]),
        Arc::new(ScriptedService::new(vec![])),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Listening).await?;
    rig.handle.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.handle.state(), TurnState::Listening);
    assert_eq!(rig.starts.load(Ordering::SeqCst), 1);

    rig.handle.end().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_releases_devices() -> Result<()> {
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![]),
        Arc::new(ScriptedService::new(vec![])),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Listening).await?;
    assert!(rig.devices.capture_active());

    let devices = rig.devices.clone();
    drop(rig);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_devices_released(&devices);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_microphone_and_speaker_never_overlap() -> Result<()> {
    // Deterministic LCG so failures are reproducible
    let mut seed: u64 = 0x7a11;
    let mut next = move |bound: u64| {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) % bound
    };

    for _ in 0..25 {
        let scripts: Vec<Script> = (0..3)
            .map(|_| {
                vec![
                    silence(16 * next(20)),
                    speech(160 + 16 * next(40)),
                    silence(1300),
                ]
            })
            .collect();
        let responses = (0..3)
            .map(|_| match next(4) {
                0 => Err("timeout".to_string()),
                1 => Ok(response("Hello", "Hi", false, false)),
                _ => Ok(response("Hello", "Hi", true, false)),
            })
            .collect();

        let service = Arc::new(
            ScriptedService::new(responses).with_delay(Duration::from_millis(10 + next(800))),
        );
        let rig = rig(
            "session-test",
            ScriptedBackend::new(scripts),
            service,
            RecordingOutput::new(Duration::from_millis(10 + next(1500))),
        );

        rig.handle.start().await?;
        tokio::time::sleep(Duration::from_millis(next(9000))).await;

        let state = rig.handle.state();
        assert_ne!(state, TurnState::Ended);
        match state {
            TurnState::Listening => assert!(!rig.devices.playback_active()),
            TurnState::AiSpeaking => assert!(!rig.devices.capture_active()),
            _ => {}
        }

        let devices = rig.devices.clone();
        let stats = rig.handle.end().await?;
        assert_eq!(stats.end_reason, Some(EndReason::UserEnded));
        assert_devices_released(&devices);
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_ends_conversation() -> Result<()> {
    let server = local_server(FakeGenerator::replying("Hi there!"), FakeSynthesizer::working()).await;
    server.store.end_session(&server.session_id).await?;

    let mut rig = rig(
        &server.session_id,
        ScriptedBackend::new(vec![hello(), hello(), hello()]),
        server.service.clone(),
        playback_output(),
    );

    rig.handle.start().await?;
    let states = transitions(&mut rig.events, 3).await?;
    assert_eq!(
        states,
        vec![TurnState::Listening, TurnState::Processing, TurnState::Ended]
    );

    // Give a reopened microphone plenty of time to show up
    tokio::time::sleep(Duration::from_secs(10)).await;

    let stats = rig.handle.finished().await?;
    assert_eq!(stats.end_reason, Some(EndReason::SessionClosed));
    assert_eq!(stats.fallback_replies, 0);
    assert_eq!(rig.starts.load(Ordering::SeqCst), 1);
    assert!(server.store.session(&server.session_id).await?.messages.is_empty());
    assert_devices_released(&rig.devices);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_end_while_processing_persists_whole_turn() -> Result<()> {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let session = store.create_session(ScenarioContext::default()).await;
    let pipeline = Arc::new(DialoguePipeline::new(
        Arc::new(FakeTranscriber::returning("Hello")),
        Arc::new(FakeGenerator::replying("Hi there!")),
        Arc::new(FakeSynthesizer::working()),
        store.clone(),
        PipelineConfig::default(),
    ));

    let mut rig = rig(
        &session.id,
        ScriptedBackend::new(vec![hello()]),
        Arc::new(LocalTurnService::new(pipeline)),
        playback_output(),
    );

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Processing).await?;
    let stats = rig.handle.end().await?;
    assert_eq!(stats.end_reason, Some(EndReason::UserEnded));

    tokio::time::sleep(Duration::from_secs(5)).await;

    let stored = store.session(&session.id).await?;
    let persisted: Vec<(Role, &str)> = stored
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        persisted,
        vec![(Role::User, "Hello"), (Role::Assistant, "Hi there!")]
    );

    // The late result never reached the ended conversation
    let events = drain(&mut rig.events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, TurnEvent::Exchange { .. })));
    assert_eq!(rig.output.plays.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_level_meter_follows_microphone() -> Result<()> {
    let rig = rig(
        "session-test",
        ScriptedBackend::new(vec![hello()]),
        Arc::new(ScriptedService::new(vec![]).with_delay(Duration::from_secs(1))),
        playback_output(),
    );
    assert_eq!(rig.handle.level(), 0.0);

    rig.handle.start().await?;
    rig.handle.wait_for_state(TurnState::Listening).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rig.handle.level() > 50.0, "level {}", rig.handle.level());

    rig.handle.wait_for_state(TurnState::Processing).await?;
    assert_eq!(rig.handle.level(), 0.0);

    rig.handle.end().await?;
    Ok(())
}
