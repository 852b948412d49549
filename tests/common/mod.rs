// Shared fakes for integration tests
//
// Scripted microphone, recording audio output, scripted turn service and
// fake pipeline collaborators.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::Utc;
use speak_practice::audio::{AudioBackend, AudioFrame, AudioOutput, CaptureError, PlaybackError};
use speak_practice::pipeline::{
    DialogueContext, DialogueGenerator, Generation, SpeechSynthesizer, Transcriber, TurnResponse,
};
use speak_practice::session::{
    ConversationSession, FeedbackItem, InMemorySessionStore, Message, NewExchange, Role,
    ScenarioContext, SessionStore, StoreError,
};
use speak_practice::turn::TurnService;
use speak_practice::CapturedAudio;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const FRAME_MS: u64 = 16;
pub const SAMPLES_PER_FRAME: usize = 256; // 16ms at 16kHz
pub const LOUD: i16 = 8000; // level ≈ 62
pub const QUIET: i16 = 0;

/// (sample value, duration in ms) segments of one utterance
pub type Script = Vec<(i16, u64)>;

pub fn speech(ms: u64) -> (i16, u64) {
    (LOUD, ms)
}

pub fn silence(ms: u64) -> (i16, u64) {
    (QUIET, ms)
}

pub fn frame(value: i16) -> AudioFrame {
    AudioFrame {
        samples: vec![value; SAMPLES_PER_FRAME],
        sample_rate: 16000,
        channels: 1,
        sequence: 0,
    }
}

/// Microphone that plays one script per `start()`, then silence forever
pub struct ScriptedBackend {
    scripts: VecDeque<Script>,
    deny: bool,
    starts: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: scripts.into(),
            deny: false,
            starts: Arc::new(AtomicUsize::new(0)),
            task: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new(Vec::new())
        }
    }

    /// Counter of successful starts, readable after the backend is moved
    pub fn starts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }
}

#[async_trait::async_trait]
impl AudioBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied);
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let scripted = script
                .into_iter()
                .flat_map(|(value, ms)| std::iter::repeat(value).take((ms / FRAME_MS) as usize));

            for value in scripted.chain(std::iter::repeat(QUIET)) {
                ticker.tick().await;
                if tx.send(frame(value)).await.is_err() {
                    break;
                }
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Audio output that records plays and takes a fixed time per payload
pub struct RecordingOutput {
    pub plays: AtomicUsize,
    pub duration: Duration,
    pub fail: bool,
}

impl RecordingOutput {
    pub fn new(duration: Duration) -> Self {
        Self {
            plays: AtomicUsize::new(0),
            duration,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }
}

#[async_trait::async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, _payload: &[u8]) -> Result<(), PlaybackError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PlaybackError::Output("autoplay blocked".to_string()));
        }
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub fn message(role: Role, content: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: "session-test".to_string(),
        role,
        content: content.to_string(),
        feedback: None,
        created_at: Utc::now(),
    }
}

pub fn response(user: &str, reply: &str, with_audio: bool, ended: bool) -> TurnResponse {
    TurnResponse {
        user_message: message(Role::User, user),
        ai_message: message(Role::Assistant, reply),
        audio_payload: with_audio.then(|| vec![1, 2, 3, 4]),
        ended,
    }
}

/// Turn service answering from a queue; an exhausted queue repeats "ok"
pub struct ScriptedService {
    responses: Mutex<VecDeque<Result<TurnResponse, String>>>,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub received: Mutex<Vec<CapturedAudio>>,
}

impl ScriptedService {
    pub fn new(responses: Vec<Result<TurnResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TurnService for ScriptedService {
    async fn submit_turn(&self, _session_id: &str, audio: CapturedAudio) -> Result<TurnResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(audio);
        tokio::time::sleep(self.delay).await;

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(response("...", "ok", false, false)),
        }
    }
}

/// Transcriber failing a set number of times before answering
pub struct FakeTranscriber {
    text: Option<String>,
    failures_left: AtomicUsize,
    pub calls: AtomicUsize,
    pub formats: Mutex<Vec<String>>,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            formats: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            ..Self::returning("")
        }
    }

    pub fn flaky(text: &str, failures: usize) -> Self {
        let fake = Self::returning(text);
        fake.failures_left.store(failures, Ordering::SeqCst);
        fake
    }
}

#[async_trait::async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.formats.lock().unwrap().push(format.to_string());
        if audio.is_empty() {
            return Err(anyhow!("no audio"));
        }
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("transcription service unavailable"));
        }
        self.text
            .clone()
            .ok_or_else(|| anyhow!("transcription service unavailable"))
    }
}

/// Generator answering from a queue (last answer repeats) and recording contexts
pub struct FakeGenerator {
    answers: Mutex<VecDeque<Result<Generation, String>>>,
    pub contexts: Mutex<Vec<DialogueContext>>,
}

impl FakeGenerator {
    pub fn scripted(answers: Vec<Result<Generation, String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(reply: &str) -> Self {
        Self::scripted(vec![Ok(generation(reply, false))])
    }

    pub fn failing() -> Self {
        Self::scripted(vec![Err("model overloaded".to_string())])
    }
}

pub fn generation(reply: &str, finished: bool) -> Generation {
    Generation {
        reply_text: reply.to_string(),
        feedback: Vec::new(),
        is_finished: finished,
    }
}

#[async_trait::async_trait]
impl DialogueGenerator for FakeGenerator {
    async fn generate(&self, context: &DialogueContext) -> Result<Generation> {
        self.contexts.lock().unwrap().push(context.clone());

        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };

        match answer {
            Some(Ok(generation)) => Ok(generation),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted answer")),
        }
    }
}

pub struct FakeSynthesizer {
    fail: bool,
    pub calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub fn working() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("voice not available"));
        }
        Ok(format!("audio:{}", text).into_bytes())
    }
}

/// In-memory store whose exchange writes take a while, like a networked database
pub struct SlowStore {
    pub inner: InMemorySessionStore,
    pub write_delay: Duration,
}

impl SlowStore {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            write_delay,
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for SlowStore {
    async fn create_session(&self, scenario: ScenarioContext) -> ConversationSession {
        self.inner.create_session(scenario).await
    }

    async fn session(&self, session_id: &str) -> Result<ConversationSession, StoreError> {
        self.inner.session(session_id).await
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner.recent_messages(session_id, limit).await
    }

    async fn create_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.inner.create_message(session_id, role, content).await
    }

    async fn attach_feedback(
        &self,
        message_id: &str,
        feedback: Vec<FeedbackItem>,
    ) -> Result<Message, StoreError> {
        self.inner.attach_feedback(message_id, feedback).await
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        exchange: NewExchange,
    ) -> Result<(Message, Message), StoreError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.append_exchange(session_id, exchange).await
    }

    async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.end_session(session_id).await
    }
}
