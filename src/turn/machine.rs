use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::service::{session_closed, TurnService};
use super::state::{Turn, TurnEvent, TurnState};
use crate::audio::{AudioCapture, Playback, PlaybackOutcome};
use crate::config::VadConfig;
use crate::pipeline::TurnResponse;
use crate::session::{ConversationStats, EndReason};
use crate::vad::{VadEvent, VoiceActivityDetector};

/// Configuration for one conversation on the client side
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub session_id: String,
    pub vad: VadConfig,
    /// Reply shown when a turn cannot be completed
    pub fallback_reply: String,
}

#[derive(Debug)]
enum TurnCommand {
    Start,
    End,
}

/// Completions of work spawned by the machine, tagged with their turn
enum Completion {
    Pipeline {
        turn_id: u64,
        result: Result<TurnResponse>,
    },
    Playback {
        turn_id: u64,
        outcome: PlaybackOutcome,
    },
}

/// Control surface of a running conversation
///
/// Dropping the handle tears the conversation down like [`TurnHandle::end`].
pub struct TurnHandle {
    commands: mpsc::Sender<TurnCommand>,
    state: watch::Receiver<TurnState>,
    level: watch::Receiver<f32>,
    events: broadcast::Sender<TurnEvent>,
    task: JoinHandle<ConversationStats>,
}

impl TurnHandle {
    /// Begin listening (IDLE → LISTENING)
    pub async fn start(&self) -> Result<()> {
        self.commands
            .send(TurnCommand::Start)
            .await
            .map_err(|_| anyhow!("Conversation already ended"))
    }

    /// Terminate from any state and wait for teardown to finish
    pub async fn end(self) -> Result<ConversationStats> {
        // The machine may already have ended on its own
        let _ = self.commands.send(TurnCommand::End).await;
        self.task.await.context("Turn machine panicked")
    }

    /// Wait until the conversation ends by itself
    pub async fn finished(self) -> Result<ConversationStats> {
        let Self { commands, task, .. } = self;
        let stats = task.await.context("Turn machine panicked")?;
        drop(commands);
        Ok(stats)
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Recent microphone level on the 0-255 scale, zero when not listening
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    pub async fn wait_for_state(&self, target: TurnState) -> Result<TurnState> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| *s == target || *s == TurnState::Ended)
            .await
            .context("Turn machine stopped")?;

        if *state != target {
            anyhow::bail!("Conversation ended before reaching {:?}", target);
        }
        Ok(*state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }
}

/// Turn-taking controller for one conversation
///
/// A single task owns the capture, the VAD and the current turn. Commands,
/// captured frames, the silence deadline and completions of spawned work are
/// all handled from one `select!` loop, so every transition happens in order
/// and late completions are recognized by their turn id.
pub struct TurnMachine {
    config: TurnConfig,
    state: TurnState,
    turn: Option<Turn>,
    next_turn_id: u64,
    vad: VoiceActivityDetector,
    capture: AudioCapture,
    playback: Arc<Playback>,
    service: Arc<dyn TurnService>,
    state_tx: watch::Sender<TurnState>,
    level_tx: watch::Sender<f32>,
    events: broadcast::Sender<TurnEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    pipeline_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
    torn_down: bool,
    stats: ConversationStats,
    started: Instant,
}

impl TurnMachine {
    pub fn spawn(
        config: TurnConfig,
        capture: AudioCapture,
        playback: Arc<Playback>,
        service: Arc<dyn TurnService>,
    ) -> TurnHandle {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let (level_tx, level_rx) = watch::channel(0.0);
        let (events, _) = broadcast::channel(64);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let machine = Self {
            vad: VoiceActivityDetector::new(&config.vad),
            config,
            state: TurnState::Idle,
            turn: None,
            next_turn_id: 0,
            capture,
            playback,
            service,
            state_tx,
            level_tx,
            events: events.clone(),
            completions_tx,
            completions_rx,
            pipeline_task: None,
            playback_task: None,
            torn_down: false,
            stats: ConversationStats {
                started_at: Utc::now(),
                duration_secs: 0.0,
                turns_completed: 0,
                fallback_replies: 0,
                end_reason: None,
            },
            started: Instant::now(),
        };

        let task = tokio::spawn(machine.run(commands_rx));

        TurnHandle {
            commands: commands_tx,
            state: state_rx,
            level: level_rx,
            events,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<TurnCommand>) -> ConversationStats {
        info!(
            "Conversation {} ready (capture: {})",
            self.config.session_id,
            self.capture.backend_name()
        );

        while self.state != TurnState::Ended {
            let listening = self.state == TurnState::Listening;
            let deadline = self.vad.silence_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(TurnCommand::Start) => self.begin().await,
                    Some(TurnCommand::End) => self.teardown(EndReason::UserEnded).await,
                    None => self.teardown(EndReason::HandleDropped).await,
                },
                frame = self.capture.next_frame(), if listening => match frame {
                    Some(frame) => {
                        let event = self.vad.observe(frame.level, Instant::now());
                        self.level_tx.send_replace(self.vad.level());
                        self.on_vad(event).await;
                    }
                    None => self.on_capture_closed().await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if listening && deadline.is_some() => {
                    let event = self.vad.poll(Instant::now());
                    self.on_vad(event).await;
                },
                Some(completion) = self.completions_rx.recv() => self.on_completion(completion).await,
            }
        }

        self.stats.duration_secs = self.started.elapsed().as_secs_f64();
        info!(
            "Conversation {} finished: {} turns, {} local fallbacks, {:?}",
            self.config.session_id,
            self.stats.turns_completed,
            self.stats.fallback_replies,
            self.stats.end_reason
        );
        self.stats
    }

    async fn begin(&mut self) {
        if self.state != TurnState::Idle {
            debug!("Start ignored in {:?}", self.state);
            return;
        }
        self.start_listening().await;
    }

    async fn start_listening(&mut self) {
        if self.torn_down {
            return;
        }

        if self.playback.is_active() {
            error!("Refusing to open the microphone while playback is active");
            return;
        }

        match self.capture.start().await {
            Ok(()) => {
                self.vad.reset();
                self.next_turn_id += 1;
                self.turn = Some(Turn::new(self.next_turn_id));
                self.transition(TurnState::Listening);
            }
            Err(error) => {
                error!("Failed to start capture: {}", error);
                self.emit(TurnEvent::CaptureFailed { error });
                self.teardown(EndReason::CaptureFailed).await;
            }
        }
    }

    async fn on_vad(&mut self, event: Option<VadEvent>) {
        match event {
            Some(VadEvent::SpeechStarted) => {
                let turn_id = self.current_turn_id();
                info!("Speech started (turn {})", turn_id);
                self.emit(TurnEvent::SpeechStarted { turn_id });
            }
            Some(VadEvent::Endpoint { silence }) => {
                info!(
                    "End of utterance after {}ms of silence (turn {})",
                    silence.as_millis(),
                    self.current_turn_id()
                );
                self.finish_utterance().await;
            }
            None => {}
        }
    }

    async fn on_capture_closed(&mut self) {
        if self.vad.speech_started() {
            warn!("Capture stream closed mid-utterance, submitting what was heard");
            self.vad.reset();
            self.finish_utterance().await;
        } else {
            warn!("Capture stream closed while waiting for speech");
            self.emit(TurnEvent::CaptureFailed {
                error: crate::audio::CaptureError::Backend("capture stream closed".to_string()),
            });
            self.teardown(EndReason::CaptureFailed).await;
        }
    }

    /// LISTENING → PROCESSING. The microphone is released before the pipeline runs.
    async fn finish_utterance(&mut self) {
        let Some(audio) = self.capture.stop(true).await else {
            warn!("Endpoint without an active capture");
            return;
        };

        let turn_id = self.current_turn_id();
        if let Some(turn) = self.turn.as_mut() {
            turn.captured_ms = audio.duration_ms();
        }
        self.transition(TurnState::Processing);

        let service = Arc::clone(&self.service);
        let completions = self.completions_tx.clone();
        let session_id = self.config.session_id.clone();

        self.pipeline_task = Some(tokio::spawn(async move {
            let result = service.submit_turn(&session_id, audio).await;
            let _ = completions.send(Completion::Pipeline { turn_id, result });
        }));
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Pipeline { turn_id, result } => {
                if !self.is_current(turn_id, TurnState::Processing) {
                    debug!("Discarding late pipeline result for turn {}", turn_id);
                    return;
                }
                self.pipeline_task = None;

                match result {
                    Ok(response) => self.on_response(turn_id, response).await,
                    Err(e) => self.on_turn_failed(turn_id, e).await,
                }
            }
            Completion::Playback { turn_id, outcome } => {
                if !self.is_current(turn_id, TurnState::AiSpeaking) {
                    debug!("Discarding late playback completion for turn {}", turn_id);
                    return;
                }
                self.playback_task = None;

                self.emit(TurnEvent::PlaybackFinished { turn_id, outcome });
                self.resolve_turn().await;
            }
        }
    }

    async fn on_response(&mut self, turn_id: u64, response: TurnResponse) {
        self.stats.turns_completed += 1;

        self.emit(TurnEvent::Exchange {
            turn_id,
            user_text: response.user_message.content.clone(),
            reply_text: response.ai_message.content.clone(),
            feedback: response.user_message.feedback.clone().unwrap_or_default(),
            has_audio: response.audio_payload.is_some(),
            ended: response.ended,
        });

        if let Some(turn) = self.turn.as_mut() {
            turn.transcript = Some(response.user_message.content);
            turn.reply_text = Some(response.ai_message.content);
            turn.audio = response.audio_payload.clone();
            turn.ended = response.ended;
        }

        match response.audio_payload {
            Some(audio) => {
                self.transition(TurnState::AiSpeaking);

                let playback = Arc::clone(&self.playback);
                let completions = self.completions_tx.clone();

                self.playback_task = Some(tokio::spawn(async move {
                    let outcome = playback.play_once(Some(&audio)).await;
                    let _ = completions.send(Completion::Playback { turn_id, outcome });
                }));
            }
            None => {
                debug!("Reply has no audio, skipping playback");
                self.resolve_turn().await;
            }
        }
    }

    /// A failed turn never stays in PROCESSING: substitute a reply and move on,
    /// unless the session itself is closed, which ends the conversation.
    async fn on_turn_failed(&mut self, turn_id: u64, e: anyhow::Error) {
        if session_closed(&e) {
            error!("Turn {} rejected, session is closed: {:#}", turn_id, e);
            self.emit(TurnEvent::TransportFailed {
                turn_id,
                message: format!("{:#}", e),
            });
            self.teardown(EndReason::SessionClosed).await;
            return;
        }

        warn!("Turn {} failed, continuing with local reply: {:#}", turn_id, e);
        self.stats.fallback_replies += 1;

        let text = self.config.fallback_reply.clone();
        if let Some(turn) = self.turn.as_mut() {
            turn.errored = true;
            turn.reply_text = Some(text.clone());
        }

        self.emit(TurnEvent::TransportFailed {
            turn_id,
            message: format!("{:#}", e),
        });
        self.emit(TurnEvent::LocalReply { turn_id, text });

        self.resolve_turn().await;
    }

    async fn resolve_turn(&mut self) {
        let ended = match self.turn.take() {
            Some(mut turn) => {
                turn.state = self.state;
                let ended = turn.ended;
                self.emit(TurnEvent::TurnResolved { turn });
                ended
            }
            None => false,
        };

        if ended {
            self.teardown(EndReason::ConversationFinished).await;
        } else {
            self.start_listening().await;
        }
    }

    /// Cancel everything local and enter ENDED.
    ///
    /// Order: silence timer, microphone, playback, then the torn-down flag so
    /// that any pipeline result arriving afterwards is dropped. A submitted
    /// turn is left to finish on the server so it is persisted whole.
    async fn teardown(&mut self, reason: EndReason) {
        if self.state == TurnState::Ended {
            return;
        }

        info!(
            "Tearing down conversation {} in {:?} ({:?})",
            self.config.session_id, self.state, reason
        );

        self.vad.reset();
        self.capture.stop(false).await;

        if let Some(task) = self.playback_task.take() {
            task.abort();
            let _ = task.await;
        }

        self.torn_down = true;

        if self.pipeline_task.take().is_some() {
            debug!("Detaching submitted turn, its result will be discarded");
        }

        self.turn = None;
        self.stats.end_reason = Some(reason);
        self.transition(TurnState::Ended);
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }

        self.state = to;
        if to != TurnState::Listening {
            self.level_tx.send_replace(0.0);
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.state = to;
        }

        info!("Turn state {:?} → {:?}", from, to);
        self.state_tx.send_replace(to);
        self.emit(TurnEvent::StateChanged { from, to });
    }

    fn is_current(&self, turn_id: u64, expected: TurnState) -> bool {
        !self.torn_down && self.state == expected && self.current_turn_id() == turn_id
    }

    fn current_turn_id(&self) -> u64 {
        self.turn.as_ref().map(|t| t.id).unwrap_or(0)
    }

    fn emit(&self, event: TurnEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
