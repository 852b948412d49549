//! Energy-based voice activity detection
//!
//! The detector consumes one mean-amplitude level per captured frame and
//! turns the stream into two discrete events:
//! - `SpeechStarted` the first time a level rises above the volume threshold
//! - `Endpoint` once levels stayed at or below the threshold for the whole
//!   silence window after speech
//!
//! Pure silence never produces an endpoint. Time is passed in by the caller so
//! the countdown can be driven by frames or by a timer armed at
//! [`VoiceActivityDetector::silence_deadline`].

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::VadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    /// End of utterance; carries how long the closing silence lasted
    Endpoint { silence: Duration },
}

pub struct VoiceActivityDetector {
    volume_threshold: f32,
    silence_threshold: Duration,
    speech_started: bool,
    silence_since: Option<Instant>,
    window: VecDeque<f32>,
    window_size: usize,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        let window_size = config.level_window.max(1);
        Self {
            volume_threshold: config.volume_threshold,
            silence_threshold: Duration::from_millis(config.silence_threshold_ms),
            speech_started: false,
            silence_since: None,
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub fn speech_started(&self) -> bool {
        self.speech_started
    }

    /// When the pending silence countdown elapses, if one is running
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_since.map(|since| since + self.silence_threshold)
    }

    /// Mean of the recent levels, for metering only
    pub fn level(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    /// Feed one level sample taken at `now`
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<VadEvent> {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(level);

        if level > self.volume_threshold {
            self.silence_since = None;
            if !self.speech_started {
                self.speech_started = true;
                debug!("Speech started (level {:.1})", level);
                return Some(VadEvent::SpeechStarted);
            }
            return None;
        }

        if !self.speech_started {
            return None;
        }

        self.silence_since.get_or_insert(now);
        self.poll(now)
    }

    /// Check the silence countdown without a new sample
    pub fn poll(&mut self, now: Instant) -> Option<VadEvent> {
        let since = self.silence_since?;
        let silence = now.saturating_duration_since(since);

        if silence < self.silence_threshold {
            return None;
        }

        debug!("Endpoint after {}ms of silence", silence.as_millis());
        self.reset();
        Some(VadEvent::Endpoint { silence })
    }

    /// Forget speech state and cancel any pending countdown
    pub fn reset(&mut self) {
        self.speech_started = false;
        self.silence_since = None;
        self.window.clear();
    }
}
