use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::capture::{CaptureSource, TARGET_SAMPLE_RATE};
use crate::config::{AudioConfig, RecordingsConfig};
use crate::input::HotkeyAction;
use crate::output::TextSink;
use crate::recordings;
use crate::transcription::worker::{TranscriptionRequest, WorkerCommand, WorkerEvent};

/// Events the controller reacts to. All business logic lives behind this
/// dispatch; hotkey callbacks and channel reads only produce events.
pub enum AppEvent {
    /// A registered hotkey fired
    Hotkey(HotkeyAction),
    /// The transcription worker reported a result
    Worker(WorkerEvent),
    /// Periodic timer, drives the max-duration bound
    Tick,
}

/// Recording session state. At most one session is ever open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No open session
    Idle,
    /// Microphone is live
    Recording {
        /// Session start, for the max-duration bound
        started_at: Instant,
    },
}

/// The recording state machine: Idle → Recording → (finalize) → Idle.
///
/// Finalizing hands the buffer to the worker and returns immediately; the
/// controller never blocks on inference or output delivery.
pub struct Controller {
    capture: Box<dyn CaptureSource>,
    commands: Sender<WorkerCommand>,
    sink: Box<dyn TextSink>,
    state: SessionState,
    min_duration: Duration,
    max_duration: Option<Duration>,
    recordings_dir: Option<PathBuf>,
}

impl Controller {
    /// Build the controller over its capture, worker, and output seams.
    #[must_use]
    pub fn new(
        capture: Box<dyn CaptureSource>,
        commands: Sender<WorkerCommand>,
        sink: Box<dyn TextSink>,
        audio: &AudioConfig,
        recordings_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            capture,
            commands,
            sink,
            state: SessionState::Idle,
            min_duration: Duration::from_millis(audio.min_record_ms),
            max_duration: max_duration(audio),
            recordings_dir,
        }
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Dispatch one event.
    pub fn handle(&mut self, event: AppEvent) {
        match event {
            AppEvent::Hotkey(HotkeyAction::ToggleRecording) => self.toggle_recording(),
            AppEvent::Hotkey(HotkeyAction::TranscribeLast) => self.transcribe_last(),
            AppEvent::Hotkey(action) => debug!(?action, "hotkey handled outside controller"),
            AppEvent::Worker(worker_event) => self.handle_worker_event(worker_event),
            AppEvent::Tick => self.tick(),
        }
    }

    /// Apply reloaded duration and retention settings.
    pub fn apply_config(&mut self, audio: &AudioConfig, recordings: &RecordingsConfig) {
        self.min_duration = Duration::from_millis(audio.min_record_ms);
        self.max_duration = max_duration(audio);
        self.recordings_dir = if recordings.keep_recordings {
            recordings::recordings_dir().ok()
        } else {
            None
        };
    }

    fn toggle_recording(&mut self) {
        match self.state {
            SessionState::Idle => match self.capture.start() {
                Ok(()) => {
                    info!("recording session started");
                    self.state = SessionState::Recording {
                        started_at: Instant::now(),
                    };
                }
                Err(e) => {
                    // Stay Idle; the user can retry once the device is back
                    warn!("could not open audio device: {}", e);
                }
            },
            SessionState::Recording { .. } => self.finalize(),
        }
    }

    fn finalize(&mut self) {
        self.state = SessionState::Idle;

        let samples = match self.capture.stop() {
            Ok(samples) => samples,
            Err(e) => {
                warn!("failed to close capture session: {}", e);
                return;
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let duration_secs = samples.len() as f32 / TARGET_SAMPLE_RATE as f32;
        let duration = Duration::from_secs_f32(duration_secs);

        if duration < self.min_duration {
            info!(
                duration_ms = duration.as_millis(),
                min_ms = self.min_duration.as_millis(),
                "recording too short, discarded"
            );
            return;
        }

        if let Some(dir) = &self.recordings_dir {
            if let Err(e) = recordings::save_session_wav(dir, &samples) {
                warn!("failed to save session recording: {}", e);
            }
        }

        info!(duration_secs, "session finalized, queueing transcription");
        let request = TranscriptionRequest {
            samples,
            duration_secs,
        };
        if self.commands.send(WorkerCommand::Transcribe(request)).is_err() {
            error!("transcription worker is gone, dropping session");
        }
    }

    fn transcribe_last(&self) {
        if self.commands.send(WorkerCommand::RetranscribeLast).is_err() {
            error!("transcription worker is gone");
        }
    }

    fn tick(&mut self) {
        if let SessionState::Recording { started_at } = self.state {
            if let Some(max) = self.max_duration {
                if started_at.elapsed() >= max {
                    warn!(
                        max_secs = max.as_secs(),
                        "max recording duration reached, finalizing"
                    );
                    self.finalize();
                }
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed(outcome) => {
                if outcome.final_text.is_empty() {
                    info!("no speech detected, nothing to deliver");
                    return;
                }
                info!(
                    mode = ?outcome.mode,
                    chars = outcome.final_text.len(),
                    inference_ms = outcome.inference_ms,
                    postprocess_ms = outcome.postprocess_ms,
                    "delivering transcript"
                );
                if let Err(e) = self.sink.deliver(&outcome.final_text) {
                    // Clipboard already holds the text; only injection failed
                    warn!("paste injection failed, clipboard only: {}", e);
                }
            }
            WorkerEvent::Failed(e) => {
                error!("transcription failed: {}", e);
            }
        }
    }
}

fn max_duration(audio: &AudioConfig) -> Option<Duration> {
    if audio.max_record_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(audio.max_record_secs))
    }
}
