use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::postprocess::{PostProcessSettings, PostProcessor, ProcessingMode};
use crate::transcription::engine::{ModelError, SpeechModel};

/// One finalized recording session handed to the worker. Consumed exactly
/// once; the worker retains the samples for replay.
pub struct TranscriptionRequest {
    /// 16 kHz mono samples
    pub samples: Vec<f32>,
    /// Session length, for logging
    pub duration_secs: f32,
}

/// Commands accepted by the worker thread.
pub enum WorkerCommand {
    /// Transcribe a newly finalized session
    Transcribe(TranscriptionRequest),
    /// Re-run transcription on the most recent session's samples
    RetranscribeLast,
    /// Swap post-processing settings (config reload)
    UpdateSettings(PostProcessSettings),
    /// Exit the worker loop
    Shutdown,
}

/// A completed transcription, raw and post-processed.
pub struct TranscriptionOutcome {
    /// Verbatim model output
    pub raw_text: String,
    /// Text after the active processing mode
    pub final_text: String,
    /// Mode that produced `final_text`
    pub mode: ProcessingMode,
    /// Model inference time
    pub inference_ms: u128,
    /// Post-processing time (zero for deterministic modes on empty text)
    pub postprocess_ms: u128,
}

/// Events delivered back to the main loop.
pub enum WorkerEvent {
    /// Transcription finished; `final_text` may be empty for silent audio
    Completed(TranscriptionOutcome),
    /// Inference failed on every configured device
    Failed(ModelError),
}

/// Dedicated transcription thread.
///
/// Owns the speech model and the post-processor so inference and LLM calls
/// never run on the event loop. Requests are processed strictly in order, one
/// at a time; results come back over a channel.
pub struct TranscriptionWorker {
    commands: Sender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    handle: Option<JoinHandle<()>>,
}

impl TranscriptionWorker {
    /// Spawn the worker thread.
    #[must_use]
    pub fn spawn(
        model: Box<dyn SpeechModel>,
        processor: PostProcessor,
        settings: PostProcessSettings,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("transcription".to_owned())
            .spawn(move || run_loop(model, &processor, settings, &command_rx, &event_tx));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!("failed to spawn transcription worker: {}", e);
                None
            }
        };

        Self {
            commands: command_tx,
            events: event_rx,
            handle,
        }
    }

    /// A cloneable command sender for the controller.
    #[must_use]
    pub fn sender(&self) -> Sender<WorkerCommand> {
        self.commands.clone()
    }

    /// Non-blocking poll for the next event.
    #[must_use]
    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    /// Blocking poll with a deadline, used by tests and shutdown drains.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("transcription worker panicked during shutdown");
            }
        }
    }
}

impl Drop for TranscriptionWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    mut model: Box<dyn SpeechModel>,
    processor: &PostProcessor,
    mut settings: PostProcessSettings,
    commands: &Receiver<WorkerCommand>,
    events: &Sender<WorkerEvent>,
) {
    // Last finalized session, kept for idempotent replay
    let mut last: Option<Arc<Vec<f32>>> = None;

    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Transcribe(request) => {
                info!(
                    samples = request.samples.len(),
                    duration_secs = request.duration_secs,
                    "transcription request received"
                );
                let samples = Arc::new(request.samples);
                last = Some(Arc::clone(&samples));
                process_request(model.as_mut(), processor, &settings, &samples, events);
            }
            WorkerCommand::RetranscribeLast => match &last {
                Some(samples) => {
                    info!(samples = samples.len(), "replaying last session");
                    process_request(model.as_mut(), processor, &settings, samples, events);
                }
                None => warn!("no previous session to retranscribe"),
            },
            WorkerCommand::UpdateSettings(new_settings) => {
                settings = new_settings;
                info!(mode = ?settings.mode, "post-processing settings updated");
            }
            WorkerCommand::Shutdown => break,
        }
    }
}

fn process_request(
    model: &mut dyn SpeechModel,
    processor: &PostProcessor,
    settings: &PostProcessSettings,
    samples: &[f32],
    events: &Sender<WorkerEvent>,
) {
    let inference_start = Instant::now();
    let raw_text = match model.transcribe(samples) {
        Ok(text) => text,
        Err(e) => {
            error!("transcription failed: {}", e);
            let _ = events.send(WorkerEvent::Failed(e));
            return;
        }
    };
    let inference_ms = inference_start.elapsed().as_millis();

    let postprocess_start = Instant::now();
    let final_text = if raw_text.trim().is_empty() {
        String::new()
    } else {
        processor.apply(settings, &raw_text)
    };
    let postprocess_ms = postprocess_start.elapsed().as_millis();

    let outcome = TranscriptionOutcome {
        raw_text,
        final_text,
        mode: settings.mode,
        inference_ms,
        postprocess_ms,
    };
    if events.send(WorkerEvent::Completed(outcome)).is_err() {
        warn!("event channel closed, discarding transcription result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::MockRewriteBackend;
    use crate::transcription::engine::MockSpeechModel;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn cleaned_settings() -> PostProcessSettings {
        PostProcessSettings {
            mode: ProcessingMode::Cleaned,
            ..PostProcessSettings::default()
        }
    }

    fn no_llm_processor() -> PostProcessor {
        let mut backend = MockRewriteBackend::new();
        backend.expect_rewrite().times(0);
        PostProcessor::new(Box::new(backend))
    }

    fn request(samples: Vec<f32>) -> TranscriptionRequest {
        #[allow(clippy::cast_precision_loss)]
        let duration_secs = samples.len() as f32 / 16000.0;
        TranscriptionRequest {
            samples,
            duration_secs,
        }
    }

    #[test]
    fn test_request_consumed_exactly_once() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok("hello there".to_owned()));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        worker
            .sender()
            .send(WorkerCommand::Transcribe(request(vec![0.0; 16000])))
            .unwrap();

        let event = worker.recv_timeout(TIMEOUT).unwrap();
        match event {
            WorkerEvent::Completed(outcome) => {
                assert_eq!(outcome.raw_text, "hello there");
                assert_eq!(outcome.final_text, "Hello there.");
                assert_eq!(outcome.mode, ProcessingMode::Cleaned);
            }
            WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }

        worker.shutdown();
    }

    #[test]
    fn test_retranscribe_last_is_idempotent() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .withf(|samples| samples.len() == 16000)
            .times(3)
            .returning(|_| Ok("same words".to_owned()));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        let commands = worker.sender();
        commands
            .send(WorkerCommand::Transcribe(request(vec![0.0; 16000])))
            .unwrap();
        commands.send(WorkerCommand::RetranscribeLast).unwrap();
        commands.send(WorkerCommand::RetranscribeLast).unwrap();

        let mut texts = Vec::new();
        for _ in 0..3 {
            match worker.recv_timeout(TIMEOUT).unwrap() {
                WorkerEvent::Completed(outcome) => texts.push(outcome.final_text),
                WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(texts, vec!["Same words."; 3]);

        worker.shutdown();
    }

    #[test]
    fn test_retranscribe_without_session_emits_nothing() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok("first".to_owned()));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        let commands = worker.sender();

        // Replay with no prior session, then a real request; the first event
        // must be the real request's result
        commands.send(WorkerCommand::RetranscribeLast).unwrap();
        commands
            .send(WorkerCommand::Transcribe(request(vec![0.0; 16000])))
            .unwrap();

        match worker.recv_timeout(TIMEOUT).unwrap() {
            WorkerEvent::Completed(outcome) => assert_eq!(outcome.raw_text, "first"),
            WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }
        assert!(worker.try_recv().is_none());

        worker.shutdown();
    }

    #[test]
    fn test_model_failure_emits_failed_event() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .times(1)
            .returning(|_| Err(ModelError::Inference("boom".to_owned())));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        worker
            .sender()
            .send(WorkerCommand::Transcribe(request(vec![0.0; 8000])))
            .unwrap();

        assert!(matches!(
            worker.recv_timeout(TIMEOUT),
            Some(WorkerEvent::Failed(ModelError::Inference(_)))
        ));

        worker.shutdown();
    }

    #[test]
    fn test_empty_transcript_completes_with_empty_text() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok("  ".to_owned()));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        worker
            .sender()
            .send(WorkerCommand::Transcribe(request(vec![0.0; 16000])))
            .unwrap();

        match worker.recv_timeout(TIMEOUT).unwrap() {
            WorkerEvent::Completed(outcome) => assert!(outcome.final_text.is_empty()),
            WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }

        worker.shutdown();
    }

    #[test]
    fn test_settings_update_changes_mode() {
        let mut model = MockSpeechModel::new();
        model
            .expect_transcribe()
            .times(2)
            .returning(|_| Ok("some text".to_owned()));

        let worker =
            TranscriptionWorker::spawn(Box::new(model), no_llm_processor(), cleaned_settings());
        let commands = worker.sender();

        commands
            .send(WorkerCommand::Transcribe(request(vec![0.0; 16000])))
            .unwrap();
        commands
            .send(WorkerCommand::UpdateSettings(PostProcessSettings {
                mode: ProcessingMode::Raw,
                ..PostProcessSettings::default()
            }))
            .unwrap();
        commands.send(WorkerCommand::RetranscribeLast).unwrap();

        match worker.recv_timeout(TIMEOUT).unwrap() {
            WorkerEvent::Completed(outcome) => {
                assert_eq!(outcome.final_text, "Some text.");
                assert_eq!(outcome.mode, ProcessingMode::Cleaned);
            }
            WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }
        match worker.recv_timeout(TIMEOUT).unwrap() {
            WorkerEvent::Completed(outcome) => {
                assert_eq!(outcome.final_text, "some text");
                assert_eq!(outcome.mode, ProcessingMode::Raw);
            }
            WorkerEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }

        worker.shutdown();
    }
}
