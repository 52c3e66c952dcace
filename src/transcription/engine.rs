use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::DevicePreference;

/// Errors from model loading and inference.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Failed to load Whisper model
    #[error("failed to load whisper model from {path}: {reason}")]
    Load {
        /// Path to model file
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Failed to create Whisper inference state
    #[error("failed to create whisper state")]
    StateCreation,

    /// Transcription inference failed
    #[error("whisper inference failed: {0}")]
    Inference(String),
}

/// Speech-to-text seam used by the transcription worker.
///
/// Production code uses [`TranscriptionEngine`]; tests substitute a
/// `MockSpeechModel` (via `mockall`).
#[cfg_attr(test, mockall::automock)]
pub trait SpeechModel: Send {
    /// Transcribe 16 kHz mono samples to text.
    ///
    /// # Errors
    /// Returns [`ModelError`] if inference fails on every configured device.
    fn transcribe(&mut self, samples: &[f32]) -> Result<String, ModelError>;
}

/// Device-level inference seam, split out so the CPU fallback policy in
/// [`TranscriptionEngine`] is testable without model weights.
#[cfg_attr(test, mockall::automock)]
trait InferenceBackend: Send {
    /// Run one inference pass on the current device
    fn run(&mut self, samples: &[f32]) -> Result<String, ModelError>;
    /// Reload the model CPU-only; subsequent runs stay on CPU
    fn reload_cpu(&mut self) -> Result<(), ModelError>;
    /// Whether the accelerator is currently in use
    fn gpu_active(&self) -> bool;
}

/// whisper-rs backed inference on either the accelerator or CPU.
struct WhisperBackend {
    ctx: WhisperContext,
    model_path: PathBuf,
    threads: i32,
    beam_size: i32,
    language: Option<String>,
    gpu: bool,
}

// SAFETY: WhisperBackend is owned exclusively by the transcription worker
// thread; the context is never accessed from more than one thread at a time.
#[allow(unsafe_code)]
unsafe impl Send for WhisperBackend {}

impl WhisperBackend {
    fn load(
        model_path: &Path,
        threads: i32,
        beam_size: i32,
        language: Option<String>,
        device: DevicePreference,
    ) -> Result<Self, ModelError> {
        let (ctx, gpu) = match device {
            DevicePreference::Cpu => (load_context(model_path, false)?, false),
            DevicePreference::Gpu => (load_context(model_path, true)?, true),
            DevicePreference::Auto => match load_context(model_path, true) {
                Ok(ctx) => (ctx, true),
                Err(e) => {
                    warn!("accelerator load failed, falling back to CPU: {}", e);
                    (load_context(model_path, false)?, false)
                }
            },
        };

        info!(
            path = %model_path.display(),
            gpu,
            threads,
            beam_size,
            language = ?language,
            "whisper model loaded"
        );

        Ok(Self {
            ctx,
            model_path: model_path.to_path_buf(),
            threads,
            beam_size,
            language,
            gpu,
        })
    }
}

fn load_context(model_path: &Path, use_gpu: bool) -> Result<WhisperContext, ModelError> {
    let path_str = model_path.to_str().ok_or_else(|| ModelError::Load {
        path: model_path.display().to_string(),
        reason: "model path contains invalid UTF-8".to_owned(),
    })?;

    let mut params = WhisperContextParameters::default();
    params.use_gpu(use_gpu);

    WhisperContext::new_with_params(path_str, params).map_err(|e| ModelError::Load {
        path: model_path.display().to_string(),
        reason: format!("{e:?}"),
    })
}

impl InferenceBackend for WhisperBackend {
    fn run(&mut self, samples: &[f32]) -> Result<String, ModelError> {
        let _span = tracing::debug_span!("inference", samples = samples.len()).entered();

        let mut state = self
            .ctx
            .create_state()
            .map_err(|_| ModelError::StateCreation)?;

        let strategy = sampling_strategy(self.beam_size);
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(self.language.as_deref());
        params.set_translate(false);

        let start = std::time::Instant::now();
        state
            .full(params, samples)
            .map_err(|e| ModelError::Inference(format!("{e:?}")))?;
        let inference_duration = start.elapsed();

        let mut result = String::new();
        for segment in state.as_iter() {
            result.push_str(&segment.to_string());
        }
        let result = result.trim().to_owned();

        info!(
            segments = state.full_n_segments(),
            text_len = result.len(),
            inference_ms = inference_duration.as_millis(),
            gpu = self.gpu,
            "transcription completed"
        );

        Ok(result)
    }

    fn reload_cpu(&mut self) -> Result<(), ModelError> {
        self.ctx = load_context(&self.model_path, false)?;
        self.gpu = false;
        info!("model reloaded on CPU");
        Ok(())
    }

    fn gpu_active(&self) -> bool {
        self.gpu
    }
}

/// Determines sampling strategy based on beam size (pure, testable)
const fn sampling_strategy(beam_size: i32) -> SamplingStrategy {
    if beam_size > 1 {
        SamplingStrategy::BeamSearch {
            beam_size,
            patience: -1.0,
        }
    } else {
        SamplingStrategy::Greedy { best_of: 1 }
    }
}

/// Whisper transcription engine with single-shot CPU fallback.
///
/// If an inference pass fails while the accelerator is active, the model is
/// reloaded CPU-only and that request is retried exactly once; later requests
/// stay on CPU.
pub struct TranscriptionEngine {
    backend: Box<dyn InferenceBackend>,
}

impl TranscriptionEngine {
    /// Load the model at `model_path` according to the device policy.
    ///
    /// # Errors
    /// Returns error if the model file is missing or invalid, if parameters
    /// are out of range, or if `device` is `Gpu` and the accelerator load
    /// fails.
    pub fn new(
        model_path: &Path,
        threads: usize,
        beam_size: usize,
        language: Option<String>,
        device: DevicePreference,
    ) -> Result<Self, ModelError> {
        if threads == 0 {
            return Err(ModelError::Load {
                path: model_path.display().to_string(),
                reason: "threads must be > 0".to_owned(),
            });
        }
        if beam_size == 0 {
            return Err(ModelError::Load {
                path: model_path.display().to_string(),
                reason: "beam_size must be > 0".to_owned(),
            });
        }

        // whisper-rs takes i32 for both
        let threads_i32 = i32::try_from(threads).map_err(|_| ModelError::Load {
            path: model_path.display().to_string(),
            reason: format!("threads value too large (max: {})", i32::MAX),
        })?;
        let beam_size_i32 = i32::try_from(beam_size).map_err(|_| ModelError::Load {
            path: model_path.display().to_string(),
            reason: format!("beam_size value too large (max: {})", i32::MAX),
        })?;

        let backend = WhisperBackend::load(model_path, threads_i32, beam_size_i32, language, device)?;

        Ok(Self {
            backend: Box::new(backend),
        })
    }
}

impl SpeechModel for TranscriptionEngine {
    fn transcribe(&mut self, samples: &[f32]) -> Result<String, ModelError> {
        match self.backend.run(samples) {
            Ok(text) => Ok(text),
            Err(e) if self.backend.gpu_active() => {
                warn!("accelerator inference failed, retrying on CPU: {}", e);
                self.backend.reload_cpu()?;
                self.backend.run(samples)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(backend: MockInferenceBackend) -> TranscriptionEngine {
        TranscriptionEngine {
            backend: Box::new(backend),
        }
    }

    #[test]
    fn test_model_load_nonexistent_path() {
        let nonexistent_path = Path::new("/tmp/nonexistent_model.bin");
        let result = TranscriptionEngine::new(
            nonexistent_path,
            4,
            5,
            None,
            DevicePreference::Cpu,
        );

        assert!(matches!(result, Err(ModelError::Load { .. })));
        if let Err(ModelError::Load { path, .. }) = result {
            assert!(path.contains("nonexistent_model.bin"));
        }
    }

    #[test]
    fn test_new_with_zero_threads() {
        let path = Path::new("/tmp/dummy.bin");
        let result = TranscriptionEngine::new(path, 0, 5, None, DevicePreference::Cpu);
        assert!(matches!(
            result,
            Err(ModelError::Load { reason, .. }) if reason.contains("threads must be > 0")
        ));
    }

    #[test]
    fn test_new_with_zero_beam_size() {
        let path = Path::new("/tmp/dummy.bin");
        let result = TranscriptionEngine::new(path, 4, 0, None, DevicePreference::Cpu);
        assert!(matches!(
            result,
            Err(ModelError::Load { reason, .. }) if reason.contains("beam_size must be > 0")
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_thread_count_overflow() {
        let path = Path::new("/tmp/dummy.bin");
        let result = TranscriptionEngine::new(
            path,
            (i32::MAX as usize) + 1,
            5,
            None,
            DevicePreference::Cpu,
        );
        assert!(matches!(
            result,
            Err(ModelError::Load { reason, .. }) if reason.contains("threads value too large")
        ));
    }

    #[test]
    fn test_accelerator_failure_retries_on_cpu_exactly_once() {
        let mut backend = MockInferenceBackend::new();
        let mut seq = mockall::Sequence::new();

        backend
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ModelError::Inference("device lost".to_owned())));
        backend.expect_gpu_active().return_const(true);
        backend
            .expect_reload_cpu()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        backend
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("hello".to_owned()));

        let mut engine = engine_with(backend);
        let text = engine.transcribe(&[0.0; 16000]).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_cpu_failure_does_not_retry() {
        let mut backend = MockInferenceBackend::new();
        backend
            .expect_run()
            .times(1)
            .returning(|_| Err(ModelError::Inference("oom".to_owned())));
        backend.expect_gpu_active().return_const(false);
        backend.expect_reload_cpu().times(0);

        let mut engine = engine_with(backend);
        assert!(matches!(
            engine.transcribe(&[0.0; 16000]),
            Err(ModelError::Inference(_))
        ));
    }

    #[test]
    fn test_fallback_failure_surfaces_error() {
        let mut backend = MockInferenceBackend::new();
        let mut seq = mockall::Sequence::new();

        backend
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ModelError::Inference("device lost".to_owned())));
        backend.expect_gpu_active().return_const(true);
        backend
            .expect_reload_cpu()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        backend
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ModelError::Inference("still failing".to_owned())));

        let mut engine = engine_with(backend);
        assert!(engine.transcribe(&[0.0; 16000]).is_err());
    }

    #[test]
    fn test_successful_run_never_reloads() {
        let mut backend = MockInferenceBackend::new();
        backend
            .expect_run()
            .times(1)
            .returning(|_| Ok("text".to_owned()));
        backend.expect_reload_cpu().times(0);

        let mut engine = engine_with(backend);
        assert_eq!(engine.transcribe(&[0.0; 8000]).unwrap(), "text");
    }

    #[test]
    fn test_engine_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<TranscriptionEngine>();
    }

    #[test]
    fn test_sampling_strategy_greedy() {
        let strategy = sampling_strategy(1);
        assert!(matches!(strategy, SamplingStrategy::Greedy { best_of: 1 }));
    }

    #[test]
    fn test_sampling_strategy_beam_search() {
        let strategy = sampling_strategy(5);
        assert!(matches!(
            strategy,
            SamplingStrategy::BeamSearch {
                beam_size: 5,
                patience: -1.0
            }
        ));
    }

    #[test]
    fn test_sampling_strategy_boundary() {
        assert!(matches!(sampling_strategy(1), SamplingStrategy::Greedy { .. }));
        assert!(matches!(
            sampling_strategy(2),
            SamplingStrategy::BeamSearch { .. }
        ));
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_transcribe_silence() {
        let home = std::env::var("HOME").unwrap();
        let model_path = PathBuf::from(home)
            .join(".local/share/whispertrigger/models")
            .join("ggml-tiny.bin");
        if !model_path.exists() {
            return;
        }

        let mut engine =
            TranscriptionEngine::new(&model_path, 4, 5, None, DevicePreference::Cpu).unwrap();

        // 1 second of silence (16kHz)
        let silence: Vec<f32> = vec![0.0; 16000];
        let text = engine.transcribe(&silence).unwrap();
        assert!(text.is_empty() || text.len() < 50);
    }
}
