/// Model download and management
pub mod download;
/// Whisper model inference engine
pub mod engine;
/// Dedicated transcription thread and its channel protocol
pub mod worker;

pub use download::resolve_model;
pub use engine::{ModelError, SpeechModel, TranscriptionEngine};
pub use worker::{TranscriptionWorker, WorkerCommand, WorkerEvent};
