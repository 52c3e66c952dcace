//! WhisperTrigger - hotkey-driven speech-to-text for the Linux desktop
//!
//! This library exports core modules for testing and potential future reuse.

/// Recording state machine and event loop controller
pub mod app;
/// Audio capture and processing
pub mod audio;
/// Configuration management
pub mod config;
/// Input handling (global hotkeys)
pub mod input;
/// Clipboard and keystroke output delivery
pub mod output;
/// Transcript post-processing modes
pub mod postprocess;
/// Session WAV persistence and retention
pub mod recordings;
/// Telemetry and crash logging
pub mod telemetry;
/// Whisper transcription engine
pub mod transcription;
