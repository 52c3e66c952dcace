/// Microphone capture into a lock-free ring buffer
pub mod capture;

pub use capture::{AudioCapture, CaptureSource, DeviceError};
