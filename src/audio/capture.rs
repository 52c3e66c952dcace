use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapRb,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Target format for everything downstream of capture
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Errors from the microphone capture path.
///
/// All variants are non-fatal: the caller stays Idle and the user can retry.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No default input device on this system
    #[error("no audio input device available")]
    NoDevice,

    /// Device refused to report its default stream config
    #[error("failed to query input device config: {0}")]
    Configure(#[from] cpal::DefaultStreamConfigError),

    /// Input stream could not be created
    #[error("failed to build input stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    /// Input stream could not be started
    #[error("failed to start input stream: {0}")]
    Start(#[from] cpal::PlayStreamError),

    /// `start` called while a session is already open
    #[error("recording already in progress")]
    AlreadyRecording,

    /// `stop` called with no open session
    #[error("no recording in progress")]
    NotRecording,
}

/// Source of finalized 16 kHz mono sample buffers.
///
/// The production implementation is [`AudioCapture`]; tests substitute mocks.
#[cfg_attr(test, mockall::automock)]
pub trait CaptureSource {
    /// Open the microphone and begin capturing.
    ///
    /// # Errors
    /// Returns [`DeviceError`] if the device is unavailable; no session is
    /// opened in that case.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop capturing and return the session's samples as 16 kHz mono.
    ///
    /// # Errors
    /// Returns [`DeviceError::NotRecording`] if no session is open.
    fn stop(&mut self) -> Result<Vec<f32>, DeviceError>;
}

/// Trait for controlling audio stream lifecycle
trait StreamControl {
    /// Resume audio stream (activate microphone)
    fn play(&self) -> Result<(), DeviceError>;
    /// Pause audio stream (deactivate microphone)
    fn pause(&self) -> Result<(), DeviceError>;
}

/// CPAL stream wrapper implementing `StreamControl`
struct CpalStreamControl {
    stream: cpal::Stream,
}

impl StreamControl for CpalStreamControl {
    fn play(&self) -> Result<(), DeviceError> {
        self.stream.play()?;
        Ok(())
    }

    fn pause(&self) -> Result<(), DeviceError> {
        if let Err(e) = self.stream.pause() {
            warn!("failed to pause audio stream: {}", e);
        }
        Ok(())
    }
}

/// One open capture session: live stream plus its ring buffer consumer.
struct CaptureSession {
    /// Kept alive so the stream is not dropped mid-session
    stream_control: Box<dyn StreamControl>,
    consumer: HeapCons<f32>,
    is_recording: Arc<AtomicBool>,
    device_sample_rate: u32,
    device_channels: u16,
}

/// Microphone capture via CPAL.
///
/// The device is opened fresh for every session in `start` and released in
/// `stop`, so a missing or busy microphone surfaces as a per-session
/// [`DeviceError`] rather than a startup failure.
pub struct AudioCapture {
    session: Option<CaptureSession>,
    /// Ring buffer sizing bound, in seconds of device-rate audio
    buffer_secs: u64,
}

impl AudioCapture {
    /// Create an idle capture handle. `max_record_secs` bounds the ring
    /// buffer size (0 means the 600 s ceiling).
    #[must_use]
    pub const fn new(max_record_secs: u64) -> Self {
        let buffer_secs = if max_record_secs == 0 || max_record_secs > 600 {
            600
        } else {
            max_record_secs
        };
        Self {
            session: None,
            buffer_secs,
        }
    }

    fn open_session(&self) -> Result<CaptureSession, DeviceError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());
        let supported_config = device.default_input_config()?;

        let device_sample_rate = supported_config.sample_rate();
        let device_channels = supported_config.channels();

        info!(
            device = %device_name,
            sample_rate = device_sample_rate,
            channels = device_channels,
            "opening input device"
        );

        // Sized for the full session so the callback never drops samples
        let ring_buffer_capacity = (device_sample_rate as usize)
            * (device_channels as usize)
            * (self.buffer_secs as usize);
        let ring_buffer = HeapRb::<f32>::new(ring_buffer_capacity);
        let (mut producer, consumer) = ring_buffer.split();

        let is_recording = Arc::new(AtomicBool::new(false));
        let is_recording_cb = Arc::clone(&is_recording);

        let stream_config = supported_config.into();
        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if is_recording_cb.load(Ordering::Relaxed) {
                    // Lock-free push to ring buffer
                    let pushed = producer.push_slice(data);
                    if pushed < data.len() {
                        warn!("ring buffer full, dropped {} samples", data.len() - pushed);
                    }
                }
            },
            move |err| {
                warn!("audio stream error: {}", err);
            },
            None,
        )?;

        Ok(CaptureSession {
            stream_control: Box::new(CpalStreamControl { stream }),
            consumer,
            is_recording,
            device_sample_rate,
            device_channels,
        })
    }
}

impl CaptureSource for AudioCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        let _span = tracing::debug_span!("start_recording").entered();
        if self.session.is_some() {
            return Err(DeviceError::AlreadyRecording);
        }

        let start = std::time::Instant::now();
        let session = self.open_session()?;

        // Set the flag before starting the stream so no callback races it
        session.is_recording.store(true, Ordering::Relaxed);
        session.stream_control.play()?;

        self.session = Some(session);
        info!(
            latency_us = start.elapsed().as_micros(),
            "recording started"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<f32>, DeviceError> {
        let _span = tracing::debug_span!("stop_recording").entered();
        let mut session = self.session.take().ok_or(DeviceError::NotRecording)?;

        session.is_recording.store(false, Ordering::Relaxed);
        session.stream_control.pause()?;

        let start_drain = std::time::Instant::now();
        let mut samples = Vec::new();
        while let Some(sample) = session.consumer.try_pop() {
            samples.push(sample);
        }
        info!(
            samples = samples.len(),
            drain_us = start_drain.elapsed().as_micros(),
            "ring buffer drained"
        );

        let mono = downmix_to_mono(&samples, session.device_channels);
        let converted = resample_linear(&mono, session.device_sample_rate, TARGET_SAMPLE_RATE);

        debug!(output_samples = converted.len(), "capture session closed");
        Ok(converted)
    }
}

/// Average interleaved frames down to a single channel.
#[must_use]
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels_f64 = f64::from(channels);
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum_f64: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            // f64 → f32: audio samples are stored as f32, precision sufficient
            #[allow(clippy::cast_possible_truncation)]
            {
                (sum_f64 / channels_f64) as f32
            }
        })
        .collect()
}

/// Linear-interpolation resampling between arbitrary sample rates.
#[must_use]
pub fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    // Algorithm requires f64 ↔ usize conversions for fractional index calculations
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    {
        let start = std::time::Instant::now();
        let ratio = f64::from(src_rate) / f64::from(dst_rate);

        let output_len_f64 = (samples.len() as f64) / ratio;
        let output_len = if output_len_f64.is_finite() && output_len_f64 >= 0.0 {
            output_len_f64.ceil() as usize
        } else {
            samples.len()
        };

        let mut resampled = Vec::with_capacity(output_len);
        for i in 0..output_len {
            let src_idx_f64 = (i as f64) * ratio;

            // Floor gives integer part, safe because src_idx >= 0
            let src_idx_floor = if src_idx_f64 >= 0.0 && src_idx_f64 < (usize::MAX as f64) {
                src_idx_f64.floor() as usize
            } else {
                0
            };

            let src_idx_ceil = (src_idx_floor + 1).min(samples.len().saturating_sub(1));
            let fract = src_idx_f64 - src_idx_f64.floor();

            let sample = if src_idx_floor < samples.len() {
                let s1 = f64::from(samples[src_idx_floor]);
                let s2 = f64::from(samples[src_idx_ceil]);
                let interpolated = s1.mul_add(1.0 - fract, s2 * fract);
                interpolated as f32
            } else {
                0.0_f32
            };

            resampled.push(sample);
        }

        debug!(
            src_rate,
            dst_rate,
            input_samples = samples.len(),
            output_samples = resampled.len(),
            resample_us = start.elapsed().as_micros(),
            "resampling completed"
        );

        resampled
    }
}
