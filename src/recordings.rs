use anyhow::{Context, Result};
use hound::{WavSpec, WavWriter};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::audio::capture::TARGET_SAMPLE_RATE;
use crate::config::{self, RecordingsConfig};

/// Directory holding kept session recordings
///
/// # Errors
/// Returns error if no home directory can be determined.
pub fn recordings_dir() -> Result<PathBuf> {
    Ok(config::data_dir()?.join("recordings"))
}

/// Persist a finalized session as `recording_<unix_ts>.wav` (16 kHz mono f32).
///
/// # Errors
/// Returns error if directory creation or the file write fails.
pub fn save_session_wav(dir: &Path, samples: &[f32]) -> Result<PathBuf> {
    fs::create_dir_all(dir).context("failed to create recordings directory")?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("failed to get current time")?
        .as_secs();
    let path = dir.join(format!("recording_{timestamp}.wav"));

    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = WavWriter::create(&path, spec).context("failed to create WAV file")?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .context("failed to write sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;

    tracing::info!(
        path = %path.display(),
        samples = samples.len(),
        "session recording saved"
    );
    Ok(path)
}

/// Clean up old recordings based on retention policy
///
/// Deletes recordings older than `retention_days` OR beyond `max_count` limit.
/// Returns the number of files deleted.
///
/// # Errors
/// Returns error if directory listing fails. Individual file deletion failures are logged but don't stop cleanup.
pub fn cleanup_old_recordings(dir: &Path, config: &RecordingsConfig) -> Result<usize> {
    // If directory doesn't exist, nothing to clean
    if !dir.exists() {
        tracing::debug!("recordings directory does not exist, skipping cleanup");
        return Ok(0);
    }

    // Collect all recording files with their timestamps
    let mut recordings: Vec<(PathBuf, u64)> = fs::read_dir(dir)
        .context("failed to read recordings directory")?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }

            let filename = path.file_name()?.to_str()?;
            if !filename.starts_with("recording_")
                || !path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
            {
                return None;
            }

            // Extract timestamp from filename: recording_{timestamp}.wav
            let timestamp_str = filename.strip_prefix("recording_")?.strip_suffix(".wav")?;
            let timestamp: u64 = timestamp_str.parse().ok()?;

            Some((path, timestamp))
        })
        .collect();

    if recordings.is_empty() {
        tracing::debug!("no recordings found, skipping cleanup");
        return Ok(0);
    }

    // Sort by timestamp (newest first)
    recordings.sort_by(|a, b| b.1.cmp(&a.1));

    let mut to_delete = HashSet::new();

    // Apply age-based retention
    if config.retention_days > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("failed to get current time")?
            .as_secs();
        let retention_secs = u64::from(config.retention_days) * 24 * 60 * 60;

        for (path, timestamp) in &recordings {
            if now.saturating_sub(*timestamp) > retention_secs {
                to_delete.insert(path.clone());
            }
        }
    }

    // Apply count-based retention
    if config.max_count > 0 && recordings.len() > config.max_count {
        for (path, _) in recordings.iter().skip(config.max_count) {
            to_delete.insert(path.clone());
        }
    }

    // Delete files
    let mut deleted_count = 0;
    for path in to_delete {
        match fs::remove_file(&path) {
            Ok(()) => {
                deleted_count += 1;
                tracing::debug!("deleted recording: {}", path.display());
            }
            Err(e) => {
                tracing::warn!("failed to delete {}: {}", path.display(), e);
            }
        }
    }

    if deleted_count > 0 {
        tracing::debug!(
            "cleanup complete: deleted {} recordings (total: {}, remaining: {})",
            deleted_count,
            recordings.len(),
            recordings.len() - deleted_count
        );
    }

    Ok(deleted_count)
}
