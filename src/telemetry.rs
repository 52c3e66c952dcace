use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, TelemetryConfig};

/// Initialize telemetry logging
///
/// Logs go to stdout by default; with `telemetry.enabled` they append to the
/// configured file instead. `RUST_LOG` overrides the default `info` filter.
///
/// # Errors
/// Returns error if the log directory or file cannot be created.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !config.enabled {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return Ok(());
    }

    let expanded_path = Config::expand_path(&config.log_path)?;

    // Create parent directory if needed
    if let Some(parent) = expanded_path.parent() {
        fs::create_dir_all(parent).context("failed to create log directory")?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&expanded_path)
        .context("failed to open log file")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file)
        .with_target(false)
        .with_ansi(false)
        .init();

    tracing::info!("telemetry initialized: {}", expanded_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_log_path_expands() {
        let config = TelemetryConfig::default();
        let expanded = Config::expand_path(&config.log_path).unwrap();
        assert!(!expanded.to_string_lossy().contains('~'));
        assert!(expanded.ends_with("whispertrigger.log"));
    }

    #[test]
    fn test_absolute_log_path_unchanged() {
        let result = Config::expand_path("/var/log/app.log").unwrap();
        assert_eq!(result, PathBuf::from("/var/log/app.log"));
    }

    #[test]
    #[ignore] // Global tracing subscriber can only be initialized once per process
    fn test_init_with_telemetry_enabled() {
        let dir = std::env::temp_dir().join("whispertrigger_telemetry_test");
        let log_path = dir.join("app.log");
        let config = TelemetryConfig {
            enabled: true,
            log_path: log_path.to_string_lossy().into_owned(),
        };

        init(&config).unwrap();
        assert!(log_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
