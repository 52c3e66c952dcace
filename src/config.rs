use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::postprocess::PostProcessSettings;

/// Errors raised when a configuration document is malformed or inconsistent.
///
/// A rejected document never tears the application down: at startup it aborts
/// before any component is built, and on a runtime reload the last-good
/// configuration stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be parsed as TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two actions share the same key combination
    #[error("actions '{first}' and '{second}' are both bound to '{binding}'")]
    ConflictingBindings {
        /// First action using the combination
        first: &'static str,
        /// Second action using the combination
        second: &'static str,
        /// The shared key combination
        binding: String,
    },

    /// A binding string could not be parsed into modifiers + key
    #[error("invalid binding for '{action}': {reason}")]
    InvalidBinding {
        /// Action whose binding is malformed
        action: &'static str,
        /// Parser diagnostic
        reason: String,
    },

    /// Minimum recording duration is not below the maximum
    #[error(
        "audio.min_record_ms ({min_ms} ms) must be below audio.max_record_secs ({max_secs} s)"
    )]
    InvalidDurations {
        /// Configured minimum in milliseconds
        min_ms: u64,
        /// Configured maximum in seconds
        max_secs: u64,
    },
}

/// Whisper model sizes resolvable to local `ggml-*.bin` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    /// Smallest and fastest model
    Tiny,
    /// Default model, reasonable latency/accuracy balance
    Base,
    /// Small model
    Small,
    /// Medium model
    Medium,
    /// Largest and most accurate model
    Large,
}

impl ModelSize {
    /// Lowercase name as used in config files and download URLs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// Filename of the ggml weights for this size
    #[must_use]
    pub fn filename(self) -> String {
        format!("ggml-{}.bin", self.as_str())
    }
}

/// Inference device selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Probe for an accelerator, fall back to CPU if unavailable
    #[default]
    Auto,
    /// Require the accelerator; loading fails without one
    Gpu,
    /// CPU only (also forced by the `--cpu` command-line flag)
    Cpu,
}

/// Top-level application configuration.
///
/// Persisted as TOML under the user config directory and rewritten in full on
/// every settings change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model selection and inference parameters
    pub model: ModelConfig,
    /// Global hotkey bindings
    pub hotkeys: HotkeyBindings,
    /// Recording duration bounds
    pub audio: AudioConfig,
    /// Transcript post-processing settings
    pub postprocess: PostProcessSettings,
    /// Output delivery settings
    pub output: OutputConfig,
    /// Session WAV retention settings
    pub recordings: RecordingsConfig,
    /// Log file settings
    pub telemetry: TelemetryConfig,
}

/// Model selection and inference parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Named model size, resolved to a local ggml file at startup
    pub size: ModelSize,
    /// Language code passed to the model (`None` = auto-detect)
    pub language: Option<String>,
    /// Accelerator policy
    pub device: DevicePreference,
    /// CPU threads for inference
    pub threads: usize,
    /// Beam search width (1 = greedy)
    pub beam_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            size: ModelSize::Base,
            language: Some("en".to_owned()),
            device: DevicePreference::Auto,
            threads: 4,
            beam_size: 5,
        }
    }
}

/// Key combinations for the four logical actions.
///
/// Bindings use the `"modifier+key"` form, e.g. `"alt+r"` or
/// `"ctrl+shift+space"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyBindings {
    /// Start or stop a recording session
    pub toggle_recording: String,
    /// Replay the most recent session through the transcriber
    pub transcribe_last: String,
    /// Open the config file in the desktop editor
    pub open_settings: String,
    /// Exit the application
    pub quit: String,
}

impl Default for HotkeyBindings {
    fn default() -> Self {
        Self {
            toggle_recording: "alt+r".to_owned(),
            transcribe_last: "alt+t".to_owned(),
            open_settings: "alt+c".to_owned(),
            quit: "alt+q".to_owned(),
        }
    }
}

impl HotkeyBindings {
    /// Action-name/binding pairs, in a fixed order
    #[must_use]
    pub fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("toggle_recording", self.toggle_recording.as_str()),
            ("transcribe_last", self.transcribe_last.as_str()),
            ("open_settings", self.open_settings.as_str()),
            ("quit", self.quit.as_str()),
        ]
    }
}

/// Recording duration bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Recordings shorter than this are discarded without transcription
    pub min_record_ms: u64,
    /// Recording is force-stopped after this many seconds (0 disables)
    pub max_record_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            min_record_ms: 250,
            max_record_secs: 600,
        }
    }
}

/// Output delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Send a synthetic Ctrl+V to the focused window after copying
    pub inject_paste: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { inject_paste: true }
    }
}

/// Retention policy for per-session WAV files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingsConfig {
    /// Persist each finalized session as a WAV file
    pub keep_recordings: bool,
    /// Delete recordings older than this many days (0 disables)
    pub retention_days: u32,
    /// Keep at most this many recordings (0 disables)
    pub max_count: usize,
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            keep_recordings: false,
            retention_days: 7,
            max_count: 50,
        }
    }
}

/// Log file settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Write logs to `log_path` instead of stdout
    pub enabled: bool,
    /// Log file location (`~` expands to the home directory)
    pub log_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.local/state/whispertrigger/whispertrigger.log".to_owned(),
        }
    }
}

impl Config {
    /// Load the config file, creating a default one on first run.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn load_or_init() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            let default = Self::default();
            default
                .save(&path)
                .context("failed to create default config")?;
            tracing::info!(path = %path.display(), "created default config");
        }

        Self::load(&path)
    }

    /// Load and validate an existing config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    /// Load a changed config file, keeping `current` in effect when the new
    /// document cannot be read, parsed, or validated.
    #[must_use]
    pub fn reload(path: &Path, current: &Self) -> Self {
        match Self::load(path) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("config reload rejected, keeping current settings: {}", e);
                current.clone()
            }
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on parse failure or semantic conflicts.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rewrite the config file in full.
    ///
    /// # Errors
    /// Returns error if serialization or the filesystem write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Check semantic invariants: parseable bindings, no two actions on the
    /// same combination, sane duration bounds.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let entries = self.hotkeys.entries();

        for (action, binding) in entries {
            if let Err(e) = crate::input::hotkey::parse_binding(binding) {
                return Err(ConfigError::InvalidBinding {
                    action,
                    reason: e.to_string(),
                });
            }
        }

        for (i, (first, a)) in entries.iter().copied().enumerate() {
            for (second, b) in entries.iter().copied().skip(i + 1) {
                if normalize_binding(a) == normalize_binding(b) {
                    return Err(ConfigError::ConflictingBindings {
                        first,
                        second,
                        binding: a.to_owned(),
                    });
                }
            }
        }

        if self.audio.max_record_secs > 0
            && self.audio.min_record_ms >= self.audio.max_record_secs.saturating_mul(1000)
        {
            return Err(ConfigError::InvalidDurations {
                min_ms: self.audio.min_record_ms,
                max_secs: self.audio.max_record_secs,
            });
        }

        Ok(())
    }

    /// Path of the config file (`$XDG_CONFIG_HOME/whispertrigger/config.toml`)
    ///
    /// # Errors
    /// Returns error if no home directory can be determined.
    pub fn config_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("config.toml"))
    }

    /// Expand a leading `~/` to the home directory
    ///
    /// # Errors
    /// Returns error if `HOME` is not set.
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

/// Canonical form of a binding for conflict comparison: modifiers lowercased
/// and sorted, aliases unified, key lowercased.
fn normalize_binding(binding: &str) -> String {
    let mut parts: Vec<String> = binding
        .split('+')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .map(|p| match p.as_str() {
            "control" => "ctrl".to_owned(),
            "option" => "alt".to_owned(),
            "command" | "win" => "super".to_owned(),
            _ => p,
        })
        .collect();
    parts.sort();
    parts.join("+")
}

/// Per-user config directory (`$XDG_CONFIG_HOME/whispertrigger`)
///
/// # Errors
/// Returns error if neither `XDG_CONFIG_HOME` nor `HOME` is set.
pub fn config_dir() -> Result<PathBuf> {
    let base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(base.join("whispertrigger"))
}

/// Per-user data directory (`$XDG_DATA_HOME/whispertrigger`), holds model
/// weights and kept recordings
///
/// # Errors
/// Returns error if neither `XDG_DATA_HOME` nor `HOME` is set.
pub fn data_dir() -> Result<PathBuf> {
    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".local").join("share")
        }
    };
    Ok(base.join("whispertrigger"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_conflicting_bindings_rejected() {
        let mut config = Config::default();
        config.hotkeys.transcribe_last = config.hotkeys.toggle_recording.clone();

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ConflictingBindings {
                first: "toggle_recording",
                second: "transcribe_last",
                ..
            }
        ));
    }

    #[test]
    fn test_conflict_detection_normalizes_spelling() {
        let mut config = Config::default();
        config.hotkeys.toggle_recording = "Ctrl+Shift+R".to_owned();
        config.hotkeys.quit = "shift + control + r".to_owned();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingBindings { .. })
        ));
    }

    #[test]
    fn test_malformed_binding_rejected() {
        let mut config = Config::default();
        config.hotkeys.quit = "alt+".to_owned();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBinding { action: "quit", .. })
        ));
    }

    #[test]
    fn test_unknown_model_size_rejected() {
        let doc = "[model]\nsize = \"enormous\"\n";
        assert!(matches!(Config::from_toml(doc), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_min_duration_must_be_below_max() {
        let mut config = Config::default();
        config.audio.min_record_ms = 10_000;
        config.audio.max_record_secs = 5;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDurations { .. })
        ));
    }

    #[test]
    fn test_extreme_max_duration_does_not_overflow() {
        let mut config = Config::default();
        config.audio.max_record_secs = u64::MAX;
        config.audio.min_record_ms = 1000;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_duration_disables_bound_check() {
        let mut config = Config::default();
        config.audio.min_record_ms = 10_000;
        config.audio.max_record_secs = 0;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_size_filename() {
        assert_eq!(ModelSize::Tiny.filename(), "ggml-tiny.bin");
        assert_eq!(ModelSize::Large.filename(), "ggml-large.bin");
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").unwrap();
        let result = Config::expand_path("~/models/x.bin").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/x.bin"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let result = Config::expand_path("/var/tmp/x.bin").unwrap();
        assert_eq!(result, PathBuf::from("/var/tmp/x.bin"));
    }

    fn reload_test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "whispertrigger_{name}_{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_reload_keeps_current_on_malformed_document() {
        let dir = reload_test_dir("reload_malformed");
        let path = dir.join("config.toml");
        fs::write(&path, "model = [not toml").unwrap();

        let mut current = Config::default();
        current.model.size = ModelSize::Small;

        assert_eq!(Config::reload(&path, &current), current);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reload_keeps_current_on_conflicting_bindings() {
        let dir = reload_test_dir("reload_conflict");
        let path = dir.join("config.toml");
        fs::write(
            &path,
            "[hotkeys]\ntoggle_recording = \"alt+r\"\nquit = \"alt+r\"\n",
        )
        .unwrap();

        let current = Config::default();
        assert_eq!(Config::reload(&path, &current), current);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reload_keeps_current_on_missing_file() {
        let path = std::env::temp_dir().join("whispertrigger_no_such_config.toml");
        let current = Config::default();
        assert_eq!(Config::reload(&path, &current), current);
    }

    #[test]
    fn test_reload_accepts_valid_document() {
        let dir = reload_test_dir("reload_valid");
        let path = dir.join("config.toml");

        let mut next = Config::default();
        next.hotkeys.quit = "ctrl+alt+q".to_owned();
        next.save(&path).unwrap();

        let current = Config::default();
        let reloaded = Config::reload(&path, &current);
        assert_eq!(reloaded, next);
        assert_ne!(reloaded, current);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!(
            "whispertrigger_config_test_{}",
            std::process::id()
        ));
        let path = dir.join("config.toml");
        let mut config = Config::default();
        config.model.size = ModelSize::Small;
        config.hotkeys.quit = "ctrl+alt+q".to_owned();

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(config, loaded);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
