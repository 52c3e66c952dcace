use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

const FORMATTING_INSTRUCTIONS: &str = "Process the transcribed text as follows:\n\n1. Capitalize the first letter of each sentence\n2. Add proper punctuation\n3. Format lists and paragraphs\n4. Do not change the content or meaning";
const NOTES_INSTRUCTIONS: &str = "Process the transcribed text as follows:\n\n1. Format as meeting notes\n2. Add bullet points for key items\n3. Organize into sections if multiple topics are discussed\n4. Highlight action items and decisions";
const EMAIL_INSTRUCTIONS: &str = "Process the transcribed text as follows:\n\n1. Format as a professional email\n2. Add appropriate greeting and closing\n3. Organize content into clear paragraphs\n4. Maintain a professional tone";
const CODE_INSTRUCTIONS: &str = "Process the transcribed text as follows:\n\n1. Format as code or technical documentation\n2. Preserve code syntax and structure\n3. Use proper technical terminology\n4. Format variable names and functions correctly";

/// How a raw transcript is reshaped before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Verbatim transcript, no processing at all
    Raw,
    /// Deterministic cleanup: trim, sentence capital, terminal period
    #[default]
    Cleaned,
    /// LLM rewrite for capitalization, punctuation, and paragraphs
    Formatting,
    /// LLM rewrite into meeting notes with bullet points
    Notes,
    /// LLM rewrite into a professional email
    Email,
    /// LLM rewrite into code or technical documentation
    Code,
    /// LLM rewrite following the user's `instruction_text`
    Custom,
}

impl ProcessingMode {
    /// Whether this mode calls the language model endpoint
    #[must_use]
    pub const fn uses_llm(self) -> bool {
        !matches!(self, Self::Raw | Self::Cleaned)
    }

    /// Built-in rewrite instructions; `None` for deterministic modes and for
    /// `Custom`, which reads `instruction_text` from settings instead.
    #[must_use]
    pub const fn instructions(self) -> Option<&'static str> {
        match self {
            Self::Raw | Self::Cleaned | Self::Custom => None,
            Self::Formatting => Some(FORMATTING_INSTRUCTIONS),
            Self::Notes => Some(NOTES_INSTRUCTIONS),
            Self::Email => Some(EMAIL_INSTRUCTIONS),
            Self::Code => Some(CODE_INSTRUCTIONS),
        }
    }
}

/// OpenAI-compatible chat endpoint settings for LLM-backed modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Endpoint base URL, e.g. a local server or a hosted API
    pub base_url: String,
    /// Model name passed through to the endpoint
    pub model: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
    /// Whole-request timeout
    pub timeout_secs: u64,
    /// Transcript truncation bound in characters (0 disables)
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_owned(),
            model: "llama3".to_owned(),
            api_key: None,
            timeout_secs: 30,
            max_input_chars: 6000,
        }
    }
}

/// Transcript post-processing settings, persisted in the config file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessSettings {
    /// Active processing mode
    pub mode: ProcessingMode,
    /// Instructions used by [`ProcessingMode::Custom`]
    pub instruction_text: String,
    /// LLM endpoint settings
    pub llm: LlmConfig,
}

/// Errors from the LLM rewrite path. Always handled non-fatally: the raw
/// transcript is delivered instead.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// Request could not be built or sent, or timed out
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("llm endpoint returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },

    /// Response parsed but carried no message content
    #[error("llm response missing content")]
    MissingContent,
}

/// Seam over the chat endpoint so mode logic is testable without a server.
#[cfg_attr(test, mockall::automock)]
pub trait RewriteBackend: Send {
    /// Rewrite `transcript` according to `instructions`.
    ///
    /// # Errors
    /// Returns [`RewriteError`] on any transport, status, or shape failure.
    fn rewrite(
        &self,
        instructions: &str,
        transcript: &str,
        config: &LlmConfig,
    ) -> Result<String, RewriteError>;
}

#[derive(Serialize)]
struct ChatCompletionPayload<'a> {
    model: &'a str,
    messages: Vec<ChatMessagePayload<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessagePayload<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Blocking reqwest client against an OpenAI-compatible `chat/completions`
/// endpoint.
pub struct ChatCompletionClient;

impl RewriteBackend for ChatCompletionClient {
    fn rewrite(
        &self,
        instructions: &str,
        transcript: &str,
        config: &LlmConfig,
    ) -> Result<String, RewriteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let payload = ChatCompletionPayload {
            model: &config.model,
            messages: vec![
                ChatMessagePayload {
                    role: "system",
                    content: instructions,
                },
                ChatMessagePayload {
                    role: "user",
                    content: transcript,
                },
            ],
            temperature: 0.2,
        };

        let url = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        );

        let start = std::time::Instant::now();
        let mut request = client.post(&url).json(&payload);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(RewriteError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: ChatCompletionResponse = response.json()?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or(RewriteError::MissingContent)?;

        info!(
            latency_ms = start.elapsed().as_millis(),
            output_len = content.len(),
            "llm rewrite completed"
        );

        Ok(content.trim().to_owned())
    }
}

/// Applies the active processing mode to raw transcripts.
///
/// Owned by the transcription worker so LLM calls never block the event loop.
pub struct PostProcessor {
    backend: Box<dyn RewriteBackend>,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new(Box::new(ChatCompletionClient))
    }
}

impl PostProcessor {
    /// Create a processor over the given rewrite backend.
    #[must_use]
    pub fn new(backend: Box<dyn RewriteBackend>) -> Self {
        Self { backend }
    }

    /// Apply the configured mode. Never fails: LLM errors fall back to the
    /// raw transcript with a warning.
    #[must_use]
    pub fn apply(&self, settings: &PostProcessSettings, raw: &str) -> String {
        match settings.mode {
            ProcessingMode::Raw => raw.to_owned(),
            ProcessingMode::Cleaned => clean_transcript(raw),
            mode => {
                let instructions = match mode.instructions() {
                    Some(text) => text,
                    None => settings.instruction_text.as_str(),
                };
                if instructions.trim().is_empty() {
                    warn!(?mode, "no instructions configured, using cleaned text");
                    return clean_transcript(raw);
                }
                self.rewrite_or_fallback(instructions, raw, settings)
            }
        }
    }

    fn rewrite_or_fallback(
        &self,
        instructions: &str,
        raw: &str,
        settings: &PostProcessSettings,
    ) -> String {
        let (prepared, truncated) = truncate_chars(raw.trim(), settings.llm.max_input_chars);
        if truncated {
            debug!(
                max_chars = settings.llm.max_input_chars,
                "transcript truncated for llm input"
            );
        }
        if prepared.is_empty() {
            return String::new();
        }

        match self.backend.rewrite(instructions, &prepared, &settings.llm) {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                warn!("llm returned empty rewrite, delivering raw transcript");
                raw.trim().to_owned()
            }
            Err(e) => {
                warn!(mode = ?settings.mode, "llm rewrite failed, delivering raw transcript: {}", e);
                raw.trim().to_owned()
            }
        }
    }
}

/// Deterministic cleanup: trim, capitalize the first letter, and close with a
/// period when no terminal punctuation is present.
#[must_use]
pub fn clean_transcript(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut chars = trimmed.chars();
    let mut result = match chars.next() {
        Some(first) => {
            let mut s = String::with_capacity(trimmed.len() + 1);
            s.extend(first.to_uppercase());
            s.push_str(chars.as_str());
            s
        }
        None => String::new(),
    };

    if !result.ends_with(['.', '!', '?']) {
        result.push('.');
    }
    result
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return (text.to_owned(), false);
    }
    (text.chars().take(max_chars).collect(), true)
}
