use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from keystroke injection. Clipboard delivery has already happened
/// (or been warned about) by the time these surface, so callers degrade to
/// clipboard-only.
#[derive(Debug, Error)]
pub enum InjectionError {
    /// No injection tool matches the running display server
    #[error("no paste injection tool available for this session")]
    NoBackend,

    /// Tool binary missing or not executable
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        /// Tool that failed to start
        tool: &'static str,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Tool ran but exited nonzero
    #[error("{tool} exited with status {status:?}")]
    CommandFailed {
        /// Tool that failed
        tool: &'static str,
        /// Exit code, if the process was not killed by a signal
        status: Option<i32>,
    },
}

/// Destination for finalized transcripts.
#[cfg_attr(test, mockall::automock)]
pub trait TextSink: Send {
    /// Deliver text to the user: clipboard always, keystrokes optionally.
    ///
    /// # Errors
    /// Returns [`InjectionError`] only for the keystroke stage; the text has
    /// been retained and the clipboard attempted regardless.
    fn deliver(&mut self, text: &str) -> Result<(), InjectionError>;
}

/// Display server in use, detected from the session environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayServer {
    Wayland,
    X11,
    Unknown,
}

fn detect_display_server() -> DisplayServer {
    if std::env::var("WAYLAND_DISPLAY").is_ok()
        || std::env::var("XDG_SESSION_TYPE").unwrap_or_default() == "wayland"
    {
        DisplayServer::Wayland
    } else if std::env::var("DISPLAY").is_ok() {
        DisplayServer::X11
    } else {
        DisplayServer::Unknown
    }
}

/// Clipboard tools to try, in order, for a display server.
const fn clipboard_tools(server: DisplayServer) -> &'static [(&'static str, &'static [&'static str])] {
    match server {
        DisplayServer::Wayland => &[("wl-copy", &[]), ("xclip", &["-selection", "clipboard"])],
        DisplayServer::X11 | DisplayServer::Unknown => {
            &[("xclip", &["-selection", "clipboard"])]
        }
    }
}

/// Ctrl+V injection tool for a display server, if one exists.
const fn paste_tool(server: DisplayServer) -> Option<(&'static str, &'static [&'static str])> {
    match server {
        DisplayServer::Wayland => Some(("wtype", &["-M", "ctrl", "-k", "v", "-m", "ctrl"])),
        DisplayServer::X11 => Some(("xdotool", &["key", "ctrl+v"])),
        DisplayServer::Unknown => None,
    }
}

fn pipe_to_command(
    tool: &'static str,
    args: &[&str],
    input: &str,
) -> Result<(), InjectionError> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| InjectionError::Spawn { tool, source })?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(input.as_bytes())
            .map_err(|source| InjectionError::Spawn { tool, source })?;
    }
    drop(child.stdin.take());

    let status = child
        .wait()
        .map_err(|source| InjectionError::Spawn { tool, source })?;
    if !status.success() {
        return Err(InjectionError::CommandFailed {
            tool,
            status: status.code(),
        });
    }
    Ok(())
}

fn run_command(tool: &'static str, args: &[&str]) -> Result<(), InjectionError> {
    let status = Command::new(tool)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| InjectionError::Spawn { tool, source })?;
    if !status.success() {
        return Err(InjectionError::CommandFailed {
            tool,
            status: status.code(),
        });
    }
    Ok(())
}

fn copy_to_clipboard(server: DisplayServer, text: &str) -> Result<(), InjectionError> {
    let mut last_err = InjectionError::NoBackend;
    for (tool, args) in clipboard_tools(server) {
        match pipe_to_command(tool, args, text) {
            Ok(()) => {
                debug!(tool, "text copied to clipboard");
                return Ok(());
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn inject_paste(server: DisplayServer) -> Result<(), InjectionError> {
    let (tool, args) = paste_tool(server).ok_or(InjectionError::NoBackend)?;
    run_command(tool, args)?;
    debug!(tool, "paste keystroke sent");
    Ok(())
}

/// Clipboard-plus-keystroke delivery using the session's native tools.
///
/// The last delivered text is retained in memory so no completed
/// transcription is lost to an output failure.
pub struct SystemOutput {
    /// Shared with the config reload path, which may flip it at runtime
    inject_paste: Arc<AtomicBool>,
    last_text: Option<String>,
}

impl SystemOutput {
    /// Create a sink. `inject_paste` enables the Ctrl+V stage.
    #[must_use]
    pub const fn new(inject_paste: Arc<AtomicBool>) -> Self {
        Self {
            inject_paste,
            last_text: None,
        }
    }

    /// Most recently delivered text, if any.
    #[must_use]
    pub fn last_text(&self) -> Option<&str> {
        self.last_text.as_deref()
    }
}

impl TextSink for SystemOutput {
    fn deliver(&mut self, text: &str) -> Result<(), InjectionError> {
        // Retain before any external step can fail
        self.last_text = Some(text.to_owned());

        let server = detect_display_server();
        match copy_to_clipboard(server, text) {
            Ok(()) => info!(chars = text.len(), "transcript copied to clipboard"),
            Err(e) => warn!("clipboard copy failed, text retained in memory: {}", e),
        }

        if self.inject_paste.load(Ordering::Relaxed) {
            inject_paste(server)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_to_command_success() {
        // cat consumes stdin and exits zero
        assert!(pipe_to_command("cat", &[], "hello").is_ok());
    }

    #[test]
    fn test_pipe_to_missing_tool_fails() {
        let result = pipe_to_command("definitely-not-a-real-tool", &[], "hello");
        assert!(matches!(result, Err(InjectionError::Spawn { .. })));
    }

    #[test]
    fn test_run_command_nonzero_exit() {
        let result = run_command("false", &[]);
        assert!(matches!(
            result,
            Err(InjectionError::CommandFailed { status: Some(1), .. })
        ));
    }

    #[test]
    fn test_paste_tool_per_server() {
        assert_eq!(paste_tool(DisplayServer::Wayland).map(|(t, _)| t), Some("wtype"));
        assert_eq!(paste_tool(DisplayServer::X11).map(|(t, _)| t), Some("xdotool"));
        assert!(paste_tool(DisplayServer::Unknown).is_none());
    }

    #[test]
    fn test_wayland_falls_back_to_xclip() {
        let tools = clipboard_tools(DisplayServer::Wayland);
        assert_eq!(tools[0].0, "wl-copy");
        assert_eq!(tools[1].0, "xclip");
    }

    #[test]
    fn test_last_text_retained_even_when_delivery_fails() {
        let mut sink = SystemOutput::new(Arc::new(AtomicBool::new(false)));
        // Delivery may fail in a headless environment; text must be kept
        let _ = sink.deliver("remember me");
        assert_eq!(sink.last_text(), Some("remember me"));
    }

    #[test]
    fn test_inject_paste_without_display_fails_with_no_backend() {
        let result = inject_paste(DisplayServer::Unknown);
        assert!(matches!(result, Err(InjectionError::NoBackend)));
    }
}
