use anyhow::{anyhow, Context, Result};
use global_hotkey::{
    hotkey::{Code, HotKey, Modifiers},
    GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState,
};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::HotkeyBindings;

/// Logical actions triggerable by a global hotkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    /// Start or stop a recording session
    ToggleRecording,
    /// Replay the most recent session through the transcriber
    TranscribeLast,
    /// Open the config file in the desktop editor
    OpenSettings,
    /// Exit the application
    Quit,
}

/// Registration backend, split out so rebind rollback is testable without a
/// display connection.
trait HotkeyRegistry {
    fn register(&self, hotkey: HotKey) -> Result<()>;
    fn unregister(&self, hotkey: HotKey) -> Result<()>;
}

impl HotkeyRegistry for GlobalHotKeyManager {
    fn register(&self, hotkey: HotKey) -> Result<()> {
        GlobalHotKeyManager::register(self, hotkey).context("hotkey registration refused")
    }

    fn unregister(&self, hotkey: HotKey) -> Result<()> {
        GlobalHotKeyManager::unregister(self, hotkey).context("hotkey unregistration refused")
    }
}

/// Global hotkey registration for the four application actions.
///
/// Bindings can be swapped at runtime with [`HotkeyManager::rebind`], which
/// unregisters the old set and registers the new one; the change takes effect
/// without a restart.
pub struct HotkeyManager {
    registry: Box<dyn HotkeyRegistry>,
    registered: Vec<HotKey>,
    actions: HashMap<u32, HotkeyAction>,
    bindings: HotkeyBindings,
}

impl HotkeyManager {
    /// Create the manager and register all configured bindings.
    ///
    /// # Errors
    /// Returns error if the platform hotkey backend is unavailable, a binding
    /// cannot be parsed, or registration is refused.
    pub fn new(bindings: &HotkeyBindings) -> Result<Self> {
        let manager = GlobalHotKeyManager::new().context("failed to create hotkey manager")?;
        Self::with_registry(Box::new(manager), bindings)
    }

    fn with_registry(registry: Box<dyn HotkeyRegistry>, bindings: &HotkeyBindings) -> Result<Self> {
        let mut this = Self {
            registry,
            registered: Vec::new(),
            actions: HashMap::new(),
            bindings: bindings.clone(),
        };
        this.register_all(bindings)?;
        Ok(this)
    }

    /// Replace the active bindings with a new set.
    ///
    /// The old set is unregistered first. If the new set is refused partway
    /// through, the partial set is torn down and the old bindings are
    /// re-registered, so the previously working hotkeys stay live.
    ///
    /// # Errors
    /// Returns error if parsing or registration of the new set fails; the old
    /// set remains in effect.
    pub fn rebind(&mut self, bindings: &HotkeyBindings) -> Result<()> {
        self.unregister_all();
        if let Err(e) = self.register_all(bindings) {
            self.unregister_all();
            let previous = self.bindings.clone();
            if let Err(restore) = self.register_all(&previous) {
                tracing::error!("failed to restore previous hotkeys: {}", restore);
            }
            return Err(e);
        }
        self.bindings = bindings.clone();
        info!("hotkey bindings updated");
        Ok(())
    }

    /// Map a hotkey event to its action, if any. Only key-down events fire.
    #[must_use]
    pub fn resolve(&self, event: &GlobalHotKeyEvent) -> Option<HotkeyAction> {
        if event.state != HotKeyState::Pressed {
            return None;
        }
        let action = self.actions.get(&event.id).copied();
        if let Some(action) = action {
            debug!(?action, "hotkey pressed");
        }
        action
    }

    fn register_all(&mut self, bindings: &HotkeyBindings) -> Result<()> {
        let pairs = [
            (HotkeyAction::ToggleRecording, &bindings.toggle_recording),
            (HotkeyAction::TranscribeLast, &bindings.transcribe_last),
            (HotkeyAction::OpenSettings, &bindings.open_settings),
            (HotkeyAction::Quit, &bindings.quit),
        ];

        for (action, binding) in pairs {
            let hotkey = parse_binding(binding)
                .with_context(|| format!("invalid binding '{binding}' for {action:?}"))?;
            self.registry
                .register(hotkey)
                .with_context(|| format!("failed to register '{binding}' for {action:?}"))?;
            self.registered.push(hotkey);
            self.actions.insert(hotkey.id(), action);
            info!(?action, binding = %binding, "registered hotkey");
        }
        Ok(())
    }

    fn unregister_all(&mut self) {
        for hotkey in self.registered.drain(..) {
            if let Err(e) = self.registry.unregister(hotkey) {
                tracing::error!("failed to unregister hotkey: {}", e);
            }
        }
        self.actions.clear();
    }
}

impl Drop for HotkeyManager {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

/// Parse a `"modifier+key"` binding string such as `"alt+r"` or
/// `"ctrl+shift+space"`. At least one modifier is required so plain typing
/// never triggers an action.
///
/// # Errors
/// Returns error on unknown modifiers, unsupported keys, or a missing key.
pub fn parse_binding(binding: &str) -> Result<HotKey> {
    let parts: Vec<&str> = binding.split('+').map(str::trim).collect();
    if parts.len() < 2 {
        return Err(anyhow!("binding must be 'modifier+key', got '{binding}'"));
    }

    let (key_part, modifier_parts) = match parts.split_last() {
        Some(split) => split,
        None => return Err(anyhow!("empty binding")),
    };

    let mut modifiers = Modifiers::empty();
    for part in modifier_parts {
        modifiers |= parse_modifier(part)?;
    }

    let code = parse_key(key_part)?;
    Ok(HotKey::new(Some(modifiers), code))
}

fn parse_modifier(name: &str) -> Result<Modifiers> {
    match name.to_lowercase().as_str() {
        "ctrl" | "control" => Ok(Modifiers::CONTROL),
        "alt" | "option" => Ok(Modifiers::ALT),
        "shift" => Ok(Modifiers::SHIFT),
        "super" | "command" | "win" => Ok(Modifiers::SUPER),
        _ => Err(anyhow!("unknown modifier: {name}")),
    }
}

fn parse_key(key: &str) -> Result<Code> {
    let normalized = key.to_lowercase();
    let code = match normalized.as_str() {
        "a" => Code::KeyA,
        "b" => Code::KeyB,
        "c" => Code::KeyC,
        "d" => Code::KeyD,
        "e" => Code::KeyE,
        "f" => Code::KeyF,
        "g" => Code::KeyG,
        "h" => Code::KeyH,
        "i" => Code::KeyI,
        "j" => Code::KeyJ,
        "k" => Code::KeyK,
        "l" => Code::KeyL,
        "m" => Code::KeyM,
        "n" => Code::KeyN,
        "o" => Code::KeyO,
        "p" => Code::KeyP,
        "q" => Code::KeyQ,
        "r" => Code::KeyR,
        "s" => Code::KeyS,
        "t" => Code::KeyT,
        "u" => Code::KeyU,
        "v" => Code::KeyV,
        "w" => Code::KeyW,
        "x" => Code::KeyX,
        "y" => Code::KeyY,
        "z" => Code::KeyZ,
        "0" => Code::Digit0,
        "1" => Code::Digit1,
        "2" => Code::Digit2,
        "3" => Code::Digit3,
        "4" => Code::Digit4,
        "5" => Code::Digit5,
        "6" => Code::Digit6,
        "7" => Code::Digit7,
        "8" => Code::Digit8,
        "9" => Code::Digit9,
        "f1" => Code::F1,
        "f2" => Code::F2,
        "f3" => Code::F3,
        "f4" => Code::F4,
        "f5" => Code::F5,
        "f6" => Code::F6,
        "f7" => Code::F7,
        "f8" => Code::F8,
        "f9" => Code::F9,
        "f10" => Code::F10,
        "f11" => Code::F11,
        "f12" => Code::F12,
        "space" => Code::Space,
        "" => return Err(anyhow!("missing key in binding")),
        _ => return Err(anyhow!("unsupported key: {key}")),
    };
    Ok(code)
}
