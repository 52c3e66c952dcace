/// Global hotkey registration and binding parsing
pub mod hotkey;

pub use hotkey::{HotkeyAction, HotkeyManager};
