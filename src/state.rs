use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

/// Events sent from background threads (hotkey listener, auth layer) to the
/// main event loop.
#[derive(Debug, Clone)]
pub enum AppEvent {
    HotkeyPush,
    HotkeyRelease,
    /// Token refresh failed permanently; the app must force a sign-out.
    AuthInvalidated,
    StatusUpdate { status: String, message: String },
}

/// Dictation mode for one session. Sent to the server on init and again as a
/// partial update when the user switches mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Dictation,
    Action,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Dictation
    }
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Dictation => "dictation",
            Mode::Action => "action",
        }
    }
}

pub struct AppState {
    /// Master toggle; hotkeys are ignored while disarmed.
    pub armed: AtomicBool,
    /// True between hotkey press and release (push-to-talk held).
    pub hotkey_recording: AtomicBool,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
            hotkey_recording: AtomicBool::new(false),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
