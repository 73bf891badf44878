use enigo::{Enigo, Keyboard, Settings};

/// Text-insertion sink: types the final transcript into the focused
/// application. Returns whether insertion succeeded.
pub trait TextSink: Send + Sync {
    fn insert_text(&self, text: &str) -> bool;
}

/// enigo-backed keyboard insertion. Blocking; callers run it on a blocking
/// task, never on the async runtime.
pub struct KeyboardSink;

impl TextSink for KeyboardSink {
    fn insert_text(&self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }
        let mut enigo = match Enigo::new(&Settings::default()) {
            Ok(e) => e,
            Err(e) => {
                log::error!("[typing] failed to init keyboard: {}", e);
                return false;
            }
        };
        match enigo.text(text) {
            Ok(()) => true,
            Err(e) => {
                log::error!("[typing] failed to type text: {}", e);
                false
            }
        }
    }
}
