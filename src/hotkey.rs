use crate::state::{AppEvent, AppState};
use rdev::{listen, Event, EventType, Key};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender as EventSender;
use std::sync::Arc;

static LISTENER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Global push-to-talk listener: Right Ctrl down starts a session, release
/// completes it. Key-repeat presses are debounced with a held flag.
pub fn start_listener(state: Arc<AppState>, event_tx: EventSender<AppEvent>) {
    if LISTENER_ACTIVE.swap(true, Ordering::SeqCst) {
        return;
    }

    std::thread::spawn(move || {
        let key_held = Arc::new(AtomicBool::new(false));
        let key_held_cb = key_held.clone();

        let callback = move |event: Event| {
            match event.event_type {
                EventType::KeyPress(Key::ControlRight) => {
                    if !state.armed.load(Ordering::SeqCst) {
                        return;
                    }
                    if key_held_cb.swap(true, Ordering::SeqCst) {
                        return; // key repeat
                    }
                    state.hotkey_recording.store(true, Ordering::SeqCst);
                    log::info!("[hotkey] push-to-talk down");
                    let _ = event_tx.send(AppEvent::HotkeyPush);
                }
                EventType::KeyRelease(Key::ControlRight) => {
                    if !key_held_cb.swap(false, Ordering::SeqCst) {
                        return;
                    }
                    if !state.hotkey_recording.swap(false, Ordering::SeqCst) {
                        return;
                    }
                    log::info!("[hotkey] push-to-talk up");
                    let _ = event_tx.send(AppEvent::HotkeyRelease);
                }
                _ => {}
            }
        };

        if let Err(e) = listen(callback) {
            log::error!("[hotkey] rdev listener error: {:?}", e);
        }

        LISTENER_ACTIVE.store(false, Ordering::SeqCst);
    });
}
