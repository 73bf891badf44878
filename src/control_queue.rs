use crate::state::Mode;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Model parameters sent alongside context so the server can pick the right
/// transcription configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSettings {
    pub model: String,
    pub language: String,
}

/// Out-of-band update delivered through the same channel as audio.
///
/// The server performs a partial merge: only fields present in the message
/// overwrite prior session state. A `ModeUpdate` therefore carries nothing
/// but the mode, so previously sent context is left intact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ModeUpdate {
        mode: Mode,
    },
    ConfigSnapshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        window_title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        app_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        selected_text: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        vocabulary: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_settings: Option<ModelSettings>,
    },
}

/// FIFO queue of pending control messages, spliced into the outbound stream
/// ahead of the next audio frame. Only ever polled by the merge loop, never
/// awaited.
pub struct ControlMessageQueue {
    pending: Mutex<VecDeque<ControlMessage>>,
}

impl ControlMessageQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, message: ControlMessage) {
        self.pending.lock().unwrap().push_back(message);
    }

    /// Atomically remove and return everything queued, in FIFO order.
    pub fn drain_pending(&self) -> Vec<ControlMessage> {
        self.pending.lock().unwrap().drain(..).collect()
    }

    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

impl Default for ControlMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_fifo_order_and_empties() {
        let q = ControlMessageQueue::new();
        q.enqueue(ControlMessage::ModeUpdate {
            mode: Mode::Dictation,
        });
        q.enqueue(ControlMessage::ModeUpdate { mode: Mode::Action });

        let drained = q.drain_pending();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0],
            ControlMessage::ModeUpdate {
                mode: Mode::Dictation
            }
        );
        assert_eq!(drained[1], ControlMessage::ModeUpdate { mode: Mode::Action });
        assert!(q.is_empty());
        assert!(q.drain_pending().is_empty());
    }

    #[test]
    fn mode_update_serializes_only_the_mode() {
        let msg = ControlMessage::ModeUpdate { mode: Mode::Action };
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["type"], "mode_update");
        assert_eq!(obj["mode"], "action");
    }

    #[test]
    fn config_snapshot_omits_unset_fields() {
        let msg = ControlMessage::ConfigSnapshot {
            window_title: None,
            app_name: Some("Notes".into()),
            selected_text: None,
            vocabulary: vec![],
            model_settings: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["type"], "config_snapshot");
        assert_eq!(obj["app_name"], "Notes");
    }
}
