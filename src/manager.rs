use crate::capture::{CaptureSource, FrameSink};
use crate::rpc::records::InteractionStore;
use crate::rpc::RpcError;
use crate::session::{SessionState, StreamSessionController};
use crate::state::Mode;
use crate::typing::TextSink;
use std::sync::Arc;

/// Utterances shorter than this are treated as noise and discarded without a
/// transcription call.
pub const MIN_UTTERANCE_MS: u64 = 100;

/// Top-level state machine for one user-visible dictation interaction:
/// start capture, stream, finalize, hand off the transcript. The sole
/// decision point for user-visible consequences of streaming failures.
pub struct SessionManager {
    controller: Arc<StreamSessionController>,
    capture: Arc<dyn CaptureSource>,
    text_sink: Arc<dyn TextSink>,
    store: Arc<dyn InteractionStore>,
    mic_device: Option<String>,
}

impl SessionManager {
    pub fn new(
        controller: Arc<StreamSessionController>,
        capture: Arc<dyn CaptureSource>,
        text_sink: Arc<dyn TextSink>,
        store: Arc<dyn InteractionStore>,
        mic_device: Option<String>,
    ) -> Self {
        Self {
            controller,
            capture,
            text_sink,
            store,
            mic_device,
        }
    }

    pub fn controller(&self) -> &Arc<StreamSessionController> {
        &self.controller
    }

    /// Begin a dictation interaction: open the stream, start capture, and
    /// fire the background context snapshot.
    pub async fn start_session(&self, mode: Mode) -> Result<(), String> {
        self.controller.initialize(mode)?;
        if let Err(e) = self.controller.start_rpc() {
            self.controller.cancel();
            return Err(e);
        }

        let frame_ctrl = self.controller.clone();
        let config_ctrl = self.controller.clone();
        let sink = FrameSink {
            on_frame: Arc::new(move |pcm| frame_ctrl.push_audio(pcm)),
            on_config: Arc::new(move |rate| config_ctrl.set_sample_rate(rate)),
        };
        if let Err(e) = self.capture.start(self.mic_device.clone(), sink) {
            log::error!("[manager] capture failed to start: {}", e);
            self.controller.cancel();
            return Err(format!("capture failed to start: {}", e));
        }

        // Context gathering runs off the audio path; failures are logged
        // inside and never surface here.
        let ctx_ctrl = self.controller.clone();
        tokio::spawn(async move {
            ctx_ctrl.send_context_snapshot().await;
        });
        Ok(())
    }

    /// Mid-session mode switch.
    pub fn set_mode(&self, mode: Mode) -> Result<(), String> {
        self.controller.set_mode(mode)
    }

    /// The user released the hotkey. Returns the inserted transcript, or
    /// `None` when the session was discarded (too short, cancelled, empty,
    /// or finished with a remote error).
    pub async fn complete_session(&self) -> Result<Option<String>, String> {
        self.capture.stop();

        let duration_ms = self.controller.buffered_duration_ms();
        if duration_ms < MIN_UTTERANCE_MS {
            log::info!(
                "[manager] utterance too short ({}ms < {}ms), discarding",
                duration_ms,
                MIN_UTTERANCE_MS
            );
            self.controller.cancel();
            return Ok(None);
        }

        // The stream may have already settled (for example a mid-session
        // transport failure). Its result is still pending and must be
        // collected so the failed interaction gets its record.
        if self.controller.end_interaction().is_err() {
            let state = self.controller.state();
            if !matches!(
                state,
                SessionState::Completed | SessionState::Cancelled | SessionState::Errored
            ) {
                return Err(format!("cannot finalize session in state {:?}", state));
            }
            log::info!(
                "[manager] stream already settled ({:?}), collecting result",
                state
            );
        }
        match self.controller.await_result().await {
            Ok(result) => {
                if let Some(error) = result.error {
                    log::warn!("[manager] transcription failed: {}", error);
                    self.persist(String::new(), Some(error)).await;
                    return Ok(None);
                }
                if result.transcript.is_empty() {
                    log::info!("[manager] empty transcript, nothing to insert");
                    return Ok(None);
                }
                let text = result.transcript;
                let sink = self.text_sink.clone();
                let typed = text.clone();
                let inserted = tokio::task::spawn_blocking(move || sink.insert_text(&typed))
                    .await
                    .unwrap_or(false);
                if !inserted {
                    log::error!("[manager] text insertion failed");
                }
                self.persist(text.clone(), None).await;
                Ok(Some(text))
            }
            Err(RpcError::Cancelled) => {
                log::info!("[manager] session cancelled during finalize");
                Ok(None)
            }
            Err(e) => {
                self.persist(String::new(), Some(e.to_string())).await;
                Err(format!("transcription stream failed: {}", e))
            }
        }
    }

    /// Discard the in-flight session. No insertion; a failed-attempt record
    /// is written only if audio was already buffered.
    pub async fn cancel_session(&self) {
        self.capture.stop();
        self.controller.cancel();
        if self.controller.buffered_duration_ms() > 0 {
            self.persist(String::new(), Some("cancelled".into())).await;
        }
    }

    pub fn buffered_duration_ms(&self) -> u64 {
        self.controller.buffered_duration_ms()
    }

    /// Best-effort persistence; failures are logged here and never propagate.
    async fn persist(&self, transcript: String, error_message: Option<String>) {
        let audio = self.controller.buffered_audio();
        let sample_rate = self.controller.sample_rate();
        if let Err(e) = self
            .store
            .create_interaction(transcript, audio, sample_rate, error_message)
            .await
        {
            log::warn!("[manager] failed to persist interaction: {}", e);
        }
    }
}
