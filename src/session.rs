use crate::audio_queue::AudioBufferQueue;
use crate::context::ContextSource;
use crate::control_queue::{ControlMessage, ControlMessageQueue};
use crate::rpc::auth::RpcClient;
use crate::rpc::{FinalTranscript, OutboundItem, RpcError, StreamConfig, TranscribeService};
use crate::state::Mode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};

/// Sample rate assumed until capture reports its effective output rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initialized,
    Streaming,
    Ending,
    Completed,
    Cancelled,
    Errored,
}

impl SessionState {
    /// A session in any of these states blocks a new `initialize`.
    fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Initialized | SessionState::Streaming | SessionState::Ending
        )
    }
}

/// Terminal payload of one session: the transcript (or structured error) plus
/// the retained audio so the caller can persist the attempt.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub transcript: String,
    pub error: Option<String>,
    pub audio: Vec<u8>,
    pub sample_rate: u32,
}

/// Owns the single active streaming session: the state machine, both queues,
/// and the merge loop that interleaves control messages into the outbound
/// audio sequence.
///
/// The merge loop is the one consumer deciding interleaving order: before
/// each audio frame it drains every pending control message, so a control
/// message is never delayed behind audio enqueued after it and never
/// overtakes audio already on the wire. After the frame sequence ends, one
/// final drain flushes anything queued near the end.
pub struct StreamSessionController {
    service: Arc<dyn TranscribeService>,
    client: Arc<RpcClient>,
    context: Arc<dyn ContextSource>,
    /// Replaced wholesale on every `initialize` so tasks from a previous
    /// session keep draining their own queue and never touch the next one.
    audio: Mutex<Arc<AudioBufferQueue>>,
    controls: Arc<ControlMessageQueue>,
    state: Arc<Mutex<SessionState>>,
    mode: Mutex<Mode>,
    cancelled: Arc<AtomicBool>,
    abort: Mutex<Arc<Notify>>,
    session_seq: AtomicU64,
    session_id: Arc<AtomicU64>,
    rpc_started: AtomicBool,
    result_rx: Mutex<Option<oneshot::Receiver<Result<FinalTranscript, RpcError>>>>,
}

impl StreamSessionController {
    pub fn new(
        service: Arc<dyn TranscribeService>,
        client: Arc<RpcClient>,
        context: Arc<dyn ContextSource>,
    ) -> Self {
        Self {
            service,
            client,
            context,
            audio: Mutex::new(Arc::new(AudioBufferQueue::new(DEFAULT_SAMPLE_RATE))),
            controls: Arc::new(ControlMessageQueue::new()),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            mode: Mutex::new(Mode::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: Mutex::new(Arc::new(Notify::new())),
            session_seq: AtomicU64::new(0),
            session_id: Arc::new(AtomicU64::new(0)),
            rpc_started: AtomicBool::new(false),
            result_rx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn audio(&self) -> Arc<AudioBufferQueue> {
        self.audio.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// Begin a new session. Rejected while another session is `Initialized`
    /// or later; the existing session's state is left untouched. On success
    /// both queues and the retained audio buffer are fully reset.
    pub fn initialize(&self, mode: Mode) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        if state.is_active() {
            return Err(format!("session already active ({:?})", *state));
        }
        let id = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.session_id.store(id, Ordering::SeqCst);
        {
            // A fresh queue per session; the old one stays closed so tasks
            // still draining it wind down on their own.
            let fresh = Arc::new(AudioBufferQueue::new(DEFAULT_SAMPLE_RATE));
            fresh.reset(DEFAULT_SAMPLE_RATE);
            let mut audio = self.audio.lock().unwrap();
            audio.close();
            *audio = fresh;
        }
        self.controls.clear();
        self.cancelled.store(false, Ordering::SeqCst);
        self.rpc_started.store(false, Ordering::SeqCst);
        *self.abort.lock().unwrap() = Arc::new(Notify::new());
        *self.result_rx.lock().unwrap() = None;
        *self.mode.lock().unwrap() = mode;
        *state = SessionState::Initialized;
        log::info!("[session] initialized: id={} mode={}", id, mode.as_str());
        Ok(())
    }

    /// Open the bidirectional stream and start the merge loop. Valid exactly
    /// once per session.
    pub fn start_rpc(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Initialized {
                return Err(format!("cannot start rpc in state {:?}", *state));
            }
            if self.rpc_started.swap(true, Ordering::SeqCst) {
                return Err("rpc already started for this session".into());
            }
            *state = SessionState::Streaming;
        }

        let (out_tx, out_rx) = mpsc::channel::<OutboundItem>(OUTBOUND_CHANNEL_CAPACITY);
        let outbound = Arc::new(tokio::sync::Mutex::new(out_rx));
        let (res_tx, res_rx) = oneshot::channel();
        *self.result_rx.lock().unwrap() = Some(res_rx);

        // Merge loop: the single consumer of both queues.
        let audio = self.audio();
        let controls = self.controls.clone();
        let cancelled = self.cancelled.clone();
        tokio::spawn(async move {
            while let Some(frame) = audio.next_frame().await {
                for msg in controls.drain_pending() {
                    if out_tx.send(OutboundItem::Control(msg)).await.is_err() {
                        return;
                    }
                }
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if out_tx.send(OutboundItem::Audio(frame)).await.is_err() {
                    return;
                }
            }
            // Flush control messages queued near the end of the stream.
            for msg in controls.drain_pending() {
                if out_tx.send(OutboundItem::Control(msg)).await.is_err() {
                    return;
                }
            }
            // Dropping out_tx ends the outbound sequence.
        });

        // Transport task: the streaming call itself, behind the auth-retry
        // wrapper. The shared outbound receiver lets a retried call pick up
        // the stream where the failed attempt left off.
        let service = self.service.clone();
        let client = self.client.clone();
        let audio = self.audio();
        let cancelled = self.cancelled.clone();
        let state = self.state.clone();
        let abort = self.abort.lock().unwrap().clone();
        let current_id = self.session_id.clone();
        let session_id = current_id.load(Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        tokio::spawn(async move {
            let result = client
                .with_auth_retry(|| {
                    let config = StreamConfig {
                        session_id,
                        mode,
                        sample_rate: audio.sample_rate(),
                    };
                    service.open_stream(config, outbound.clone(), abort.clone())
                })
                .await;

            // A cancelled session always rejects, even if the remote side
            // managed to finalize before noticing the abort.
            let result = match result {
                Ok(_) if cancelled.load(Ordering::SeqCst) => Err(RpcError::Cancelled),
                other => other,
            };

            let terminal = match &result {
                Ok(_) => SessionState::Completed,
                Err(RpcError::Cancelled) => SessionState::Cancelled,
                Err(_) if cancelled.load(Ordering::SeqCst) => SessionState::Cancelled,
                Err(_) => SessionState::Errored,
            };
            // The shared state belongs to whichever session is current; a
            // transport task that outlived its session must not touch it.
            // Checked under the state lock, which `initialize` also holds
            // while bumping the id.
            {
                let mut state = state.lock().unwrap();
                if current_id.load(Ordering::SeqCst) == session_id {
                    *state = terminal;
                }
            }
            match &result {
                Ok(_) => log::info!("[session] stream finished: id={}", session_id),
                Err(RpcError::Cancelled) => {
                    log::info!("[session] stream cancelled: id={}", session_id)
                }
                Err(e) => log::warn!("[session] stream failed: id={} err={}", session_id, e),
            }
            let _ = res_tx.send(result);
        });
        Ok(())
    }

    /// Await the terminal response of the streaming call started by
    /// `start_rpc`. Consumes the pending result.
    pub async fn await_result(&self) -> Result<TranscriptResult, RpcError> {
        let rx = self
            .result_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RpcError::Transport("no rpc in flight".into()))?;
        match rx.await {
            Ok(Ok(finished)) => Ok(TranscriptResult {
                transcript: finished.transcript,
                error: finished.error,
                audio: self.audio().buffered_audio(),
                sample_rate: self.audio().sample_rate(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Transport("rpc task dropped".into())),
        }
    }

    /// Feed one captured frame. Callable from the native capture thread.
    pub fn push_audio(&self, pcm: Vec<u8>) {
        self.audio().push(pcm);
    }

    /// Capture reported its effective output rate.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        log::info!("[session] effective sample rate: {} Hz", sample_rate);
        self.audio().set_sample_rate(sample_rate);
    }

    /// Switch mode mid-session. Enqueues a partial `ModeUpdate`; audio is
    /// untouched.
    pub fn set_mode(&self, mode: Mode) -> Result<(), String> {
        let state = self.state.lock().unwrap();
        if *state != SessionState::Streaming {
            return Err(format!("cannot change mode in state {:?}", *state));
        }
        *self.mode.lock().unwrap() = mode;
        self.controls.enqueue(ControlMessage::ModeUpdate { mode });
        log::info!("[session] mode change queued: {}", mode.as_str());
        Ok(())
    }

    /// Gather context via the collaborator and splice a `ConfigSnapshot` into
    /// the stream. Best-effort: gather failures are logged, never propagated.
    pub async fn send_context_snapshot(&self) {
        let mode = *self.mode.lock().unwrap();
        match self.context.gather(mode).await {
            Ok(ctx) => {
                self.controls.enqueue(ControlMessage::ConfigSnapshot {
                    window_title: ctx.window_title,
                    app_name: ctx.app_name,
                    selected_text: ctx.selected_text,
                    vocabulary: ctx.vocabulary,
                    model_settings: ctx.model_settings,
                });
                log::info!("[session] context snapshot queued");
            }
            Err(e) => {
                log::warn!("[session] context gathering failed: {}", e);
            }
        }
    }

    /// The user finished speaking: close the audio queue so the merge loop
    /// drains naturally and the remote side finalizes.
    pub fn end_interaction(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Streaming {
                return Err(format!("cannot end interaction in state {:?}", *state));
            }
            *state = SessionState::Ending;
        }
        self.audio().close();
        log::info!(
            "[session] ending: id={} buffered={}ms",
            self.session_id(),
            self.audio().buffered_duration_ms()
        );
        Ok(())
    }

    /// Cooperative cancel: set the flag, close the queue, abort the
    /// transport. Safe to call repeatedly and after the queue is closed.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.is_active() {
                return;
            }
            self.cancelled.store(true, Ordering::SeqCst);
            *state = SessionState::Cancelled;
        }
        self.audio().close();
        self.abort.lock().unwrap().notify_one();
        log::info!("[session] cancelled: id={}", self.session_id());
    }

    /// Duration of all audio accepted this session. Usable at any time,
    /// including after cancellation.
    pub fn buffered_duration_ms(&self) -> u64 {
        self.audio().buffered_duration_ms()
    }

    /// Snapshot of the retained audio, e.g. for persisting a failed attempt.
    pub fn buffered_audio(&self) -> Vec<u8> {
        self.audio().buffered_audio()
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio().sample_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextSource, GatheredContext};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    struct MockService {
        sent: Arc<StdMutex<Vec<OutboundItem>>>,
        response: FinalTranscript,
    }

    impl MockService {
        fn new(transcript: &str) -> Self {
            Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
                response: FinalTranscript {
                    transcript: transcript.into(),
                    error: None,
                },
            }
        }
    }

    impl TranscribeService for MockService {
        fn open_stream(
            &self,
            _config: StreamConfig,
            outbound: crate::rpc::OutboundRx,
            abort: Arc<Notify>,
        ) -> BoxFuture<'static, Result<FinalTranscript, RpcError>> {
            let sent = self.sent.clone();
            let response = self.response.clone();
            Box::pin(async move {
                let mut rx = outbound.lock().await;
                loop {
                    tokio::select! {
                        item = rx.recv() => match item {
                            Some(item) => sent.lock().unwrap().push(item),
                            None => break,
                        },
                        _ = abort.notified() => return Err(RpcError::Cancelled),
                    }
                }
                Ok(response)
            })
        }
    }

    struct MockContext {
        fail: bool,
    }

    impl ContextSource for MockContext {
        fn gather(&self, _mode: Mode) -> BoxFuture<'static, Result<GatheredContext, String>> {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err("window probe unavailable".into())
                } else {
                    Ok(GatheredContext {
                        window_title: Some("Notes".into()),
                        app_name: Some("Notes".into()),
                        selected_text: None,
                        vocabulary: vec!["plume".into()],
                        model_settings: None,
                    })
                }
            })
        }
    }

    struct NoopAuth;

    impl crate::rpc::auth::AuthProvider for NoopAuth {
        fn refresh_tokens(
            &self,
        ) -> BoxFuture<'static, Result<crate::rpc::auth::Tokens, String>> {
            Box::pin(async { Err("no auth in tests".into()) })
        }
        fn on_auth_invalidated(&self) {}
    }

    fn controller_with(service: Arc<MockService>) -> StreamSessionController {
        StreamSessionController::new(
            service,
            Arc::new(RpcClient::new(Arc::new(NoopAuth), None)),
            Arc::new(MockContext { fail: false }),
        )
    }

    fn frame_pcm(item: &OutboundItem) -> Option<&[u8]> {
        match item {
            OutboundItem::Audio(f) => Some(&f.pcm),
            OutboundItem::Control(_) => None,
        }
    }

    #[tokio::test]
    async fn merge_preserves_audio_order_and_splices_controls() {
        let service = Arc::new(MockService::new("hello"));
        let ctrl = controller_with(service.clone());
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();

        ctrl.push_audio(vec![1, 1]);
        ctrl.set_mode(Mode::Action).unwrap();
        ctrl.push_audio(vec![2, 2]);
        ctrl.push_audio(vec![3, 3]);
        ctrl.send_context_snapshot().await;
        ctrl.end_interaction().unwrap();

        let result = ctrl.await_result().await.unwrap();
        assert_eq!(result.transcript, "hello");
        assert_eq!(ctrl.state(), SessionState::Completed);

        let sent = service.sent.lock().unwrap();
        // Audio frames arrive in push order.
        let frames: Vec<&[u8]> = sent.iter().filter_map(frame_pcm).collect();
        assert_eq!(frames, vec![&[1u8, 1][..], &[2, 2], &[3, 3]]);

        // The mode update (enqueued after frame 1 was pushed) appears before
        // the first frame pushed after it.
        let mode_pos = sent
            .iter()
            .position(|i| matches!(i, OutboundItem::Control(ControlMessage::ModeUpdate { .. })))
            .expect("mode update sent");
        let frame2_pos = sent
            .iter()
            .position(|i| frame_pcm(i) == Some(&[2, 2]))
            .unwrap();
        assert!(mode_pos < frame2_pos);

        // The snapshot enqueued after the last push is flushed by the final
        // drain rather than lost.
        assert!(sent
            .iter()
            .any(|i| matches!(i, OutboundItem::Control(ControlMessage::ConfigSnapshot { .. }))));
    }

    #[tokio::test]
    async fn initialize_is_mutually_exclusive() {
        let ctrl = controller_with(Arc::new(MockService::new("")));
        ctrl.initialize(Mode::Dictation).unwrap();
        let first_id = ctrl.session_id();

        assert!(ctrl.initialize(Mode::Dictation).is_err());
        assert_eq!(ctrl.state(), SessionState::Initialized);
        assert_eq!(ctrl.session_id(), first_id);

        // A terminal session no longer blocks a new one.
        ctrl.cancel();
        ctrl.initialize(Mode::Action).unwrap();
        assert_eq!(ctrl.state(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn start_rpc_is_guarded_to_exactly_once() {
        let ctrl = controller_with(Arc::new(MockService::new("")));
        assert!(ctrl.start_rpc().is_err());
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();
        assert!(ctrl.start_rpc().is_err());
    }

    #[tokio::test]
    async fn set_mode_requires_streaming() {
        let ctrl = controller_with(Arc::new(MockService::new("")));
        assert!(ctrl.set_mode(Mode::Action).is_err());
        ctrl.initialize(Mode::Dictation).unwrap();
        assert!(ctrl.set_mode(Mode::Action).is_err());
        ctrl.start_rpc().unwrap();
        assert!(ctrl.set_mode(Mode::Action).is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_rejects_the_stream() {
        let ctrl = controller_with(Arc::new(MockService::new("ignored")));
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();
        ctrl.push_audio(vec![0; 3200]);

        ctrl.cancel();
        // Second cancel after the queue is already closed: no panic, state
        // stays Cancelled.
        ctrl.cancel();
        assert_eq!(ctrl.state(), SessionState::Cancelled);

        let err = ctrl.await_result().await.unwrap_err();
        assert_eq!(err, RpcError::Cancelled);

        // Buffered accessors still usable for persisting the partial attempt.
        assert_eq!(ctrl.buffered_duration_ms(), 100);
        assert_eq!(ctrl.buffered_audio().len(), 3200);
    }

    #[tokio::test]
    async fn cancel_from_initialized_without_rpc() {
        let ctrl = controller_with(Arc::new(MockService::new("")));
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.cancel();
        assert_eq!(ctrl.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn context_gather_failure_is_swallowed() {
        let service = Arc::new(MockService::new("ok"));
        let ctrl = StreamSessionController::new(
            service.clone(),
            Arc::new(RpcClient::new(Arc::new(NoopAuth), None)),
            Arc::new(MockContext { fail: true }),
        );
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();
        ctrl.send_context_snapshot().await;
        ctrl.push_audio(vec![9, 9]);
        ctrl.end_interaction().unwrap();

        let result = ctrl.await_result().await.unwrap();
        assert_eq!(result.transcript, "ok");
        // No snapshot made it onto the wire, and nothing failed.
        let sent = service.sent.lock().unwrap();
        assert!(!sent
            .iter()
            .any(|i| matches!(i, OutboundItem::Control(_))));
    }

    /// First open lingers long after the abort before settling; later opens
    /// behave like a normal stream.
    struct SlowAbortService {
        inner: MockService,
        opens: std::sync::atomic::AtomicUsize,
    }

    impl TranscribeService for SlowAbortService {
        fn open_stream(
            &self,
            config: StreamConfig,
            outbound: crate::rpc::OutboundRx,
            abort: Arc<Notify>,
        ) -> BoxFuture<'static, Result<FinalTranscript, RpcError>> {
            let n = self.opens.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Box::pin(async move {
                    abort.notified().await;
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    Err(RpcError::Cancelled)
                })
            } else {
                self.inner.open_stream(config, outbound, abort)
            }
        }
    }

    #[tokio::test]
    async fn stale_transport_task_cannot_clobber_the_next_session() {
        let service = Arc::new(SlowAbortService {
            inner: MockService::new("second"),
            opens: std::sync::atomic::AtomicUsize::new(0),
        });
        let ctrl = StreamSessionController::new(
            service.clone(),
            Arc::new(RpcClient::new(Arc::new(NoopAuth), None)),
            Arc::new(MockContext { fail: false }),
        );

        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();
        ctrl.push_audio(vec![0; 3200]);
        ctrl.cancel();

        // Restart immediately, while the first transport is still draining.
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.start_rpc().unwrap();
        assert_eq!(ctrl.state(), SessionState::Streaming);

        // Let the stale task settle; the live session must be untouched.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(ctrl.state(), SessionState::Streaming);

        // And the new session still runs to completion on its own stream.
        ctrl.push_audio(vec![7, 7]);
        ctrl.end_interaction().unwrap();
        let result = ctrl.await_result().await.unwrap();
        assert_eq!(result.transcript, "second");
        assert_eq!(ctrl.state(), SessionState::Completed);
        let sent = service.inner.sent.lock().unwrap();
        let frames: Vec<&[u8]> = sent.iter().filter_map(frame_pcm).collect();
        assert_eq!(frames, vec![&[7u8, 7][..]]);
    }

    #[tokio::test]
    async fn initialize_resets_buffered_audio_between_sessions() {
        let ctrl = controller_with(Arc::new(MockService::new("")));
        ctrl.initialize(Mode::Dictation).unwrap();
        ctrl.push_audio(vec![0; 3200]);
        ctrl.cancel();
        assert_eq!(ctrl.buffered_duration_ms(), 100);

        ctrl.initialize(Mode::Dictation).unwrap();
        assert_eq!(ctrl.buffered_duration_ms(), 0);
        assert!(ctrl.buffered_audio().is_empty());
    }
}
