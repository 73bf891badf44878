pub mod auth;
pub mod records;
pub mod ws;

use crate::audio_queue::AudioFrame;
use crate::control_queue::ControlMessage;
use crate::state::Mode;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Classification of remote-call failures. Only `Unauthenticated` is ever
/// retried, and only once, by the auth wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Rejected credentials (HTTP 401/403 or equivalent).
    Unauthenticated,
    /// The caller cancelled; expected, logged at info, never user-facing.
    Cancelled,
    /// Connection-level failure (connect, send, unexpected close).
    Transport(String),
    /// The remote side completed the call with an error payload.
    Remote(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Unauthenticated => write!(f, "unauthenticated"),
            RpcError::Cancelled => write!(f, "cancelled"),
            RpcError::Transport(msg) => write!(f, "transport error: {}", msg),
            RpcError::Remote(msg) => write!(f, "remote error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

/// One item of the merged outbound sequence: an audio frame or a control
/// message spliced in ahead of it.
#[derive(Debug, Clone)]
pub enum OutboundItem {
    Audio(AudioFrame),
    Control(ControlMessage),
}

/// Per-session parameters sent to the server when the stream opens.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub session_id: u64,
    pub mode: Mode,
    pub sample_rate: u32,
}

/// Terminal payload of the streaming call.
#[derive(Debug, Clone, Default)]
pub struct FinalTranscript {
    pub transcript: String,
    pub error: Option<String>,
}

/// Outbound stream handed to the transport. Wrapped in a shared mutex so the
/// auth-retry wrapper can re-open the stream without losing queued items.
pub type OutboundRx = Arc<Mutex<mpsc::Receiver<OutboundItem>>>;

/// Bidirectional transcription transport. The outbound sequence is consumed
/// until it ends (sender dropped), after which the server finalizes with a
/// single terminal response. `abort` must interrupt an in-flight call
/// promptly, without waiting on the remote side.
pub trait TranscribeService: Send + Sync {
    fn open_stream(
        &self,
        config: StreamConfig,
        outbound: OutboundRx,
        abort: Arc<Notify>,
    ) -> BoxFuture<'static, Result<FinalTranscript, RpcError>>;
}
