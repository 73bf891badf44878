use super::auth::RpcClient;
use super::{FinalTranscript, OutboundItem, OutboundRx, RpcError, StreamConfig, TranscribeService};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite};

fn build_ws_request(
    url: &str,
    token: Option<&str>,
) -> Result<tungstenite::http::Request<()>, RpcError> {
    let uri: tungstenite::http::Uri = url
        .parse()
        .map_err(|e| RpcError::Transport(format!("invalid stream url: {}", e)))?;
    let host = uri
        .host()
        .ok_or_else(|| RpcError::Transport("stream url has no host".into()))?
        .to_string();
    let mut request = tungstenite::http::Request::builder()
        .uri(uri)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    request
        .body(())
        .map_err(|e| RpcError::Transport(format!("failed to build request: {}", e)))
}

fn is_unauthenticated_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403
        }
        _ => {
            let text = err.to_string();
            text.contains("401") || text.contains("403")
        }
    }
}

/// Parse one server text frame. Returns the terminal result when the frame is
/// the final response, `None` for informational frames.
fn parse_server_message(text: &str) -> Result<Option<FinalTranscript>, RpcError> {
    let event: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RpcError::Transport(format!("invalid server message: {}", e)))?;
    match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "final" => {
            let transcript = event
                .get("transcript")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            let error = event
                .get("error")
                .and_then(|e| e.as_str())
                .map(|e| e.to_string());
            Ok(Some(FinalTranscript { transcript, error }))
        }
        "error" => {
            let message = event
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown server error");
            Err(RpcError::Remote(message.to_string()))
        }
        other => {
            log::debug!("[ws] server message: {}", other);
            Ok(None)
        }
    }
}

/// WebSocket-backed transcription transport. Audio frames go out as binary
/// frames, control messages and the init/end envelope as JSON text frames;
/// the server answers with a single `final` text frame once the outbound
/// sequence ends.
pub struct WsTranscriber {
    url: String,
    client: Arc<RpcClient>,
}

impl WsTranscriber {
    pub fn new(url: String, client: Arc<RpcClient>) -> Self {
        Self { url, client }
    }
}

impl TranscribeService for WsTranscriber {
    fn open_stream(
        &self,
        config: StreamConfig,
        outbound: OutboundRx,
        abort: Arc<Notify>,
    ) -> BoxFuture<'static, Result<FinalTranscript, RpcError>> {
        let url = self.url.clone();
        let token = self.client.access_token();
        Box::pin(async move {
            let request = build_ws_request(&url, token.as_deref())?;
            log::info!("[ws] opening stream: session={}", config.session_id);

            let ws_stream = match connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) if is_unauthenticated_connect_error(&e) => {
                    return Err(RpcError::Unauthenticated);
                }
                Err(e) => {
                    return Err(RpcError::Transport(format!("connect failed: {}", e)));
                }
            };
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            let init = serde_json::json!({
                "type": "init",
                "session_id": config.session_id,
                "mode": config.mode.as_str(),
                "encoding": "linear16",
                "sample_rate": config.sample_rate,
            });
            ws_tx
                .send(tungstenite::Message::Text(init.to_string().into()))
                .await
                .map_err(|e| RpcError::Transport(format!("failed to send init: {}", e)))?;

            // The receiver lives behind a mutex so the auth-retry wrapper can
            // re-open the stream without losing queued items.
            let mut rx = outbound.lock().await;
            let mut outbound_done = false;
            let mut frames: u64 = 0;

            loop {
                tokio::select! {
                    item = rx.recv(), if !outbound_done => {
                        match item {
                            Some(OutboundItem::Audio(frame)) => {
                                if frame.pcm.is_empty() {
                                    continue;
                                }
                                frames += 1;
                                ws_tx
                                    .send(tungstenite::Message::Binary(frame.pcm.into()))
                                    .await
                                    .map_err(|e| {
                                        RpcError::Transport(format!("failed to send audio: {}", e))
                                    })?;
                            }
                            Some(OutboundItem::Control(msg)) => {
                                let text = serde_json::to_string(&msg).map_err(|e| {
                                    RpcError::Transport(format!("failed to encode control: {}", e))
                                })?;
                                ws_tx
                                    .send(tungstenite::Message::Text(text.into()))
                                    .await
                                    .map_err(|e| {
                                        RpcError::Transport(format!("failed to send control: {}", e))
                                    })?;
                            }
                            None => {
                                log::info!("[ws] outbound drained after {} frames, sending end", frames);
                                outbound_done = true;
                                let end = serde_json::json!({ "type": "end" });
                                ws_tx
                                    .send(tungstenite::Message::Text(end.to_string().into()))
                                    .await
                                    .map_err(|e| {
                                        RpcError::Transport(format!("failed to send end: {}", e))
                                    })?;
                            }
                        }
                    }
                    _ = abort.notified() => {
                        log::info!("[ws] abort signalled, closing stream");
                        let _ = ws_tx.close().await;
                        return Err(RpcError::Cancelled);
                    }
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                if let Some(result) = parse_server_message(&text)? {
                                    log::info!(
                                        "[ws] final received: {} chars, error={:?}",
                                        result.transcript.len(),
                                        result.error
                                    );
                                    let _ = ws_tx.close().await;
                                    return Ok(result);
                                }
                            }
                            Some(Ok(tungstenite::Message::Close(frame))) => {
                                let detail = frame
                                    .map(|f| format!("{} {}", f.code, f.reason))
                                    .unwrap_or_else(|| "no close frame".into());
                                return Err(RpcError::Transport(format!(
                                    "closed before final: {}",
                                    detail
                                )));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                return Err(RpcError::Transport(format!("stream error: {}", e)));
                            }
                            None => {
                                return Err(RpcError::Transport("closed before final".into()));
                            }
                        }
                    }
                }
            }
        })
    }
}
