use super::auth::RpcClient;
use super::RpcError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One persisted dictation interaction, successful or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    #[serde(default)]
    pub id: String,
    pub transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Base64-encoded 16-bit mono PCM; omitted when audio was discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    pub sample_rate: u32,
    pub created_at: DateTime<Utc>,
}

/// Server-side user settings fetched at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub vocabulary: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub language: String,
}

/// Persistence collaborator consumed by the session manager. Failures are
/// best-effort: the caller logs them and moves on.
pub trait InteractionStore: Send + Sync {
    fn create_interaction(
        &self,
        transcript: String,
        audio: Vec<u8>,
        sample_rate: u32,
        error_message: Option<String>,
    ) -> BoxFuture<'static, Result<(), String>>;
}

/// Unary record CRUD and settings sync, all routed through the auth-retry
/// wrapper.
#[derive(Clone)]
pub struct RecordsApi {
    http: reqwest::Client,
    base_url: String,
    client: Arc<RpcClient>,
}

fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response, RpcError> {
    let code = resp.status().as_u16();
    if code == 401 || code == 403 {
        return Err(RpcError::Unauthenticated);
    }
    if !resp.status().is_success() {
        return Err(RpcError::Remote(format!("http {}", resp.status())));
    }
    Ok(resp)
}

fn transport_err(e: reqwest::Error) -> RpcError {
    RpcError::Transport(format!("request failed: {}", e))
}

impl RecordsApi {
    pub fn new(base_url: &str, client: Arc<RpcClient>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.client.access_token().unwrap_or_default())
    }

    pub async fn create(&self, record: &InteractionRecord) -> Result<InteractionRecord, RpcError> {
        let url = format!("{}/interactions", self.base_url);
        self.client
            // The request is rebuilt per attempt so a retry after token
            // refresh carries the fresh bearer.
            .with_auth_retry(|| {
                let req = self
                    .http
                    .post(&url)
                    .header("Authorization", self.bearer())
                    .json(record);
                async move {
                    let resp = req.send().await.map_err(transport_err)?;
                    classify_status(resp)?
                        .json::<InteractionRecord>()
                        .await
                        .map_err(|e| RpcError::Remote(format!("invalid response: {}", e)))
                }
            })
            .await
    }

    pub async fn update(&self, id: &str, transcript: &str) -> Result<(), RpcError> {
        let url = format!("{}/interactions/{}", self.base_url, id);
        self.client
            .with_auth_retry(|| {
                let req = self
                    .http
                    .put(&url)
                    .header("Authorization", self.bearer())
                    .json(&serde_json::json!({ "transcript": transcript }));
                async move {
                    let resp = req.send().await.map_err(transport_err)?;
                    classify_status(resp).map(|_| ())
                }
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), RpcError> {
        let url = format!("{}/interactions/{}", self.base_url, id);
        self.client
            .with_auth_retry(|| {
                let req = self
                    .http
                    .delete(&url)
                    .header("Authorization", self.bearer());
                async move {
                    let resp = req.send().await.map_err(transport_err)?;
                    classify_status(resp).map(|_| ())
                }
            })
            .await
    }

    pub async fn list_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>, RpcError> {
        let url = format!(
            "{}/interactions?since={}",
            self.base_url,
            since.to_rfc3339()
        );
        self.client
            .with_auth_retry(|| {
                let req = self
                    .http
                    .get(&url)
                    .header("Authorization", self.bearer());
                async move {
                    let resp = req.send().await.map_err(transport_err)?;
                    classify_status(resp)?
                        .json::<Vec<InteractionRecord>>()
                        .await
                        .map_err(|e| RpcError::Remote(format!("invalid response: {}", e)))
                }
            })
            .await
    }

    pub async fn fetch_settings(&self) -> Result<RemoteSettings, RpcError> {
        let url = format!("{}/settings", self.base_url);
        self.client
            .with_auth_retry(|| {
                let req = self
                    .http
                    .get(&url)
                    .header("Authorization", self.bearer());
                async move {
                    let resp = req.send().await.map_err(transport_err)?;
                    classify_status(resp)?
                        .json::<RemoteSettings>()
                        .await
                        .map_err(|e| RpcError::Remote(format!("invalid response: {}", e)))
                }
            })
            .await
    }
}

impl InteractionStore for RecordsApi {
    fn create_interaction(
        &self,
        transcript: String,
        audio: Vec<u8>,
        sample_rate: u32,
        error_message: Option<String>,
    ) -> BoxFuture<'static, Result<(), String>> {
        let api = self.clone();
        Box::pin(async move {
            let record = InteractionRecord {
                id: String::new(),
                transcript,
                error_message,
                audio: if audio.is_empty() {
                    None
                } else {
                    Some(BASE64.encode(&audio))
                },
                sample_rate,
                created_at: Utc::now(),
            };
            api.create(&record).await.map(|_| ()).map_err(|e| e.to_string())
        })
    }
}
