use super::RpcError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Auth collaborator: refreshes tokens and receives the forced sign-out
/// notification when refresh itself fails.
pub trait AuthProvider: Send + Sync {
    fn refresh_tokens(&self) -> BoxFuture<'static, Result<Tokens, String>>;
    fn on_auth_invalidated(&self);
}

/// Wraps every remote call with a single-retry-after-reauthentication policy.
///
/// The refresh gate is process-wide: concurrent callers hitting an
/// `Unauthenticated` failure while a refresh is already in flight propagate
/// their original error instead of piling on additional refresh attempts.
pub struct RpcClient {
    auth: Arc<dyn AuthProvider>,
    tokens: StdMutex<Option<Tokens>>,
    refresh_gate: Mutex<()>,
}

impl RpcClient {
    pub fn new(auth: Arc<dyn AuthProvider>, tokens: Option<Tokens>) -> Self {
        Self {
            auth,
            tokens: StdMutex::new(tokens),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    pub fn set_tokens(&self, tokens: Tokens) {
        *self.tokens.lock().unwrap() = Some(tokens);
    }

    pub fn clear_tokens(&self) {
        *self.tokens.lock().unwrap() = None;
    }

    /// Run `op`; on an `Unauthenticated` failure, refresh tokens exactly once
    /// and retry `op` exactly once. The retry's outcome is returned as-is.
    /// Any other failure, or a failure while a refresh is already in flight,
    /// propagates untouched.
    pub async fn with_auth_retry<T, F, Fut>(&self, mut op: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(RpcError::Unauthenticated) => {
                let _gate = match self.refresh_gate.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        log::info!("[auth] refresh already in flight, not retrying");
                        return Err(RpcError::Unauthenticated);
                    }
                };
                log::info!("[auth] call unauthenticated, refreshing tokens");
                match self.auth.refresh_tokens().await {
                    Ok(tokens) => {
                        self.set_tokens(tokens);
                        op().await
                    }
                    Err(e) => {
                        log::warn!("[auth] token refresh failed: {}", e);
                        self.clear_tokens();
                        self.auth.on_auth_invalidated();
                        Err(RpcError::Unauthenticated)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// HTTP-backed auth collaborator hitting the token refresh endpoint.
pub struct HttpAuth {
    http: reqwest::Client,
    refresh_url: String,
    refresh_token: StdMutex<Option<String>>,
    invalidated_tx: std::sync::mpsc::Sender<crate::state::AppEvent>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

impl HttpAuth {
    pub fn new(
        base_url: &str,
        refresh_token: Option<String>,
        invalidated_tx: std::sync::mpsc::Sender<crate::state::AppEvent>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            refresh_url: format!("{}/auth/refresh", base_url.trim_end_matches('/')),
            refresh_token: StdMutex::new(refresh_token),
            invalidated_tx,
        }
    }
}

impl AuthProvider for HttpAuth {
    fn refresh_tokens(&self) -> BoxFuture<'static, Result<Tokens, String>> {
        let http = self.http.clone();
        let url = self.refresh_url.clone();
        let refresh_token = self.refresh_token.lock().unwrap().clone();
        Box::pin(async move {
            let refresh_token = refresh_token.ok_or("no refresh token stored")?;
            let resp = http
                .post(&url)
                .json(&serde_json::json!({ "refresh_token": refresh_token }))
                .send()
                .await
                .map_err(|e| format!("refresh request failed: {}", e))?
                .error_for_status()
                .map_err(|e| format!("refresh rejected: {}", e))?
                .json::<RefreshResponse>()
                .await
                .map_err(|e| format!("invalid refresh response: {}", e))?;
            let tokens = Tokens {
                access_token: resp.access_token,
                refresh_token: resp.refresh_token,
            };
            let _ = save_tokens(&tokens);
            Ok(tokens)
        })
    }

    fn on_auth_invalidated(&self) {
        let _ = delete_tokens();
        let _ = self.invalidated_tx.send(crate::state::AppEvent::AuthInvalidated);
    }
}

fn tokens_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Plume").join("tokens.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".plume").join("tokens.json"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn load_tokens() -> Option<Tokens> {
    let path = tokens_path().ok()?;
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

pub fn save_tokens(tokens: &Tokens) -> Result<(), String> {
    let path = tokens_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create token dir: {}", e))?;
    }
    let json = serde_json::to_string(tokens)
        .map_err(|e| format!("Failed to serialize tokens: {}", e))?;
    fs::write(&path, json).map_err(|e| format!("Failed to write tokens: {}", e))
}

pub fn delete_tokens() -> Result<(), String> {
    let path = tokens_path()?;
    if path.exists() {
        fs::remove_file(&path).map_err(|e| format!("Failed to delete tokens: {}", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct MockAuth {
        refresh_calls: AtomicUsize,
        refresh_ok: bool,
        invalidated: AtomicBool,
        /// When set, refresh blocks until notified (simulates a slow refresh).
        gate: Option<Arc<Notify>>,
    }

    impl MockAuth {
        fn new(refresh_ok: bool) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_ok,
                invalidated: AtomicBool::new(false),
                gate: None,
            }
        }
    }

    impl AuthProvider for MockAuth {
        fn refresh_tokens(&self) -> BoxFuture<'static, Result<Tokens, String>> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let ok = self.refresh_ok;
            let gate = self.gate.clone();
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if ok {
                    Ok(Tokens {
                        access_token: "fresh".into(),
                        refresh_token: "fresh-r".into(),
                    })
                } else {
                    Err("refresh denied".into())
                }
            })
        }

        fn on_auth_invalidated(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn retries_exactly_once_after_successful_refresh() {
        let auth = Arc::new(MockAuth::new(true));
        let client = RpcClient::new(auth.clone(), None);
        let attempts = AtomicUsize::new(0);

        let result = client
            .with_auth_retry(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(RpcError::Unauthenticated)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn second_unauthenticated_failure_is_not_retried_again() {
        let auth = Arc::new(MockAuth::new(true));
        let client = RpcClient::new(auth.clone(), None);
        let attempts = AtomicUsize::new(0);

        let result: Result<i32, _> = client
            .with_auth_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::Unauthenticated) }
            })
            .await;

        assert_eq!(result, Err(RpcError::Unauthenticated));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(!auth.invalidated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn refresh_failure_signals_invalidated_and_propagates() {
        let auth = Arc::new(MockAuth::new(false));
        let client = RpcClient::new(
            auth.clone(),
            Some(Tokens {
                access_token: "stale".into(),
                refresh_token: "stale-r".into(),
            }),
        );
        let attempts = AtomicUsize::new(0);

        let result: Result<i32, _> = client
            .with_auth_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::Unauthenticated) }
            })
            .await;

        assert_eq!(result, Err(RpcError::Unauthenticated));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(auth.invalidated.load(Ordering::SeqCst));
        assert!(client.access_token().is_none());
    }

    #[tokio::test]
    async fn non_auth_errors_are_never_retried() {
        let auth = Arc::new(MockAuth::new(true));
        let client = RpcClient::new(auth.clone(), None);
        let attempts = AtomicUsize::new(0);

        let result: Result<i32, _> = client
            .with_auth_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::Transport("connection reset".into())) }
            })
            .await;

        assert_eq!(result, Err(RpcError::Transport("connection reset".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_failures_do_not_trigger_a_second_refresh() {
        let gate = Arc::new(Notify::new());
        let mut auth = MockAuth::new(true);
        auth.gate = Some(gate.clone());
        let auth = Arc::new(auth);
        let client = Arc::new(RpcClient::new(auth.clone(), None));

        // First caller fails and enters the (blocked) refresh.
        let client_a = client.clone();
        let attempts_a = Arc::new(AtomicUsize::new(0));
        let attempts_a2 = attempts_a.clone();
        let first = tokio::spawn(async move {
            client_a
                .with_auth_retry(move || {
                    let n = attempts_a2.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(RpcError::Unauthenticated)
                        } else {
                            Ok(1)
                        }
                    }
                })
                .await
        });
        // Let the first caller reach the refresh await.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // Second caller fails while the refresh is in flight: original error
        // propagates, no second refresh.
        let result: Result<i32, _> = client
            .with_auth_retry(|| async { Err(RpcError::Unauthenticated) })
            .await;
        assert_eq!(result, Err(RpcError::Unauthenticated));
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first, Ok(1));
        assert_eq!(attempts_a.load(Ordering::SeqCst), 2);
    }
}
