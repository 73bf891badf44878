use plume::capture::MicCapture;
use plume::context::SettingsContext;
use plume::manager::SessionManager;
use plume::rpc::auth::{load_tokens, HttpAuth, RpcClient};
use plume::rpc::records::RecordsApi;
use plume::rpc::ws::WsTranscriber;
use plume::session::StreamSessionController;
use plume::settings;
use plume::state::{AppEvent, AppState};
use plume::typing::KeyboardSink;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn main() {
    env_logger::init();

    let settings = settings::load();
    let app_state = Arc::new(AppState::new());
    let (event_tx, event_rx) = std::sync::mpsc::channel::<AppEvent>();
    let runtime =
        Arc::new(tokio::runtime::Runtime::new().expect("Failed to create tokio runtime"));

    let tokens = load_tokens();
    if tokens.is_none() {
        log::warn!("[plume] no stored tokens; remote calls will fail until sign-in");
    }
    let auth = Arc::new(HttpAuth::new(
        &settings.api_url,
        tokens.as_ref().map(|t| t.refresh_token.clone()),
        event_tx.clone(),
    ));
    let client = Arc::new(RpcClient::new(auth, tokens));
    let records = RecordsApi::new(&settings.api_url, client.clone());
    let service = Arc::new(WsTranscriber::new(settings.stream_url.clone(), client.clone()));

    // Merge server-side vocabulary/model settings over local ones.
    // Best-effort: offline startup just uses what is on disk.
    let (vocabulary, model, language) = {
        let records = records.clone();
        let local = settings.clone();
        runtime.block_on(async move {
            match records.fetch_settings().await {
                Ok(remote) => {
                    let mut vocabulary = local.vocabulary.clone();
                    for term in remote.vocabulary {
                        if !vocabulary.contains(&term) {
                            vocabulary.push(term);
                        }
                    }
                    let model = if remote.model.is_empty() {
                        local.model.clone()
                    } else {
                        remote.model
                    };
                    let language = if remote.language.is_empty() {
                        local.language.clone()
                    } else {
                        remote.language
                    };
                    (vocabulary, model, language)
                }
                Err(e) => {
                    log::warn!("[plume] settings sync failed: {}", e);
                    (
                        local.vocabulary.clone(),
                        local.model.clone(),
                        local.language.clone(),
                    )
                }
            }
        })
    };

    let context = Arc::new(SettingsContext::new(vocabulary, model, language));
    let controller = Arc::new(StreamSessionController::new(
        service,
        client.clone(),
        context,
    ));
    let mic_device = if settings.mic_device.is_empty() {
        None
    } else {
        Some(settings.mic_device.clone())
    };
    let manager = Arc::new(SessionManager::new(
        controller,
        Arc::new(MicCapture::new()),
        Arc::new(KeyboardSink),
        Arc::new(records),
        mic_device,
    ));

    plume::hotkey::start_listener(app_state.clone(), event_tx.clone());
    log::info!("[plume] hotkeys active, hold Right Ctrl to dictate");

    let mode = settings.mode();
    for event in event_rx {
        match event {
            AppEvent::HotkeyPush => {
                let manager = manager.clone();
                // Starting is quick (the stream connects on its own task);
                // block so a fast release cannot overtake the start.
                if let Err(e) = runtime.block_on(manager.start_session(mode)) {
                    log::error!("[plume] failed to start session: {}", e);
                }
            }
            AppEvent::HotkeyRelease => {
                let manager = manager.clone();
                runtime.spawn(async move {
                    match manager.complete_session().await {
                        Ok(Some(text)) => {
                            log::info!("[plume] inserted {} chars", text.len())
                        }
                        Ok(None) => {}
                        Err(e) => log::error!("[plume] session failed: {}", e),
                    }
                });
            }
            AppEvent::AuthInvalidated => {
                log::error!("[plume] authentication invalidated, disarming");
                app_state.armed.store(false, Ordering::SeqCst);
                let manager = manager.clone();
                runtime.spawn(async move {
                    manager.cancel_session().await;
                });
            }
            AppEvent::StatusUpdate { status, message } => {
                log::info!("[plume] {}: {}", status, message);
            }
        }
    }
}
