use crate::control_queue::ModelSettings;
use crate::state::Mode;
use futures_util::future::BoxFuture;

/// Environmental context sent to the server so transcription can adapt to
/// the active application and the user's vocabulary. Every field is
/// best-effort optional.
#[derive(Debug, Clone, Default)]
pub struct GatheredContext {
    pub window_title: Option<String>,
    pub app_name: Option<String>,
    pub selected_text: Option<String>,
    pub vocabulary: Vec<String>,
    pub model_settings: Option<ModelSettings>,
}

/// Context collaborator. Implementations must never block the audio path;
/// gathering runs on its own task and failures leave fields unset.
pub trait ContextSource: Send + Sync {
    fn gather(&self, mode: Mode) -> BoxFuture<'static, Result<GatheredContext, String>>;
}

/// Context source backed by local settings: user vocabulary and model
/// parameters. The native active-window and selected-text probes are
/// separate platform collaborators; when absent, those fields stay unset and
/// the server transcribes without them.
pub struct SettingsContext {
    vocabulary: Vec<String>,
    model_settings: ModelSettings,
}

impl SettingsContext {
    pub fn new(vocabulary: Vec<String>, model: String, language: String) -> Self {
        Self {
            vocabulary,
            model_settings: ModelSettings { model, language },
        }
    }
}

impl ContextSource for SettingsContext {
    fn gather(&self, mode: Mode) -> BoxFuture<'static, Result<GatheredContext, String>> {
        let vocabulary = self.vocabulary.clone();
        let model_settings = self.model_settings.clone();
        Box::pin(async move {
            log::debug!(
                "[context] gathering for mode={} ({} vocabulary terms)",
                mode.as_str(),
                vocabulary.len()
            );
            Ok(GatheredContext {
                window_title: None,
                app_name: None,
                selected_text: None,
                vocabulary,
                model_settings: Some(model_settings),
            })
        })
    }
}
