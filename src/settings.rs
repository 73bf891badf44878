use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// WebSocket endpoint of the streaming transcription service.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Base URL for unary calls (records, settings, token refresh).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub mic_device: String,
    /// User dictionary sent with every context snapshot.
    #[serde(default)]
    pub vocabulary: Vec<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            api_url: default_api_url(),
            model: default_model(),
            language: default_language(),
            mic_device: String::new(),
            vocabulary: Vec::new(),
            mode: default_mode(),
        }
    }
}

impl Settings {
    pub fn mode(&self) -> crate::state::Mode {
        match self.mode.as_str() {
            "action" => crate::state::Mode::Action,
            _ => crate::state::Mode::Dictation,
        }
    }
}

fn default_stream_url() -> String {
    "wss://api.plume.dev/v1/stream".into()
}
fn default_api_url() -> String {
    "https://api.plume.dev/v1".into()
}
fn default_model() -> String {
    "plume-general".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_mode() -> String {
    "dictation".into()
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Plume").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".plume").join("settings.json"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn load() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(&path, json).map_err(|e| format!("Failed to write settings: {}", e))
}
