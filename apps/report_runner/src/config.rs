use std::{collections::HashMap, fs, path::Path, time::Duration};

use funnel_jobs::{QueueSettings, RateFormat};
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "report_runner.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub debounce_ms: u64,
    pub fetch_timeout_secs: u64,
    pub rate_format: RateFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api".into(),
            debounce_ms: 500,
            fetch_timeout_secs: 30,
            rate_format: RateFormat::Truncated,
        }
    }
}

impl Settings {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            debounce_window: Duration::from_millis(self.debounce_ms),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            rate_format: self.rate_format,
        }
    }
}

/// Defaults, then the settings file (if present), then `APP__*` environment variables.
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| {
                file_cfg.get(key).map(|value| match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }),
            Err(error) => warn!(path = %path.display(), %error, "ignoring unreadable settings file"),
        }
    }

    apply_overrides(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

pub(crate) fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_url") {
        settings.api_url = v.trim().to_string();
    }
    if let Some(v) = lookup("debounce_ms") {
        match v.trim().parse() {
            Ok(parsed) => settings.debounce_ms = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid debounce_ms"),
        }
    }
    if let Some(v) = lookup("fetch_timeout_secs") {
        match v.trim().parse() {
            Ok(parsed) if parsed > 0 => settings.fetch_timeout_secs = parsed,
            _ => warn!(value = %v, "ignoring invalid fetch_timeout_secs"),
        }
    }
    if let Some(v) = lookup("rate_format") {
        match v.parse() {
            Ok(parsed) => settings.rate_format = parsed,
            Err(error) => warn!(%error, "ignoring invalid rate_format"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
