//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smartnote_core::ratelimit::{Tier, TierLimit};

/// Directory name under the platform data root.
pub const APP_DIR_NAME: &str = "DentalAssistant";
const SETTINGS_FILE: &str = "settings.json";
const RATE_LIMIT_DB_FILE: &str = "rate_limits.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub transcription_language: String,
    pub llm_max_concurrency: usize,
    pub llm_queue_timeout_secs: u64,
    pub whisper_concurrency: usize,
    pub rag_concurrency: usize,
    pub rag_top_k: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_heavy: String,
    pub rate_limit_moderate: String,
    pub rate_limit_light: String,
    /// Share rate-limit buckets between processes through a SQLite file in
    /// the data directory.
    pub shared_rate_limits: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            transcription_language: "fr".into(),
            llm_max_concurrency: 1,
            llm_queue_timeout_secs: 120,
            whisper_concurrency: 1,
            rag_concurrency: 2,
            rag_top_k: 5,
            rate_limit_enabled: true,
            rate_limit_heavy: Tier::Heavy.default_limit().to_string(),
            rate_limit_moderate: Tier::Moderate.default_limit().to_string(),
            rate_limit_light: Tier::Light.default_limit().to_string(),
            shared_rate_limits: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.transcription_language = normalize_language(&self.transcription_language);
        self.llm_max_concurrency = self.llm_max_concurrency.clamp(1, 8);
        self.llm_queue_timeout_secs = self.llm_queue_timeout_secs.clamp(1, 3600);
        self.whisper_concurrency = self.whisper_concurrency.clamp(1, 4);
        self.rag_concurrency = self.rag_concurrency.clamp(1, 16);
        self.rag_top_k = self.rag_top_k.clamp(1, 50);
        self.rate_limit_heavy = normalize_tier_limit(&self.rate_limit_heavy, Tier::Heavy);
        self.rate_limit_moderate = normalize_tier_limit(&self.rate_limit_moderate, Tier::Moderate);
        self.rate_limit_light = normalize_tier_limit(&self.rate_limit_light, Tier::Light);
    }

    fn tier_limit(&self, tier: Tier) -> &str {
        match tier {
            Tier::Heavy => &self.rate_limit_heavy,
            Tier::Moderate => &self.rate_limit_moderate,
            Tier::Light => &self.rate_limit_light,
        }
    }

    /// Environment variables the backend config reads, as set by these
    /// settings.
    pub fn runtime_env(&self, data_dir: &Path) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("WHISPER_LANGUAGE", self.transcription_language.clone()),
            ("LLM_MAX_CONCURRENCY", self.llm_max_concurrency.to_string()),
            ("LLM_QUEUE_TIMEOUT_SECS", self.llm_queue_timeout_secs.to_string()),
            ("WHISPER_CONCURRENCY", self.whisper_concurrency.to_string()),
            ("RAG_CONCURRENCY", self.rag_concurrency.to_string()),
            ("RAG_TOP_K", self.rag_top_k.to_string()),
            (
                "RATE_LIMIT_ENABLED",
                if self.rate_limit_enabled { "1" } else { "0" }.into(),
            ),
        ];
        for tier in Tier::ALL {
            env.push((tier.env_key(), self.tier_limit(tier).to_string()));
        }
        if self.shared_rate_limits {
            env.push((
                "RATE_LIMIT_DB",
                data_dir.join(RATE_LIMIT_DB_FILE).display().to_string(),
            ));
        }
        env
    }
}

pub fn normalize_language(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "fr" | "fra" | "french" | "francais" => "fr".into(),
        "en" | "eng" | "english" => "en".into(),
        "auto" => "auto".into(),
        other if other.len() == 2 && other.chars().all(|c| c.is_ascii_alphabetic()) => {
            other.into()
        }
        _ => "fr".into(),
    }
}

fn normalize_tier_limit(raw: &str, tier: Tier) -> String {
    raw.trim()
        .parse::<TierLimit>()
        .unwrap_or_else(|_| tier.default_limit())
        .to_string()
}

/// Export settings to the process environment. Variables already set
/// explicitly win over the settings file.
pub fn apply_runtime_env_from_settings(settings: &AppSettings, data_dir: &Path) {
    for (key, value) in settings.runtime_env(data_dir) {
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("Library")
            .join("Application Support")
            .join(APP_DIR_NAME)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join(APP_DIR_NAME)
    }
}

pub fn default_settings_path() -> PathBuf {
    default_data_dir().join(SETTINGS_FILE)
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartnote_core::BackendConfig;

    fn temp_settings_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("smartnote-settings-{tag}-{}", std::process::id()))
            .join(SETTINGS_FILE)
    }

    #[test]
    fn normalize_clamps_and_repairs() {
        let mut s = AppSettings {
            transcription_language: " French ".into(),
            llm_max_concurrency: 0,
            rag_top_k: 500,
            rate_limit_heavy: "six per minute".into(),
            rate_limit_light: " 200/30 ".into(),
            ..AppSettings::default()
        };
        s.normalize();
        assert_eq!(s.transcription_language, "fr");
        assert_eq!(s.llm_max_concurrency, 1);
        assert_eq!(s.rag_top_k, 50);
        assert_eq!(s.rate_limit_heavy, "6/60");
        assert_eq!(s.rate_limit_light, "200/30");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: AppSettings =
            serde_json::from_str(r#"{"llmMaxConcurrency": 3}"#).expect("parse settings");
        assert_eq!(s.llm_max_concurrency, 3);
        assert_eq!(s.rag_concurrency, 2);
        assert!(s.rate_limit_enabled);
    }

    #[test]
    fn runtime_env_round_trips_through_backend_config() {
        let s = AppSettings {
            llm_max_concurrency: 2,
            rate_limit_enabled: false,
            rate_limit_heavy: "3/10".into(),
            shared_rate_limits: true,
            ..AppSettings::default()
        };
        let data_dir = PathBuf::from("/var/lib/smartnote");
        let env = s.runtime_env(&data_dir);
        let cfg = BackendConfig::from_lookup(|key| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        });

        assert_eq!(cfg.llm_max_concurrency, 2);
        assert!(!cfg.rate_limit_enabled);
        assert_eq!(cfg.rate_limits.get(Tier::Heavy), TierLimit::new(3, 10));
        assert_eq!(cfg.rate_limit_db, Some(data_dir.join(RATE_LIMIT_DB_FILE)));
        assert_eq!(cfg.transcription_language, "fr");
    }

    #[test]
    fn process_local_buckets_set_no_db_path() {
        let env = AppSettings::default().runtime_env(Path::new("/data"));
        assert!(env.iter().all(|(k, _)| *k != "RATE_LIMIT_DB"));
    }

    #[test]
    fn save_then_load_restores_settings() {
        let path = temp_settings_path("persist");
        let s = AppSettings {
            whisper_concurrency: 2,
            shared_rate_limits: true,
            ..AppSettings::default()
        };
        save_settings(&path, &s).expect("save");
        let raw = fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("\"whisperConcurrency\": 2"));
        assert_eq!(load_settings(&path), s);
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let path = temp_settings_path("missing").join("nope.json");
        assert_eq!(load_settings(&path), AppSettings::default());
    }
}
