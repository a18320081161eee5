//! Backend configuration.
//!
//! Every knob has a compiled-in default and an optional environment
//! override. Unparseable overrides are logged and ignored, never fatal.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::inference::GenerationParams;
use crate::pool::PoolConfig;
use crate::ratelimit::{MemoryStore, RateLimitStore, RateLimiter, Tier, TierLimit, TierLimits};
use crate::summarize::ChunkingConfig;

pub const WHISPER_POOL: &str = "whisper";
pub const RAG_POOL: &str = "rag";

pub const DEFAULT_LANGUAGE: &str = "fr";

const LLM_MAX_CONCURRENCY_CAP: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub llm_max_concurrency: usize,
    pub llm_queue_timeout: Duration,
    pub whisper: PoolConfig,
    pub rag: PoolConfig,
    pub rate_limit_enabled: bool,
    pub rate_limits: TierLimits,
    /// Shared store path; `None` keeps buckets in process memory.
    pub rate_limit_db: Option<PathBuf>,
    pub chunking: ChunkingConfig,
    pub generation: GenerationParams,
    pub transcription_language: String,
    pub rag_top_k: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_max_concurrency: 1,
            llm_queue_timeout: Duration::from_secs(120),
            whisper: PoolConfig::new(
                WHISPER_POOL,
                "Audio transcription (faster-whisper)",
                1,
                Duration::from_secs(180),
            ),
            rag: PoolConfig::new(
                RAG_POOL,
                "RAG embedding & retrieval",
                2,
                Duration::from_secs(60),
            ),
            rate_limit_enabled: true,
            rate_limits: TierLimits::default(),
            rate_limit_db: None,
            chunking: ChunkingConfig::default(),
            generation: GenerationParams::default(),
            transcription_language: DEFAULT_LANGUAGE.to_string(),
            rag_top_k: 5,
        }
    }
}

impl BackendConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(key)`, which returns the raw value of
    /// an environment-style variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(n) = parsed::<usize, _>(&lookup, "LLM_MAX_CONCURRENCY") {
            cfg.llm_max_concurrency = n.clamp(1, LLM_MAX_CONCURRENCY_CAP);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "LLM_QUEUE_TIMEOUT_SECS") {
            cfg.llm_queue_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed::<usize, _>(&lookup, "WHISPER_CONCURRENCY") {
            cfg.whisper.concurrency = n.max(1);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "WHISPER_TIMEOUT_SECS") {
            cfg.whisper.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed::<usize, _>(&lookup, "RAG_CONCURRENCY") {
            cfg.rag.concurrency = n.max(1);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "RAG_TIMEOUT_SECS") {
            cfg.rag.timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(raw) = lookup("RATE_LIMIT_ENABLED") {
            match parse_flag(&raw) {
                Some(on) => cfg.rate_limit_enabled = on,
                None => warn!(key = "RATE_LIMIT_ENABLED", value = %raw, "ignoring invalid flag"),
            }
        }
        for tier in Tier::ALL {
            if let Some(limit) = parsed::<TierLimit, _>(&lookup, tier.env_key()) {
                cfg.rate_limits.set(tier, limit);
            }
        }
        cfg.rate_limit_db = lookup("RATE_LIMIT_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(lang) = lookup("WHISPER_LANGUAGE")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
        {
            cfg.transcription_language = lang;
        }
        if let Some(k) = parsed::<usize, _>(&lookup, "RAG_TOP_K") {
            cfg.rag_top_k = k.clamp(1, 50);
        }

        cfg
    }

    pub fn pool_configs(&self) -> Vec<PoolConfig> {
        vec![self.whisper.clone(), self.rag.clone()]
    }

    /// Build the limiter with the configured store.
    ///
    /// # Errors
    /// Fails if the shared store cannot be opened.
    pub fn build_rate_limiter(&self) -> Result<RateLimiter> {
        let store: Box<dyn RateLimitStore> = match &self.rate_limit_db {
            #[cfg(feature = "sqlite-store")]
            Some(path) => Box::new(crate::ratelimit::SqliteStore::new(path.clone())?),
            #[cfg(not(feature = "sqlite-store"))]
            Some(path) => {
                warn!(
                    path = %path.display(),
                    "RATE_LIMIT_DB set but built without sqlite-store, using process-local buckets"
                );
                Box::new(MemoryStore::new())
            }
            None => Box::new(MemoryStore::new()),
        };
        Ok(RateLimiter::new(
            self.rate_limit_enabled,
            self.rate_limits,
            store,
        ))
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid config value");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> BackendConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackendConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.llm_max_concurrency, 1);
        assert_eq!(cfg.llm_queue_timeout, Duration::from_secs(120));
        assert_eq!(cfg.whisper.concurrency, 1);
        assert_eq!(cfg.whisper.timeout, Duration::from_secs(180));
        assert_eq!(cfg.rag.concurrency, 2);
        assert_eq!(cfg.rag.timeout, Duration::from_secs(60));
        assert_eq!(cfg.rate_limits.heavy, TierLimit::new(6, 60));
        assert!(cfg.rate_limit_enabled);
        assert_eq!(cfg.transcription_language, "fr");
    }

    #[test]
    fn overrides_apply_and_clamp() {
        let cfg = from_pairs(&[
            ("LLM_MAX_CONCURRENCY", "64"),
            ("WHISPER_CONCURRENCY", "3"),
            ("RAG_CONCURRENCY", "0"),
            ("RATE_LIMIT_ENABLED", "false"),
            ("RATE_LIMIT_HEAVY", "2/10"),
            ("RATE_LIMIT_DB", "/tmp/rl.db"),
            ("WHISPER_LANGUAGE", "EN"),
        ]);
        assert_eq!(cfg.llm_max_concurrency, 8);
        assert_eq!(cfg.whisper.concurrency, 3);
        assert_eq!(cfg.rag.concurrency, 1);
        assert!(!cfg.rate_limit_enabled);
        assert_eq!(cfg.rate_limits.heavy, TierLimit::new(2, 10));
        assert_eq!(cfg.rate_limits.light, TierLimit::new(120, 60));
        assert_eq!(cfg.rate_limit_db, Some(PathBuf::from("/tmp/rl.db")));
        assert_eq!(cfg.transcription_language, "en");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = from_pairs(&[
            ("LLM_MAX_CONCURRENCY", "many"),
            ("RATE_LIMIT_ENABLED", "maybe"),
            ("RATE_LIMIT_MODERATE", "30 per minute"),
            ("RATE_LIMIT_DB", "   "),
        ]);
        assert_eq!(cfg, BackendConfig::default());
    }

    #[test]
    fn pool_configs_are_whisper_then_rag() {
        let names: Vec<String> = BackendConfig::default()
            .pool_configs()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec![WHISPER_POOL, RAG_POOL]);
    }
}
