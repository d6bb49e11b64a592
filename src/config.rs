// =============================================================================
// Configuration — process env (EngineConfig) + hot-reloadable runtime knobs
// =============================================================================
//
// Two tiers, per SPEC_FULL.md §10.C: `EngineConfig` is read once from the
// environment at startup (the teacher's `main.rs` env-var reads, generalized
// to every variable in §6); `RuntimeConfig` is the hot-reloadable half,
// persisted with the teacher's atomic tmp+rename write from
// `runtime_config.rs`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide configuration, resolved once at startup and immutable for
/// the process lifetime (§6 Configuration).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub broker_base_url: String,
    pub broker_username: String,
    pub broker_api_key: String,
    pub database_url: String,
    pub http_listen_addr: String,
    pub stream_listen_addr: String,
    pub dashboard_auth_token: String,
    pub discord_webhook_url: Option<String>,
    pub eod_flatten_local_time: String,
    pub exchange_tz: String,
    pub risk_auto_flatten_on_violation: bool,
    pub rate_limit_per_sec: u32,
    pub max_concurrent_tasks: u32,
    pub bar_cache_ttl_rth_secs: u64,
    pub bar_cache_ttl_off_secs: u64,
}

impl EngineConfig {
    /// Load from the process environment (after `.env` has been applied by
    /// the caller), falling back to the documented defaults for optional
    /// fields.
    pub fn from_env() -> Self {
        Self {
            broker_base_url: env_or("BROKER_BASE_URL", "https://api.topstepx.com"),
            broker_username: env_or("BROKER_USERNAME", ""),
            broker_api_key: env_or("BROKER_API_KEY", ""),
            database_url: env_or("DATABASE_URL", "engine_state.sqlite3"),
            http_listen_addr: env_or("HTTP_LISTEN_ADDR", "0.0.0.0:3001"),
            stream_listen_addr: env_or("STREAM_LISTEN_ADDR", "0.0.0.0:3001"),
            dashboard_auth_token: env_or("DASHBOARD_AUTH_TOKEN", ""),
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
            eod_flatten_local_time: env_or("EOD_FLATTEN_LOCAL_TIME", "16:00"),
            exchange_tz: env_or("EXCHANGE_TZ", "America/Chicago"),
            risk_auto_flatten_on_violation: env_bool("RISK_AUTO_FLATTEN_ON_VIOLATION", true),
            rate_limit_per_sec: env_num("RATE_LIMIT_PER_SEC", 30),
            max_concurrent_tasks: env_num("MAX_CONCURRENT_TASKS", 20),
            bar_cache_ttl_rth_secs: env_num("BAR_CACHE_TTL_RTH", 30),
            bar_cache_ttl_off_secs: env_num("BAR_CACHE_TTL_OFF", 600),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_loss_trail_pct() -> f64 {
    6.0
}

/// Hot-reloadable, account-independent runtime knobs. Per-account strategy
/// parameters live in `domain::StrategyConfig` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Default DLL as a percentage of starting capital, used when an
    /// account has no explicit override in the durable store.
    #[serde(default = "default_max_daily_loss_pct")]
    pub default_max_daily_loss_pct: f64,

    /// Default MLL (trailing) as a percentage of starting capital.
    #[serde(default = "default_max_loss_trail_pct")]
    pub default_max_loss_trail_pct: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            default_max_daily_loss_pct: default_max_daily_loss_pct(),
            default_max_loss_trail_pct: default_max_loss_trail_pct(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist via atomic tmp-file + rename, matching the teacher's
    /// crash-safe write pattern.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Load from `path`, falling back to defaults with a warning if the
    /// file is absent or unparseable (mirrors `main.rs`'s startup fallback).
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %err, "runtime config not found or invalid, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.auto_reconnect);
        assert!((cfg.default_max_daily_loss_pct - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_save_and_load() {
        let dir = std::env::temp_dir().join(format!("engine-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let cfg = RuntimeConfig { auto_reconnect: false, ..RuntimeConfig::default() };
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!(!loaded.auto_reconnect);

        std::fs::remove_dir_all(&dir).ok();
    }
}
