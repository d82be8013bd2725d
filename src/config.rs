// =============================================================================
// Service configuration — environment-driven settings
// =============================================================================
//
// Every tunable lives here and is read once at startup. Unknown or
// malformed values fall back to defaults with a warning so that a typo in
// one variable never prevents the service from starting.
// =============================================================================

use serde::Serialize;
use tracing::warn;

use crate::types::{InitMode, ProviderChoice};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(var = key, value = %v, "unparseable integer, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Top-level settings, assembled from the environment at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    // --- Redis (system of record) --------------------------------------------
    pub redis_url: String,
    pub redis_max_connections: u32,
    pub redis_connect_timeout_secs: u64,
    pub redis_socket_timeout_secs: u64,

    // --- Upstream providers --------------------------------------------------
    pub tushare_token: String,
    pub realtime_provider: ProviderChoice,
    /// Realtime snapshot cadence during the trading session, in minutes.
    pub realtime_update_interval_min: u64,
    pub realtime_auto_switch: bool,

    // --- API surface ---------------------------------------------------------
    pub bind_addr: String,
    pub api_token: String,
    pub api_token_enabled: bool,

    // --- Lifecycle -----------------------------------------------------------
    pub init_mode: InitMode,
    pub reset_tables: bool,
    pub use_multithreading: bool,
    pub max_threads: usize,

    // --- External news analyser (boundary only) ------------------------------
    pub ai_enabled: bool,
    pub ai_endpoint: String,
    pub ai_model: String,
}

impl Settings {
    /// Read all settings from the environment, applying defaults and legacy
    /// alias handling.
    pub fn from_env() -> Self {
        let host = env_string("REDIS_HOST", "localhost");
        let port = env_u64("REDIS_PORT", 6379);
        let db = env_u64("REDIS_DB", 0);
        let password = env_opt("REDIS_PASSWORD");

        let redis_url = env_opt("REDIS_URL").unwrap_or_else(|| match &password {
            Some(pw) => format!("redis://:{pw}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        });

        let init_mode_raw = env_string("STOCK_INIT_MODE", "skip");
        let init_mode = InitMode::parse(&init_mode_raw).unwrap_or_else(|| {
            warn!(value = %init_mode_raw, "unknown STOCK_INIT_MODE, falling back to skip");
            InitMode::Skip
        });

        let provider_raw = env_string("REALTIME_DATA_PROVIDER", "eastmoney");
        let realtime_provider = ProviderChoice::parse(&provider_raw).unwrap_or_else(|| {
            warn!(value = %provider_raw, "unknown REALTIME_DATA_PROVIDER, using eastmoney");
            ProviderChoice::Eastmoney
        });

        Self {
            redis_url,
            redis_max_connections: env_u64("REDIS_MAX_CONNECTIONS", 50) as u32,
            redis_connect_timeout_secs: env_u64("REDIS_SOCKET_CONNECT_TIMEOUT", 10),
            redis_socket_timeout_secs: env_u64("REDIS_SOCKET_TIMEOUT", 10),

            tushare_token: env_string("TUSHARE_TOKEN", ""),
            realtime_provider,
            realtime_update_interval_min: env_u64("REALTIME_UPDATE_INTERVAL", 15).max(1),
            realtime_auto_switch: env_bool("REALTIME_AUTO_SWITCH", true),

            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8000"),
            api_token: env_string("API_TOKEN", ""),
            api_token_enabled: env_bool("API_TOKEN_ENABLED", false),

            init_mode,
            reset_tables: env_bool("RESET_TABLES", false),
            use_multithreading: env_bool("USE_MULTITHREADING", false),
            max_threads: env_u64("MAX_THREADS", 5).clamp(1, 64) as usize,

            ai_enabled: env_bool("AI_ENABLED", true),
            ai_endpoint: env_string("DEFAULT_AI_ENDPOINT", ""),
            ai_model: env_string("DEFAULT_AI_MODEL", "gpt-3.5-turbo"),
        }
    }

    /// Log level string for the tracing subscriber when `RUST_LOG` is unset.
    pub fn log_level() -> String {
        env_string("LOG_LEVEL", "info").to_lowercase()
    }
}
