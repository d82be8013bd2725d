// =============================================================================
// A-share market data intelligence service — main entry point
// =============================================================================
//
// Boot order: env + logging, Redis connection, component graph wiring,
// optional keyspace reset, API server, scheduler (startup mode from
// STOCK_INIT_MODE), background sweeps, then block on Ctrl+C for a
// graceful stop.
// =============================================================================

mod api;
mod app_state;
mod calendar;
mod config;
mod error;
mod model;
mod news;
mod providers;
mod realtime;
mod scheduler;
mod store;
mod strategy;
mod types;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Settings;
use crate::scheduler::Scheduler;
use crate::store::kv::{KvStore, RedisKv};
use crate::store::keys;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Settings::log_level())),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        bind = %settings.bind_addr,
        init_mode = %settings.init_mode,
        provider = %settings.realtime_provider,
        "service starting"
    );

    // ── 2. Redis (system of record) ──────────────────────────────────────
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(
            &settings.redis_url,
            Duration::from_secs(settings.redis_connect_timeout_secs),
        )
        .await
        .map_err(|e| anyhow::anyhow!("redis connection failed: {e}"))?,
    );

    // ── 3. Optional keyspace reset ───────────────────────────────────────
    if settings.reset_tables {
        reset_namespaced_keys(kv.as_ref()).await;
    }

    // ── 4. Component graph ───────────────────────────────────────────────
    let state = AppState::new(settings, kv);

    // ── 5. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.settings.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server stopped");
        }
    });

    // ── 6. Scheduler & lifecycle ─────────────────────────────────────────
    let scheduler = Scheduler::new(state.clone(), state.settings.init_mode);
    state.attach_scheduler(scheduler.clone());
    scheduler.clone().start();

    // ── 7. WebSocket housekeeping sweep ──────────────────────────────────
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = sweep_state.hub.cleanup_inactive();
            if removed > 0 {
                info!(removed, "inactive websocket clients dropped");
            }
        }
    });

    info!("all subsystems running");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    scheduler.stop();
    // Give in-flight jobs one I/O boundary to observe the cancellation.
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("shutdown complete");
    Ok(())
}

/// `RESET_TABLES=true`: delete only the namespaced keys this service owns.
/// A shared Redis instance must survive a re-initialisation, so this never
/// flushes the whole database.
async fn reset_namespaced_keys(kv: &dyn KvStore) {
    warn!("RESET_TABLES is set, clearing namespaced keys");

    let fixed = [
        keys::STOCK_CODES_ALL,
        keys::STOCK_LIST,
        keys::ETF_CODES_ALL,
        keys::STOCK_REALTIME,
        keys::BUY_SIGNALS,
        keys::NEWS_LATEST,
        keys::SIGNAL_MIGRATION_FLAG,
    ];
    for key in fixed {
        if let Err(e) = kv.del(key).await {
            warn!(key, error = %e, "reset: delete failed");
        }
    }

    for prefix in ["stock_trend:", "etf_trend:", keys::CHART_PREFIX, keys::EXEC_LOG_PREFIX] {
        match kv.scan_prefix(prefix).await {
            Ok(found) => {
                let count = found.len();
                for key in found {
                    let _ = kv.del(&key).await;
                }
                info!(prefix, count, "reset: prefix cleared");
            }
            Err(e) => warn!(prefix, error = %e, "reset: scan failed"),
        }
    }
}
