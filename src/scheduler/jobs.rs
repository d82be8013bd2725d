// =============================================================================
// Job bodies
// =============================================================================
//
// Each job drives its I/O sequentially through the shared components;
// symbol-level fan-out is opt-in via a bounded concurrent stream when
// `USE_MULTITHREADING` is set. Provider failures on one symbol are logged
// and the job continues with the next; a `not_ready` gate result skips
// the whole run.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::calendar::compact_date;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{SymbolInfo, UPDATE_TYPE_INCREMENTAL};
use crate::realtime::SnapshotOptions;
use crate::scheduler::{JobKind, JobScope};
use crate::store::keys;
use crate::store::kline::PutOutcome;
use crate::strategy::RecomputeOptions;
use crate::types::ProviderChoice;

/// History window requested on a full refresh, in calendar days.
const HISTORY_WINDOW_DAYS: i64 = 360;

/// Dispatch one job run; returns the number of rows touched.
pub async fn run(
    state: Arc<AppState>,
    kind: JobKind,
    scope: JobScope,
    shutdown: watch::Receiver<bool>,
) -> ServiceResult<u64> {
    match kind {
        JobKind::RefreshSymbolList => refresh_symbol_list(&state, scope).await,
        JobKind::FullBarRefresh => full_bar_refresh(&state, scope, shutdown).await,
        JobKind::SmartBarUpdate => smart_bar_update(&state, scope, shutdown).await,
        JobKind::ComputeSignals => compute_signals(&state, scope).await,
        JobKind::RealtimeSnapshot => realtime_snapshot(&state).await,
        JobKind::NewsCrawl => state.news.refresh().await.map(|n| n as u64),
        JobKind::CleanupCharts => cleanup_charts(&state).await,
    }
}

// -----------------------------------------------------------------------------
// refresh_symbol_list
// -----------------------------------------------------------------------------

async fn refresh_symbol_list(state: &Arc<AppState>, scope: JobScope) -> ServiceResult<u64> {
    let mut rows = 0u64;

    if !scope.etf_only {
        let (records, source) = state
            .fabric
            .call(ProviderChoice::Tushare, |p| Box::pin(async move { p.symbol_master().await }))
            .await?;
        info!(count = records.len(), %source, "symbol master fetched");
        rows += state.registry.store_stocks(records).await? as u64;
    }

    // The ETF leg is best-effort as long as at least one record already
    // exists; a completely empty ETF namespace is worth failing loudly.
    match state.tushare.etf_master().await {
        Ok(records) => {
            rows += state.registry.store_etfs(records).await? as u64;
        }
        Err(e) => {
            let existing = state.registry.load_etfs().await?.len();
            if existing == 0 {
                return Err(e);
            }
            warn!(error = %e, existing, "etf master refresh failed, keeping previous list");
        }
    }

    Ok(rows)
}

// -----------------------------------------------------------------------------
// full_bar_refresh
// -----------------------------------------------------------------------------

async fn universe(state: &Arc<AppState>, scope: JobScope) -> ServiceResult<Vec<SymbolInfo>> {
    let mut symbols = Vec::new();
    if !scope.etf_only {
        symbols.extend(state.registry.load().await?);
    }
    symbols.extend(state.registry.load_etfs().await?);
    Ok(symbols)
}

fn history_range(today: NaiveDate) -> (String, String) {
    let from = today - ChronoDuration::days(HISTORY_WINDOW_DAYS);
    (compact_date(from), compact_date(today))
}

async fn full_bar_refresh(
    state: &Arc<AppState>,
    scope: JobScope,
    shutdown: watch::Receiver<bool>,
) -> ServiceResult<u64> {
    let symbols = universe(state, scope).await?;
    if symbols.is_empty() {
        return Err(ServiceError::NotReady(
            "symbol registry is empty, run refresh_symbol_list first".into(),
        ));
    }

    let (from, to) = history_range(Local::now().date_naive());
    let stored = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let concurrency = if state.settings.use_multithreading {
        state.settings.max_threads
    } else {
        1
    };

    futures_util::stream::iter(symbols)
        .for_each_concurrent(concurrency, |symbol| {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let stored = stored.clone();
            let failed = failed.clone();
            let from = from.clone();
            let to = to.clone();
            async move {
                if *shutdown.borrow() {
                    return;
                }
                match refresh_one_symbol(&state, &symbol.ts_code, &from, &to).await {
                    Ok(true) => {
                        stored.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        debug!(ts_code = %symbol.ts_code, "series rejected as too short");
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        warn!(ts_code = %symbol.ts_code, error = %e, "bar refresh failed");
                    }
                }
            }
        })
        .await;

    if *shutdown.borrow() {
        return Err(ServiceError::Cancelled);
    }

    let stored = stored.load(Ordering::Relaxed);
    info!(
        stored,
        failed = failed.load(Ordering::Relaxed),
        "full bar refresh finished"
    );
    Ok(stored)
}

async fn refresh_one_symbol(
    state: &Arc<AppState>,
    ts_code: &str,
    from: &str,
    to: &str,
) -> ServiceResult<bool> {
    let ts_owned = ts_code.to_string();
    let from_owned = from.to_string();
    let to_owned = to.to_string();
    let (bars, source) = state
        .fabric
        .call(ProviderChoice::Tushare, move |p| {
            let ts = ts_owned.clone();
            let from = from_owned.clone();
            let to = to_owned.clone();
            Box::pin(async move { p.daily_bars(&ts, &from, &to).await })
        })
        .await?;
    let outcome = state
        .kline
        .put(ts_code, bars, &source.to_string())
        .await?;
    Ok(matches!(outcome, PutOutcome::Stored { .. }))
}

// -----------------------------------------------------------------------------
// smart_bar_update
// -----------------------------------------------------------------------------

async fn smart_bar_update(
    state: &Arc<AppState>,
    scope: JobScope,
    shutdown: watch::Receiver<bool>,
) -> ServiceResult<u64> {
    let symbols = universe(state, scope).await?;
    let today = Local::now().date_naive();
    let mut updated = 0u64;

    for symbol in symbols {
        if *shutdown.borrow() {
            return Err(ServiceError::Cancelled);
        }

        let Some(series) = state.kline.get(&symbol.ts_code).await? else {
            // Never imported; the weekly full refresh owns that case.
            continue;
        };
        let Some(last) = series.data.last() else {
            continue;
        };

        let Ok(last_date) = NaiveDate::parse_from_str(&last.trade_date, "%Y-%m-%d") else {
            continue;
        };
        let from = last_date + ChronoDuration::days(1);
        if from > today {
            continue;
        }

        let ts_owned = symbol.ts_code.clone();
        let from_owned = compact_date(from);
        let to_owned = compact_date(today);
        match state
            .fabric
            .call(ProviderChoice::Tushare, move |p| {
                let ts = ts_owned.clone();
                let from = from_owned.clone();
                let to = to_owned.clone();
                Box::pin(async move { p.daily_bars(&ts, &from, &to).await })
            })
            .await
        {
            Ok((bars, _)) if !bars.is_empty() => {
                state
                    .kline
                    .append(&symbol.ts_code, bars, UPDATE_TYPE_INCREMENTAL, None)
                    .await?;
                updated += 1;
            }
            Ok(_) => {}
            // Holidays and thin symbols legitimately return nothing.
            Err(e) if e.kind() == "provider_empty" || e.kind() == "rate_limit_exhausted" => {
                debug!(ts_code = %symbol.ts_code, error = %e, "no incremental bars");
            }
            Err(e) => return Err(e),
        }
    }

    info!(updated, "smart bar update finished");
    Ok(updated)
}

// -----------------------------------------------------------------------------
// compute_signals / realtime_snapshot
// -----------------------------------------------------------------------------

async fn compute_signals(state: &Arc<AppState>, scope: JobScope) -> ServiceResult<u64> {
    state.registry.ensure_ready().await?;

    let symbols = universe(state, JobScope::default()).await?;
    let summary = state
        .engine
        .recompute_all(
            &symbols,
            RecomputeOptions {
                etf_only: scope.etf_only,
                clear_existing: true,
            },
        )
        .await?;

    // Push the fresh set to anyone listening: signal deltas per strategy,
    // then the price fan-out.
    for code in summary.strategies.clone() {
        match state.engine.signals(Some(&code)).await {
            Ok(signals) if !signals.is_empty() => {
                if let Err(e) = state
                    .publisher
                    .publish_signal_updates(&code, "add", &signals)
                    .await
                {
                    warn!(strategy = %code, error = %e, "signal update push failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(strategy = %code, error = %e, "signal read-back failed"),
        }
    }
    if let Err(e) = state.publisher.broadcast_all_active().await {
        warn!(error = %e, "post-compute push failed");
    }
    Ok(summary.signals_found as u64)
}

async fn realtime_snapshot(state: &Arc<AppState>) -> ServiceResult<u64> {
    state.registry.ensure_ready().await?;

    let cycle = state
        .realtime
        .snapshot_all(
            SnapshotOptions {
                include_etf: true,
                provider: None,
            },
            Local::now(),
        )
        .await?;

    if let Err(e) = state.publisher.broadcast_all_active().await {
        warn!(error = %e, "post-snapshot push failed");
    }
    Ok(cycle.count as u64)
}

// -----------------------------------------------------------------------------
// cleanup_charts
// -----------------------------------------------------------------------------

async fn cleanup_charts(state: &Arc<AppState>) -> ServiceResult<u64> {
    let chart_keys = state.kv.scan_prefix(keys::CHART_PREFIX).await?;
    let mut purged = 0u64;
    for key in chart_keys {
        state.kv.del(&key).await?;
        purged += 1;
    }
    info!(purged, "chart cache purged");
    Ok(purged)
}
