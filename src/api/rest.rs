// =============================================================================
// REST endpoints — Axum 0.7
// =============================================================================
//
// Thin handlers delegating to the core services. Two response envelopes:
// the admin surface answers `{success, message, data}` and the data-plane
// reads answer `{code, message, data}`. Reads are idempotent; POSTs
// mutate state and return no body beyond the envelope. Authentication is
// the `X-API-Token` header (see `api::auth`).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Local};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::ApiToken;
use crate::app_state::AppState;
use crate::calendar::compact_date;
use crate::error::ServiceError;
use crate::scheduler::{JobKind, JobScope};
use crate::store::kv::KvStore;
use crate::types::{ts_code_for, InitMode, ProviderChoice};

/// Calendar window requested when a chart read has to back-fill.
const BACKFILL_WINDOW_DAYS: i64 = 360;
/// Cap on one batch-price request.
const BATCH_PRICE_LIMIT: usize = 50;

/// Build the full router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Scheduler admin ─────────────────────────────────────────
        .route("/api/stocks/scheduler/status", get(scheduler_status))
        .route("/api/stocks/scheduler/init", post(scheduler_init))
        .route("/api/stocks/scheduler/trigger", post(scheduler_trigger))
        // ── Data plane ──────────────────────────────────────────────
        .route("/api/stocks", get(stock_codes))
        .route("/api/stocks/codes", get(stock_codes))
        .route("/api/stocks/batch-price", get(batch_price))
        .route("/api/stocks/realtime", get(realtime))
        .route("/api/stocks/signals", get(signals))
        .route("/api/stocks/kline/:ts_code", get(kline))
        .route("/api/stocks/chart/:code/:strategy", get(chart))
        .route("/api/news/latest", get(news_latest))
        // ── WebSocket observability + endpoint ──────────────────────
        .route("/api/websocket/stats", get(websocket_stats))
        .route("/api/websocket/push/prices", post(push_prices))
        .route("/api/websocket/broadcast/test", post(broadcast_test))
        .route("/ws/stock/prices", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// -----------------------------------------------------------------------------
// Envelopes
// -----------------------------------------------------------------------------

fn admin_ok(message: impl Into<String>, data: Value) -> Json<Value> {
    Json(json!({ "success": true, "message": message.into(), "data": data }))
}

fn admin_fail(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "success": false, "message": message.into(), "data": null }))
}

fn data_ok(message: impl Into<String>, data: Value) -> Json<Value> {
    Json(json!({ "code": 200, "message": message.into(), "data": data }))
}

/// Map a service error onto the data-plane envelope. `bad_input` and
/// `not_found` surface verbatim; everything else is a generic internal
/// message (the details stay in the logs).
fn data_err(e: &ServiceError) -> Response {
    let (status, message) = match e {
        ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        ServiceError::BadInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        ServiceError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        _ => {
            warn!(error = %e, kind = e.kind(), "internal error on data endpoint");
            (StatusCode::INTERNAL_SERVER_ERROR, "服务内部错误".to_string())
        }
    };
    (
        status,
        Json(json!({ "code": status.as_u16(), "message": message, "data": null })),
    )
        .into_response()
}

// -----------------------------------------------------------------------------
// Health
// -----------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let redis_ok = state.kv.ping().await.is_ok();
    Json(json!({
        "status": if redis_ok { "ok" } else { "degraded" },
        "redis": redis_ok,
        "uptime_secs": state.uptime_secs(),
        "server_time": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    }))
}

// -----------------------------------------------------------------------------
// Scheduler admin
// -----------------------------------------------------------------------------

async fn scheduler_status(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.scheduler() {
        Some(scheduler) => admin_ok("获取股票调度器状态成功", scheduler.status().await),
        None => admin_fail("调度器未初始化"),
    }
}

#[derive(Deserialize)]
struct InitQuery {
    #[serde(default)]
    mode: Option<String>,
}

async fn scheduler_init(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<InitQuery>,
) -> impl IntoResponse {
    let raw = query.mode.unwrap_or_else(|| "tasks_only".to_string());
    let Some(mode) = InitMode::parse(&raw) else {
        return admin_fail(format!(
            "无效的模式参数: {raw}，支持 skip/tasks_only/full_init/etf_only"
        ));
    };

    let Some(scheduler) = state.scheduler() else {
        return admin_fail("调度器未初始化");
    };

    info!(%mode, "manual init requested");
    scheduler.spawn_startup(mode);
    admin_ok(
        format!("初始化任务已提交 (mode={mode})"),
        json!({ "mode": mode.to_string() }),
    )
}

#[derive(Deserialize)]
struct TriggerRequest {
    task_type: String,
    #[serde(default)]
    etf_only: bool,
}

async fn scheduler_trigger(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    let Some(kind) = JobKind::parse(&request.task_type) else {
        return admin_fail(format!("未知的任务类型: {}", request.task_type));
    };
    let Some(scheduler) = state.scheduler() else {
        return admin_fail("调度器未初始化");
    };

    match scheduler.manual_trigger(
        kind,
        JobScope {
            etf_only: request.etf_only,
        },
    ) {
        Ok(()) => admin_ok(
            format!("任务 {} 已触发", kind.name()),
            json!({ "task": kind.name() }),
        ),
        Err(e) => admin_fail(e.to_string()),
    }
}

// -----------------------------------------------------------------------------
// Symbol registry
// -----------------------------------------------------------------------------

async fn stock_codes(_auth: ApiToken, State(state): State<Arc<AppState>>) -> Response {
    let records = match state.registry.load().await {
        Ok(records) => records,
        Err(e) => return data_err(&e),
    };

    if records.is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "code": 500,
                "message": "股票代码数据不可用",
                "data": { "codes": [], "count": 0, "suggestion": "触发 refresh_symbol_list 任务" },
            })),
        )
            .into_response();
    }

    let total = records.len();
    let preview: Vec<Value> = records
        .iter()
        .take(100)
        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
        .collect();

    data_ok(
        format!("获取股票代码成功，共 {total} 只股票"),
        json!({
            "codes": preview,
            "total_count": total,
            "displayed_count": preview.len(),
        }),
    )
    .into_response()
}

// -----------------------------------------------------------------------------
// Prices
// -----------------------------------------------------------------------------

#[derive(Deserialize)]
struct BatchPriceQuery {
    codes: String,
}

async fn batch_price(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchPriceQuery>,
) -> Response {
    let codes: Vec<&str> = query
        .codes
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    if codes.is_empty() {
        return data_err(&ServiceError::BadInput("请提供有效的股票代码".into()));
    }
    if codes.len() > BATCH_PRICE_LIMIT {
        return data_err(&ServiceError::BadInput(format!(
            "单次查询股票数量不能超过{BATCH_PRICE_LIMIT}只"
        )));
    }

    let mut rows = Vec::with_capacity(codes.len());
    for code in &codes {
        rows.push(price_row(&state, code).await);
    }
    let success_count = rows
        .iter()
        .filter(|r| r["status"] == "success")
        .count();

    data_ok(
        format!("批量查询完成，成功获取 {success_count}/{} 只股票信息", codes.len()),
        json!({ "items": rows, "success_count": success_count }),
    )
    .into_response()
}

/// Last-bar price info for one 6-digit code, from the stored series.
async fn price_row(state: &Arc<AppState>, code: &str) -> Value {
    let name = state
        .registry
        .lookup(code)
        .await
        .ok()
        .flatten()
        .map(|r| r.name);

    let Some(ts_code) = ts_code_for(code) else {
        return json!({
            "code": code, "name": name, "price": 0, "change_percent": 0,
            "volume": 0, "update_time": null, "status": "bad_code",
        });
    };

    match state.kline.get(&ts_code).await {
        Ok(Some(series)) => match series.data.last() {
            Some(last) => json!({
                "code": code,
                "name": name,
                "price": last.close,
                "change_percent": last.pct_chg,
                "volume": last.vol as i64,
                "update_time": last.trade_date,
                "status": "success",
                "ts_code": ts_code,
            }),
            None => json!({
                "code": code, "name": name, "price": 0, "change_percent": 0,
                "volume": 0, "update_time": null, "status": "empty_data",
                "message": "K线数据为空",
            }),
        },
        Ok(None) => json!({
            "code": code, "name": name, "price": 0, "change_percent": 0,
            "volume": 0, "update_time": null, "status": "no_data",
            "message": "暂无K线数据",
        }),
        Err(e) => json!({
            "code": code, "name": name, "price": 0, "change_percent": 0,
            "volume": 0, "update_time": null, "status": "error",
            "message": e.to_string(),
        }),
    }
}

#[derive(Deserialize)]
struct RealtimeQuery {
    #[serde(default)]
    code: Option<String>,
}

async fn realtime(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RealtimeQuery>,
) -> Response {
    // Per-symbol reads go through the service (cached batch first, one
    // fresh pull otherwise); the summary read never triggers a pull.
    if let Some(code) = query.code {
        return match state.realtime.snapshot_one(&code, Local::now()).await {
            Ok(quote) => data_ok("获取实时行情成功", json!({ "quote": quote })).into_response(),
            Err(e) => data_err(&e),
        };
    }

    match state.realtime.cached_cycle().await {
        Ok(Some(cycle)) => data_ok(
            "获取实时行情成功",
            json!({
                "count": cycle.count,
                "source": cycle.source,
                "update_time": cycle.update_time,
            }),
        )
        .into_response(),
        Ok(None) => data_err(&ServiceError::NotFound(
            "暂无实时行情数据，等待下一个采集周期".into(),
        )),
        Err(e) => data_err(&e),
    }
}

// -----------------------------------------------------------------------------
// Signals
// -----------------------------------------------------------------------------

#[derive(Deserialize)]
struct SignalsQuery {
    #[serde(default)]
    strategy: Option<String>,
}

async fn signals(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalsQuery>,
) -> Response {
    let catalog: Vec<Value> = state
        .engine
        .strategy_catalog()
        .into_iter()
        .map(|(code, name)| json!({ "code": code, "name": name }))
        .collect();

    match state.engine.signals(query.strategy.as_deref()).await {
        Ok(signals) => data_ok(
            "获取买入信号成功",
            json!({ "count": signals.len(), "signals": signals, "strategies": catalog }),
        )
        .into_response(),
        Err(e) => data_err(&e),
    }
}

// -----------------------------------------------------------------------------
// K-line (read-through back-fill)
// -----------------------------------------------------------------------------

/// Resolve a user-supplied code (`600519.SH` or bare 6-digit) to the
/// canonical `ts_code`.
fn resolve_ts_code(raw: &str) -> Result<String, ServiceError> {
    if raw.contains('.') {
        Ok(raw.to_string())
    } else {
        ts_code_for(raw).ok_or_else(|| ServiceError::BadInput(format!("无效的股票代码: {raw}")))
    }
}

/// Stored series for `ts_code`, back-filling once (coalesced per key) on
/// a read miss.
async fn series_with_backfill(
    state: &Arc<AppState>,
    ts_code: &str,
) -> Result<crate::model::BarSeries, ServiceError> {
    if let Some(series) = state.kline.get(ts_code).await? {
        return Ok(series);
    }

    let fabric = state.fabric.clone();
    let today = Local::now().date_naive();
    let from = compact_date(today - ChronoDuration::days(BACKFILL_WINDOW_DAYS));
    let to = compact_date(today);
    let ts_for_fetch = ts_code.to_string();

    state
        .kline
        .backfill_with(ts_code, "tushare", move || async move {
            let (bars, _) = fabric
                .call(ProviderChoice::Tushare, move |p| {
                    let ts = ts_for_fetch.clone();
                    let from = from.clone();
                    let to = to.clone();
                    Box::pin(async move { p.daily_bars(&ts, &from, &to).await })
                })
                .await?;
            Ok(bars)
        })
        .await
        .map_err(|e| match e {
            ServiceError::NotFound(_) => e,
            other => ServiceError::NotFound(format!("历史数据不足: {ts_code} ({})", other.kind())),
        })
}

async fn kline(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let ts_code = match resolve_ts_code(&raw) {
        Ok(ts) => ts,
        Err(e) => return data_err(&e),
    };

    match series_with_backfill(&state, &ts_code).await {
        Ok(series) => data_ok(
            "获取K线数据成功",
            serde_json::to_value(&series).unwrap_or(Value::Null),
        )
        .into_response(),
        Err(e) => data_err(&e),
    }
}

// -----------------------------------------------------------------------------
// Chart data (1-minute cached derivation)
// -----------------------------------------------------------------------------

async fn chart(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Path((code, strategy)): Path<(String, String)>,
) -> Response {
    if !state.engine.strategy_codes().contains(&strategy.as_str()) {
        return data_err(&ServiceError::BadInput(format!("未知的策略: {strategy}")));
    }
    let ts_code = match resolve_ts_code(&code) {
        Ok(ts) => ts,
        Err(e) => return data_err(&e),
    };

    let cache_key = crate::store::keys::chart_data(&code, &strategy);
    match crate::store::kv::get_json::<Value>(state.kv.as_ref(), &cache_key).await {
        Ok(Some(cached)) => return data_ok("获取图表数据成功", cached).into_response(),
        Ok(None) => {}
        Err(e) => return data_err(&e),
    }

    let series = match series_with_backfill(&state, &ts_code).await {
        Ok(series) => series,
        Err(e) => return data_err(&e),
    };

    let Some(outcome) = state.engine.apply_by_code(&strategy, &series.data) else {
        return data_err(&ServiceError::BadInput(format!("未知的策略: {strategy}")));
    };

    let payload = json!({
        "ts_code": series.ts_code,
        "strategy": strategy,
        "bars": series.data,
        "columns": outcome.columns,
        "signals": outcome
            .signals
            .iter()
            .map(|s| json!({
                "index": s.index,
                "type": s.signal_type,
                "price": s.price,
                "stop_loss": s.stop_loss,
                "take_profit": s.take_profit,
            }))
            .collect::<Vec<_>>(),
        "updated_at": series.updated_at,
    });

    // Derivations are never stored without a TTL.
    if let Err(e) = crate::store::kv::set_json(
        state.kv.as_ref(),
        &cache_key,
        &payload,
        Some(crate::store::keys::ttl::CHART),
    )
    .await
    {
        warn!(error = %e, "chart cache write failed");
    }

    data_ok("获取图表数据成功", payload).into_response()
}

// -----------------------------------------------------------------------------
// News
// -----------------------------------------------------------------------------

async fn news_latest(_auth: ApiToken, State(state): State<Arc<AppState>>) -> Response {
    match state.news.latest().await {
        Ok(Some(cache)) => data_ok(
            "获取新闻成功",
            serde_json::to_value(&cache).unwrap_or(Value::Null),
        )
        .into_response(),
        Ok(None) => data_err(&ServiceError::NotFound(
            "暂无新闻数据，等待下一次抓取".into(),
        )),
        Err(e) => data_err(&e),
    }
}

// -----------------------------------------------------------------------------
// WebSocket observability
// -----------------------------------------------------------------------------

async fn websocket_stats(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let connections = state.hub.connections.stats();
    let subscriptions = state.hub.subscriptions.stats();
    let clients: Vec<Value> = state
        .hub
        .connections
        .client_infos()
        .into_iter()
        .map(|info| {
            json!({
                "client_id": info.client_id,
                "connected_at": info.connected_at,
                "subscriptions": state.hub.subscriptions.client_subscriptions(&info.client_id),
            })
        })
        .collect();

    data_ok(
        "获取统计信息成功",
        json!({
            "connections": connections,
            "subscriptions": subscriptions,
            "clients": clients,
        }),
    )
}

#[derive(Deserialize)]
struct PushQuery {
    #[serde(default = "default_push_strategy")]
    strategy: String,
}

fn default_push_strategy() -> String {
    "volume_wave".to_string()
}

async fn push_prices(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushQuery>,
) -> impl IntoResponse {
    match state.publisher.publish_strategy_prices(&query.strategy).await {
        Ok(count) => admin_ok(
            "价格推送成功",
            json!({ "strategy": query.strategy, "client_count": count }),
        ),
        Err(e) => admin_fail(e.to_string()),
    }
}

async fn broadcast_test(
    _auth: ApiToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let message = json!({
        "type": "test",
        "message": "这是一条测试消息",
        "timestamp": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    });
    let sent = state.hub.connections.broadcast(&message, &[]);
    admin_ok("广播测试消息成功", json!({ "sent_count": sent }))
}
