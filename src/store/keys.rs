// =============================================================================
// Redis key vocabulary & TTL policy
// =============================================================================
//
// The keyspace is the durable external contract: every key name and TTL
// below is fixed and must survive reimplementation bit-for-bit.
// =============================================================================

use std::time::Duration;

/// Ordered master list of stock records (JSON array). Never expires.
pub const STOCK_CODES_ALL: &str = "stocks:codes:all";
/// Per-symbol hash `symbol -> SymbolInfo`. Never expires.
pub const STOCK_LIST: &str = "stock_list";
/// Ordered master list of ETF records (JSON array). Never expires.
pub const ETF_CODES_ALL: &str = "etf:codes:all";
/// Latest full realtime snapshot cycle.
pub const STOCK_REALTIME: &str = "stock:realtime";
/// Signal set hash, field `symbol:strategy`.
pub const BUY_SIGNALS: &str = "buy_signals";
/// Latest news headline cache.
pub const NEWS_LATEST: &str = "news:latest";
/// One-shot guard flag for the signal migration check.
pub const SIGNAL_MIGRATION_FLAG: &str = "buy_signals:migration_checked";

/// K-line series key for an equity.
pub fn stock_trend(ts_code: &str) -> String {
    format!("stock_trend:{ts_code}")
}

/// K-line series key for an ETF.
pub fn etf_trend(ts_code: &str) -> String {
    format!("etf_trend:{ts_code}")
}

/// Derived chart JSON cache slot.
pub fn chart_data(symbol: &str, strategy: &str) -> String {
    format!("chart_data:{symbol}:{strategy}")
}

/// Scheduler execution-log entry key.
pub fn exec_log(job: &str, stamp_ms: i64) -> String {
    format!("scheduler:log:{job}:{stamp_ms}")
}

/// Prefix used to scan all execution-log entries.
pub const EXEC_LOG_PREFIX: &str = "scheduler:log:";
/// Prefix used to scan all chart cache slots.
pub const CHART_PREFIX: &str = "chart_data:";

/// TTL table. Registry keys carry no TTL at all.
pub mod ttl {
    use super::Duration;

    /// K-line series: 30-day sliding window.
    pub const KLINE: Duration = Duration::from_secs(30 * 24 * 3600);
    /// Realtime snapshot: 5 minutes.
    pub const REALTIME: Duration = Duration::from_secs(5 * 60);
    /// Signal set: 1 hour, refreshed on every recompute.
    pub const SIGNALS: Duration = Duration::from_secs(3600);
    /// Chart JSON cache: 1 minute.
    pub const CHART: Duration = Duration::from_secs(60);
    /// Execution log entries: 7 days.
    pub const EXEC_LOG: Duration = Duration::from_secs(7 * 24 * 3600);
    /// Migration / one-shot flags: 24 hours.
    pub const FLAG: Duration = Duration::from_secs(24 * 3600);
    /// News headline cache: 2 hours.
    pub const NEWS: Duration = Duration::from_secs(2 * 3600);
}
