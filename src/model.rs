// =============================================================================
// Core data model — bars, quotes, symbols, signals
// =============================================================================
//
// These are the JSON shapes persisted in Redis and pushed over the wire.
// Field names are part of the durable external contract and must not
// change. Provider-specific field names never reach these types; each
// adapter maps its own DTOs onto them.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::calendar::normalise_date;
use crate::types::SignalType;

// =============================================================================
// OHLCV bar
// =============================================================================

/// One daily OHLCV record. `vol` is in shares, `amount` in yuan —
/// provider-specific units are converted before a bar is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Canonical `YYYY-MM-DD` trade date.
    pub trade_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub amount: f64,
    #[serde(default)]
    pub pct_chg: f64,
    #[serde(default)]
    pub change: f64,
}

impl Bar {
    /// Validate the OHLC invariants enforced on ingest:
    /// `close > 0`, `vol >= 0`, `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_sane(&self) -> bool {
        if !(self.close > 0.0) || !(self.vol >= 0.0) {
            return false;
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high
    }

    /// Normalise the trade date in place; returns `false` when the date is
    /// unparseable (the bar should then be dropped).
    pub fn normalise(&mut self) -> bool {
        match normalise_date(&self.trade_date) {
            Some(d) => {
                self.trade_date = d;
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// K-line series
// =============================================================================

/// How the last write to a series happened. A `realtime` tail bar may be
/// overwritten in place during a trading session.
pub const UPDATE_TYPE_HISTORY: &str = "history";
pub const UPDATE_TYPE_INCREMENTAL: &str = "incremental";
pub const UPDATE_TYPE_REALTIME: &str = "realtime";

/// The stored per-symbol bar series, date-ascending, bounded by the
/// retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    pub ts_code: String,
    pub data: Vec<Bar>,
    /// ISO timestamp of the last write.
    pub updated_at: String,
    pub data_count: usize,
    /// Origin of the bulk data: `tushare`, `akshare`, or `realtime-merged`.
    pub source: String,
    pub last_update_type: String,
}

impl BarSeries {
    /// Check strict date monotonicity, tolerating an in-place realtime tail.
    pub fn is_monotonic(&self) -> bool {
        self.data
            .windows(2)
            .all(|w| w[1].trade_date > w[0].trade_date)
    }
}

// =============================================================================
// Realtime quote
// =============================================================================

/// A provider-normalised realtime snapshot row. `volume` is in shares and
/// `amount` in yuan, matching the bar units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_close: Option<f64>,
    pub volume: f64,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turnover_rate: Option<f64>,
    pub update_time: String,
}

// =============================================================================
// Symbol master record
// =============================================================================

/// One entry in the symbol registry. `ts_code` is the canonical id
/// (`600000.SH`), `symbol` the 6-digit on-wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub ts_code: String,
    pub symbol: String,
    pub name: String,
    /// `SH`, `SZ`, `BJ`, or `ETF`.
    pub market: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub list_date: String,
}

// =============================================================================
// Signal record
// =============================================================================

/// A strategy verdict persisted in the `buy_signals` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub code: String,
    pub name: String,
    pub market: String,
    pub strategy: String,
    pub signal_type: SignalType,
    pub price: f64,
    pub change_percent: f64,
    pub volume: f64,
    /// `YYYY-MM-DD` of the bar that produced the signal.
    pub signal_date: String,
    /// ISO timestamp of the engine run.
    pub calculated_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
