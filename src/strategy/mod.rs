// =============================================================================
// Strategy engine — registry, vectorised runs, signal persistence
// =============================================================================
//
// Strategies are pure functions over an in-memory bar series; they never
// touch the store. The engine owns the `buy_signals` hash exclusively:
// one run scans the universe, applies every registered strategy, keeps
// only signals that fired on the last bar, and installs the new set under
// a writer lock so readers observe either the old set or the new one,
// never a half-cleared hash.
// =============================================================================

pub mod indicators;
pub mod trend_continuation;
pub mod volatility_conservation;
pub mod volume_wave;
pub mod volume_wave_enhanced;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ServiceResult;
use crate::model::{Bar, SignalRecord, SymbolInfo};
use crate::store::keys::{self, ttl};
use crate::store::kv::{self, KvStore};
use crate::store::KlineStore;
use crate::types::SignalType;

pub use trend_continuation::TrendContinuation;
pub use volatility_conservation::VolatilityConservation;
pub use volume_wave::VolumeWave;
pub use volume_wave_enhanced::VolumeWaveEnhanced;

/// A series shorter than this carries too little context for the EMA
/// stacks; the symbol is skipped.
pub const MIN_BARS_FOR_SIGNALS: usize = 50;

/// One per-bar verdict produced by a strategy run.
#[derive(Debug, Clone)]
pub struct BarSignal {
    pub index: usize,
    pub signal_type: SignalType,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: Option<String>,
}

/// Everything a strategy returns: indicator columns for charting plus the
/// signal list.
#[derive(Debug, Default)]
pub struct StrategyOutcome {
    pub columns: HashMap<&'static str, Vec<f64>>,
    pub signals: Vec<BarSignal>,
}

/// A named, vectorised trading strategy.
pub trait Strategy: Send + Sync {
    /// Stable machine identifier (`volume_wave`, ...).
    fn code(&self) -> &'static str;
    /// Human-readable name.
    fn name(&self) -> &'static str;
    fn apply(&self, bars: &[Bar]) -> StrategyOutcome;
}

/// The compile-time strategy registry.
pub fn registry() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(VolumeWave::default()),
        Arc::new(VolumeWaveEnhanced::default()),
        Arc::new(VolatilityConservation::default()),
        Arc::new(TrendContinuation::default()),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecomputeOptions {
    /// Restrict the run to ETF records.
    pub etf_only: bool,
    /// Drop signals that did not recur in this run.
    pub clear_existing: bool,
}

/// Summary of one engine run, logged and returned to manual triggers.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub symbols_scanned: usize,
    pub series_missing: usize,
    pub signals_found: usize,
    pub strategies: Vec<String>,
    pub calculated_time: String,
}

pub struct StrategyEngine {
    kv: Arc<dyn KvStore>,
    kline: Arc<KlineStore>,
    strategies: Vec<Arc<dyn Strategy>>,
    /// Serialises signal-set installation; readers never see a partially
    /// replaced hash.
    write_lock: tokio::sync::Mutex<()>,
}

impl StrategyEngine {
    pub fn new(kv: Arc<dyn KvStore>, kline: Arc<KlineStore>) -> Self {
        Self::with_strategies(kv, kline, registry())
    }

    pub fn with_strategies(
        kv: Arc<dyn KvStore>,
        kline: Arc<KlineStore>,
        strategies: Vec<Arc<dyn Strategy>>,
    ) -> Self {
        Self {
            kv,
            kline,
            strategies,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn strategy_codes(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.code()).collect()
    }

    /// `(code, display name)` pairs for the registered strategies.
    pub fn strategy_catalog(&self) -> Vec<(&'static str, &'static str)> {
        self.strategies.iter().map(|s| (s.code(), s.name())).collect()
    }

    /// Apply one registered strategy to a stored series (chart rendering
    /// path). `None` when the strategy is unknown.
    pub fn apply_by_code(&self, code: &str, bars: &[Bar]) -> Option<StrategyOutcome> {
        self.strategies
            .iter()
            .find(|s| s.code() == code)
            .map(|s| s.apply(bars))
    }

    /// Run every registered strategy over the universe and install the
    /// resulting signal set.
    pub async fn recompute_all(
        &self,
        universe: &[SymbolInfo],
        opts: RecomputeOptions,
    ) -> ServiceResult<RunSummary> {
        let calculated_time = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut symbols_scanned = 0usize;
        let mut series_missing = 0usize;

        for symbol in universe {
            if opts.etf_only && symbol.market != "ETF" {
                continue;
            }
            symbols_scanned += 1;

            let Some(series) = self.kline.get(&symbol.ts_code).await? else {
                series_missing += 1;
                continue;
            };
            if series.data.len() < MIN_BARS_FOR_SIGNALS {
                debug!(
                    ts_code = %symbol.ts_code,
                    bars = series.data.len(),
                    "series too short for signals"
                );
                continue;
            }

            let last_index = series.data.len() - 1;
            let last = &series.data[last_index];
            let change_percent = if last.open > 0.0 {
                (last.close - last.open) / last.open * 100.0
            } else {
                0.0
            };

            for strategy in &self.strategies {
                let outcome = strategy.apply(&series.data);
                for signal in outcome.signals.iter().filter(|s| s.index == last_index) {
                    let record = SignalRecord {
                        code: symbol.symbol.clone(),
                        name: symbol.name.clone(),
                        market: symbol.market.clone(),
                        strategy: strategy.code().to_string(),
                        signal_type: signal.signal_type,
                        price: signal.price,
                        change_percent,
                        volume: last.vol,
                        signal_date: last.trade_date.clone(),
                        calculated_time: calculated_time.clone(),
                        stop_loss: signal.stop_loss,
                        take_profit: signal.take_profit,
                        reason: signal.reason.clone(),
                    };
                    let field = format!("{}:{}", symbol.symbol, strategy.code());
                    entries.push((field, serde_json::to_string(&record)?));
                }
            }
        }

        let signals_found = entries.len();

        // Install: write the new fields first, then prune stale ones, so a
        // concurrent reader sees at worst a superset, never a gap.
        {
            let _guard = self.write_lock.lock().await;
            let existing = self.kv.hgetall(keys::BUY_SIGNALS).await?;

            self.kv.hset_many(keys::BUY_SIGNALS, &entries).await?;

            if opts.clear_existing {
                let fresh: HashSet<&str> = entries.iter().map(|(f, _)| f.as_str()).collect();
                let stale: Vec<String> = existing
                    .keys()
                    .filter(|field| !fresh.contains(field.as_str()))
                    .cloned()
                    .collect();
                if !stale.is_empty() {
                    self.kv.hdel(keys::BUY_SIGNALS, &stale).await?;
                }
            }

            self.kv.expire(keys::BUY_SIGNALS, ttl::SIGNALS).await?;
        }

        let summary = RunSummary {
            symbols_scanned,
            series_missing,
            signals_found,
            strategies: self
                .strategies
                .iter()
                .map(|s| s.code().to_string())
                .collect(),
            calculated_time,
        };
        info!(
            scanned = summary.symbols_scanned,
            missing = summary.series_missing,
            signals = summary.signals_found,
            "signal recompute complete"
        );
        Ok(summary)
    }

    /// The stored signal set, optionally filtered to one strategy. The
    /// first read after startup runs the migration check.
    pub async fn signals(&self, strategy: Option<&str>) -> ServiceResult<Vec<SignalRecord>> {
        self.migration_check().await?;

        let rows: Vec<(String, SignalRecord)> =
            kv::hgetall_json(self.kv.as_ref(), keys::BUY_SIGNALS).await?;
        Ok(rows
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| strategy.map_or(true, |s| record.strategy == s))
            .collect())
    }

    /// Evict signals from strategies no longer in the registry. Guarded by
    /// a 24-hour flag so the scan runs at most once a day.
    async fn migration_check(&self) -> ServiceResult<()> {
        if self.kv.exists(keys::SIGNAL_MIGRATION_FLAG).await? {
            return Ok(());
        }

        let known: HashSet<&'static str> = self.strategy_codes().into_iter().collect();
        let rows: Vec<(String, SignalRecord)> =
            kv::hgetall_json(self.kv.as_ref(), keys::BUY_SIGNALS).await?;

        let stale: Vec<String> = rows
            .iter()
            .filter(|(_, record)| !known.contains(record.strategy.as_str()))
            .map(|(field, _)| field.clone())
            .collect();

        if !stale.is_empty() {
            warn!(
                evicted = stale.len(),
                "evicting signals from unregistered strategies"
            );
            self.kv.hdel(keys::BUY_SIGNALS, &stale).await?;
        }

        self.kv
            .set(keys::SIGNAL_MIGRATION_FLAG, "1", Some(ttl::FLAG))
            .await?;
        Ok(())
    }
}
