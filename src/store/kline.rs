// =============================================================================
// K-line store — per-symbol daily bar series in Redis
// =============================================================================
//
// The store exclusively owns every `stock_trend:*` / `etf_trend:*` key.
// Other components submit candidate bars (bulk history, incremental
// appends, realtime last-bar candidates) and the store performs the write,
// enforcing the ingest invariants:
//
//   * strictly ascending trade dates (the realtime tail may be replaced
//     in place, never reordered),
//   * close > 0, vol >= 0, low <= body <= high,
//   * retention-trimmed to the newest RETENTION_BARS entries.
//
// Back-fill for a missing symbol is coalesced per key: concurrent readers
// share one upstream fetch.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::calendar::{self, normalise_date};
use crate::error::{ServiceError, ServiceResult};
use crate::model::{Bar, BarSeries, Quote, UPDATE_TYPE_HISTORY, UPDATE_TYPE_REALTIME};
use crate::store::keys::{self, ttl};
use crate::store::kv::{self, KvStore};
use crate::types::is_etf_symbol;

/// Retention window: the series keeps at most this many newest bars.
pub const RETENTION_BARS: usize = 180;
/// A brand-new series must arrive with at least this many bars.
pub const MIN_INITIAL_BARS: usize = 20;

/// Result of a bulk `put`. A too-short import for a previously absent
/// symbol is reported, not raised, so bulk jobs keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { count: usize, dropped: usize },
    RejectedTooShort { got: usize },
}

pub struct KlineStore {
    kv: Arc<dyn KvStore>,
    /// Per-symbol back-fill gates. The async mutex serialises fetchers for
    /// one key; whoever enters first fetches, the rest observe the stored
    /// result.
    backfill_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KlineStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            backfill_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Series key for a canonical `ts_code`; ETFs live in their own
    /// namespace.
    pub fn key_for(ts_code: &str) -> String {
        let symbol = ts_code.split('.').next().unwrap_or(ts_code);
        if is_etf_symbol(symbol) {
            keys::etf_trend(ts_code)
        } else {
            keys::stock_trend(ts_code)
        }
    }

    pub async fn get(&self, ts_code: &str) -> ServiceResult<Option<BarSeries>> {
        kv::get_json(self.kv.as_ref(), &Self::key_for(ts_code)).await
    }

    pub async fn exists(&self, ts_code: &str) -> ServiceResult<bool> {
        self.kv.exists(&Self::key_for(ts_code)).await
    }

    /// Overwrite the whole series for `ts_code` from a bulk import.
    pub async fn put(
        &self,
        ts_code: &str,
        bars: Vec<Bar>,
        source: &str,
    ) -> ServiceResult<PutOutcome> {
        let incoming = bars.len();
        let clean = sanitise(ts_code, bars);
        let dropped = incoming - clean.len();

        if clean.len() < MIN_INITIAL_BARS && !self.exists(ts_code).await? {
            debug!(
                ts_code,
                got = clean.len(),
                "rejecting bulk import below the minimum for a new series"
            );
            return Ok(PutOutcome::RejectedTooShort { got: clean.len() });
        }

        let series = BarSeries {
            ts_code: ts_code.to_string(),
            data_count: clean.len(),
            data: clean,
            updated_at: now_stamp(),
            source: source.to_string(),
            last_update_type: UPDATE_TYPE_HISTORY.to_string(),
        };

        kv::set_json(
            self.kv.as_ref(),
            &Self::key_for(ts_code),
            &series,
            Some(ttl::KLINE),
        )
        .await?;

        Ok(PutOutcome::Stored {
            count: series.data_count,
            dropped,
        })
    }

    /// Merge incoming bars into the stored series by trade date. A bar
    /// matching the stored last bar's date replaces it in place; newer bars
    /// are appended; the front is trimmed to retention.
    pub async fn append(
        &self,
        ts_code: &str,
        bars: Vec<Bar>,
        update_type: &str,
        source: Option<&str>,
    ) -> ServiceResult<usize> {
        let clean = sanitise(ts_code, bars);
        if clean.is_empty() {
            return Ok(0);
        }

        let existing = self.get(ts_code).await?;
        let mut merged: BTreeMap<String, Bar> = BTreeMap::new();
        if let Some(series) = &existing {
            for bar in &series.data {
                merged.insert(bar.trade_date.clone(), bar.clone());
            }
        }
        for bar in clean {
            merged.insert(bar.trade_date.clone(), bar);
        }

        let mut data: Vec<Bar> = merged.into_values().collect();
        if data.len() > RETENTION_BARS {
            data.drain(..data.len() - RETENTION_BARS);
        }

        let count = data.len();
        let series = BarSeries {
            ts_code: ts_code.to_string(),
            data_count: count,
            data,
            updated_at: now_stamp(),
            source: source
                .map(str::to_string)
                .or_else(|| existing.as_ref().map(|s| s.source.clone()))
                .unwrap_or_else(|| "akshare".to_string()),
            last_update_type: update_type.to_string(),
        };

        kv::set_json(
            self.kv.as_ref(),
            &Self::key_for(ts_code),
            &series,
            Some(ttl::KLINE),
        )
        .await?;
        Ok(count)
    }

    /// Apply a realtime quote as a synthetic last bar. Runs only inside a
    /// trading session; returns `false` when the merge was skipped.
    pub async fn merge_realtime(
        &self,
        ts_code: &str,
        quote: &Quote,
        now: DateTime<Local>,
    ) -> ServiceResult<bool> {
        if !calendar::is_trading_time(now) {
            return Ok(false);
        }
        if !(quote.price > 0.0) {
            return Ok(false);
        }

        let trade_date = quote
            .update_time
            .split_whitespace()
            .next()
            .and_then(normalise_date)
            .unwrap_or_else(|| now.format("%Y-%m-%d").to_string());

        let open = quote.open.filter(|v| *v > 0.0).unwrap_or(quote.price);
        let high = quote
            .high
            .filter(|v| *v > 0.0)
            .unwrap_or(quote.price)
            .max(open)
            .max(quote.price);
        let low = quote
            .low
            .filter(|v| *v > 0.0)
            .unwrap_or(quote.price)
            .min(open)
            .min(quote.price);

        let bar = Bar {
            trade_date,
            open,
            high,
            low,
            close: quote.price,
            vol: quote.volume,
            amount: quote.amount,
            pct_chg: quote.change_percent,
            change: quote.change,
        };

        self.append(ts_code, vec![bar], UPDATE_TYPE_REALTIME, Some("realtime-merged"))
            .await?;
        Ok(true)
    }

    /// Fetch-and-store for a missing series, coalescing concurrent callers
    /// to one upstream fetch per `ts_code`.
    ///
    /// `fetch` is only invoked by the caller that wins the per-key gate;
    /// everyone else waits and then reads the stored result.
    pub async fn backfill_with<F, Fut>(
        &self,
        ts_code: &str,
        source: &str,
        fetch: F,
    ) -> ServiceResult<BarSeries>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ServiceResult<Vec<Bar>>>,
    {
        // Fast path: someone already filled it.
        if let Some(series) = self.get(ts_code).await? {
            return Ok(series);
        }

        let gate = {
            let mut gates = self.backfill_gates.lock();
            gates
                .entry(ts_code.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let _guard = gate.lock().await;

        // Re-check under the gate: a winner that finished while we waited
        // has already stored the series.
        if let Some(series) = self.get(ts_code).await? {
            return Ok(series);
        }

        info!(ts_code, "back-filling missing series from provider");
        let bars = fetch().await?;
        let sample_count = bars.len();

        match self.put(ts_code, bars, source).await? {
            PutOutcome::Stored { count, .. } => {
                self.backfill_gates.lock().remove(ts_code);
                info!(ts_code, count, "back-fill stored");
                self.get(ts_code).await?.ok_or_else(|| {
                    ServiceError::Internal(format!("series vanished after back-fill: {ts_code}"))
                })
            }
            PutOutcome::RejectedTooShort { got } => {
                self.backfill_gates.lock().remove(ts_code);
                Err(ServiceError::NotFound(format!(
                    "历史数据不足: {ts_code} ({got}/{MIN_INITIAL_BARS} bars, fetched {sample_count})"
                )))
            }
        }
    }
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Normalise dates, drop invalid bars with a warning, sort ascending, and
/// keep the newest retention window.
fn sanitise(ts_code: &str, bars: Vec<Bar>) -> Vec<Bar> {
    let mut dropped = 0usize;
    let mut clean: Vec<Bar> = bars
        .into_iter()
        .filter_map(|mut bar| {
            if !bar.normalise() || !bar.is_sane() {
                dropped += 1;
                return None;
            }
            Some(bar)
        })
        .collect();

    if dropped > 0 {
        warn!(ts_code, dropped, "dropped bars failing OHLC validation");
    }

    clean.sort_by(|a, b| a.trade_date.cmp(&b.trade_date));
    clean.dedup_by(|b, a| a.trade_date == b.trade_date);
    if clean.len() > RETENTION_BARS {
        clean.drain(..clean.len() - RETENTION_BARS);
    }
    clean
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> KlineStore {
        KlineStore::new(Arc::new(MemoryKv::new()))
    }

    fn bar(date: &str, close: f64) -> Bar {
        Bar {
            trade_date: date.to_string(),
            open: close - 0.1,
            high: close + 0.2,
            low: close - 0.3,
            close,
            vol: 1_000.0,
            amount: 10_000.0,
            pct_chg: 0.0,
            change: 0.0,
        }
    }

    fn daily_bars(n: usize) -> Vec<Bar> {
        // June 2025 has 30 days; stay within one month for simple dates.
        (0..n)
            .map(|i| bar(&format!("2025-06-{:02}", i % 28 + 1), 10.0 + i as f64 * 0.01))
            .collect()
    }

    fn session_time() -> DateTime<Local> {
        // Monday 2025-06-02 10:05 local.
        Local.with_ymd_and_hms(2025, 6, 2, 10, 5, 0).single().unwrap()
    }

    fn quote(price: f64, day: &str) -> Quote {
        Quote {
            code: "600000".into(),
            name: Some("浦发银行".into()),
            price,
            change: 0.1,
            change_percent: 1.0,
            open: Some(price - 0.2),
            high: Some(price + 0.1),
            low: Some(price - 0.4),
            pre_close: Some(price - 0.1),
            volume: 12_345_678.0,
            amount: 123_456_780.0,
            turnover_rate: Some(0.5),
            update_time: format!("{day} 10:05:00"),
        }
    }

    #[tokio::test]
    async fn put_rejects_short_series_for_new_symbol() {
        let store = store();
        let outcome = store
            .put("600000.SH", daily_bars(5), "tushare")
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::RejectedTooShort { got: 5 });
        assert!(!store.exists("600000.SH").await.unwrap());
    }

    #[tokio::test]
    async fn put_accepts_short_series_for_existing_symbol() {
        let store = store();
        store.put("600000.SH", daily_bars(25), "tushare").await.unwrap();
        let outcome = store
            .put("600000.SH", daily_bars(5), "tushare")
            .await
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Stored { count: 5, .. }));
    }

    #[tokio::test]
    async fn put_drops_insane_bars_and_normalises_dates() {
        let store = store();
        let mut bars = daily_bars(25);
        bars[1].trade_date = "20250601".into(); // compact form, duplicate of bars[0]
        bars[3].close = 0.0; // dropped
        bars[4].high = bars[4].low - 1.0; // dropped

        let outcome = store.put("600000.SH", bars, "tushare").await.unwrap();
        let PutOutcome::Stored { count, dropped } = outcome else {
            panic!("expected stored outcome");
        };
        assert_eq!(dropped, 2);
        // 25 - 2 dropped - 1 date dedup
        assert_eq!(count, 22);

        let series = store.get("600000.SH").await.unwrap().unwrap();
        assert!(series.is_monotonic());
        assert!(series.data.iter().all(|b| b.trade_date.contains('-')));
    }

    #[tokio::test]
    async fn append_same_date_replaces_last_bar() {
        let store = store();
        store.put("600000.SH", daily_bars(25), "tushare").await.unwrap();
        let before = store.get("600000.SH").await.unwrap().unwrap();
        let last_date = before.data.last().unwrap().trade_date.clone();

        let replacement = bar(&last_date, 99.0);
        store
            .append("600000.SH", vec![replacement], "incremental", None)
            .await
            .unwrap();

        let after = store.get("600000.SH").await.unwrap().unwrap();
        assert_eq!(after.data.len(), before.data.len());
        assert_eq!(after.data.last().unwrap().close, 99.0);
        assert!(after.is_monotonic());
    }

    #[tokio::test]
    async fn append_newer_date_extends_and_trims() {
        let store = store();
        let full: Vec<Bar> = (0..RETENTION_BARS)
            .map(|i| {
                let day = 1 + i % 27;
                let month = 1 + (i / 27) as u32;
                bar(&format!("2025-{:02}-{:02}", month, day), 10.0)
            })
            .collect();
        store.put("600000.SH", full, "tushare").await.unwrap();

        let count = store
            .append("600000.SH", vec![bar("2025-12-01", 11.0)], "incremental", None)
            .await
            .unwrap();
        assert_eq!(count, RETENTION_BARS);

        let series = store.get("600000.SH").await.unwrap().unwrap();
        assert_eq!(series.data.len(), RETENTION_BARS);
        assert_eq!(series.data.last().unwrap().trade_date, "2025-12-01");
    }

    #[tokio::test]
    async fn merge_realtime_replaces_same_day_and_appends_next_day() {
        let store = store();
        // 24 May bars, then one bar on the session date so the stored
        // series ends exactly on 2025-06-02.
        let mut bars: Vec<Bar> = (1..=24)
            .map(|d| bar(&format!("2025-05-{d:02}"), 9.0 + d as f64 * 0.01))
            .collect();
        bars.push(bar("2025-06-02", 9.5));
        store.put("600000.SH", bars, "tushare").await.unwrap();
        let len_before = store.get("600000.SH").await.unwrap().unwrap().data.len();
        assert_eq!(len_before, 25);

        // Same-day quote: in-place replacement.
        let merged = store
            .merge_realtime("600000.SH", &quote(10.0, "2025-06-02"), session_time())
            .await
            .unwrap();
        assert!(merged);
        let series = store.get("600000.SH").await.unwrap().unwrap();
        assert_eq!(series.data.len(), len_before);
        assert_eq!(series.data.last().unwrap().close, 10.0);
        assert_eq!(series.last_update_type, "realtime");
        assert_eq!(series.source, "realtime-merged");
        assert!(series.data.last().unwrap().is_sane());

        // Next-day quote: appended.
        let tomorrow = Local.with_ymd_and_hms(2025, 6, 3, 10, 5, 0).single().unwrap();
        store
            .merge_realtime("600000.SH", &quote(10.2, "2025-06-03"), tomorrow)
            .await
            .unwrap();
        let series = store.get("600000.SH").await.unwrap().unwrap();
        assert_eq!(series.data.len(), len_before + 1);
        assert!(series.is_monotonic());
        assert!(series.data.len() <= RETENTION_BARS);
    }

    #[tokio::test]
    async fn merge_realtime_skipped_outside_session() {
        let store = store();
        store.put("600000.SH", daily_bars(25), "tushare").await.unwrap();

        let sunday = Local.with_ymd_and_hms(2025, 6, 8, 10, 5, 0).single().unwrap();
        let merged = store
            .merge_realtime("600000.SH", &quote(10.0, "2025-06-08"), sunday)
            .await
            .unwrap();
        assert!(!merged);
    }

    #[tokio::test]
    async fn backfill_coalesces_concurrent_fetches() {
        let store = Arc::new(store());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                store
                    .backfill_with("600519.SH", "tushare", move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        // Simulate upstream latency so the others pile up.
                        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                        Ok(daily_bars(25))
                    })
                    .await
            }));
        }

        for handle in handles {
            let series = handle.await.unwrap().unwrap();
            assert_eq!(series.ts_code, "600519.SH");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backfill_reports_insufficient_history() {
        let store = store();
        let err = store
            .backfill_with("600519.SH", "tushare", || async { Ok(daily_bars(3)) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(err.to_string().contains("历史数据不足"));
    }

    #[test]
    fn etf_namespace_selection() {
        assert_eq!(KlineStore::key_for("600000.SH"), "stock_trend:600000.SH");
        assert_eq!(KlineStore::key_for("510030.SH"), "etf_trend:510030.SH");
        assert_eq!(KlineStore::key_for("159915.SZ"), "etf_trend:159915.SZ");
    }
}
