// =============================================================================
// Realtime quote service — snapshot cycles, fan-in/fan-out
// =============================================================================
//
// One snapshot cycle pulls the full A-share table (optionally plus ETFs)
// through the fetch fabric, writes the normalised result to
// `stock:realtime` (5-minute TTL), and — during a trading session only —
// fans the quotes out to the K-line store through a bounded worker pool
// so each known symbol's last bar tracks the live price.
//
// A cycle in which every provider fails is logged and skipped: the
// previous snapshot stays readable until its TTL expires and the fan-out
// does not run.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calendar;
use crate::error::{ServiceError, ServiceResult};
use crate::model::Quote;
use crate::providers::FetchFabric;
use crate::store::keys::{self, ttl};
use crate::store::kv::{self, KvStore};
use crate::store::{KlineStore, SymbolRegistry};
use crate::types::ProviderChoice;

/// Bound on the fan-out queue; symbols beyond it are dropped for the
/// cycle (the Redis snapshot still carries the full table).
const MERGE_QUEUE_CAP: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    pub include_etf: bool,
    /// Override of the configured provider for this cycle.
    pub provider: Option<ProviderChoice>,
}

/// The stored `stock:realtime` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCycle {
    pub data: Vec<Quote>,
    pub count: usize,
    pub source: String,
    pub update_time: String,
}

pub struct RealtimeService {
    kv: Arc<dyn KvStore>,
    fabric: Arc<FetchFabric>,
    kline: Arc<KlineStore>,
    registry: Arc<SymbolRegistry>,
    default_choice: ProviderChoice,
    merge_workers: usize,
}

impl RealtimeService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        fabric: Arc<FetchFabric>,
        kline: Arc<KlineStore>,
        registry: Arc<SymbolRegistry>,
        default_choice: ProviderChoice,
        merge_workers: usize,
    ) -> Self {
        Self {
            kv,
            fabric,
            kline,
            registry,
            default_choice,
            merge_workers: merge_workers.max(1),
        }
    }

    /// Pull one full snapshot cycle. `now` is passed in so that the
    /// session gate for the merge fan-out is testable.
    pub async fn snapshot_all(
        &self,
        opts: SnapshotOptions,
        now: DateTime<Local>,
    ) -> ServiceResult<SnapshotCycle> {
        let choice = opts.provider.unwrap_or(self.default_choice);

        let (mut quotes, source) = self
            .fabric
            .call(choice, |p| Box::pin(async move { p.snapshot_all_stocks().await }))
            .await?;

        if opts.include_etf {
            match self
                .fabric
                .call(choice, |p| Box::pin(async move { p.snapshot_all_etfs().await }))
                .await
            {
                Ok((etfs, _)) => quotes.extend(etfs),
                // ETF legs are best-effort; the stock table alone is a
                // valid cycle.
                Err(e) => warn!(error = %e, "etf snapshot leg failed"),
            }
        }

        let cycle = SnapshotCycle {
            count: quotes.len(),
            source: source.to_string(),
            update_time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            data: quotes,
        };

        kv::set_json(
            self.kv.as_ref(),
            keys::STOCK_REALTIME,
            &cycle,
            Some(ttl::REALTIME),
        )
        .await?;
        info!(count = cycle.count, source = %cycle.source, "realtime snapshot stored");

        if calendar::is_trading_time(now) {
            self.fan_out_merge(&cycle.data, now).await;
        }

        Ok(cycle)
    }

    /// Merge each quote with a known symbol into its K-line series,
    /// bounded by `MERGE_QUEUE_CAP` and `merge_workers`.
    async fn fan_out_merge(&self, quotes: &[Quote], now: DateTime<Local>) {
        let code_map = match self.known_ts_codes().await {
            Ok(map) if !map.is_empty() => map,
            Ok(_) => {
                debug!("no registry entries, skipping realtime merge");
                return;
            }
            Err(e) => {
                warn!(error = %e, "registry unavailable, skipping realtime merge");
                return;
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<(String, Quote)>(MERGE_QUEUE_CAP);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let merged = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(self.merge_workers);
        for _ in 0..self.merge_workers {
            let rx = rx.clone();
            let kline = self.kline.clone();
            let merged = merged.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some((ts_code, quote)) = next else { break };
                    match kline.merge_realtime(&ts_code, &quote, now).await {
                        Ok(true) => {
                            merged.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => debug!(ts_code, error = %e, "realtime merge failed"),
                    }
                }
            }));
        }

        let mut dropped = 0usize;
        let mut queued = 0usize;
        for quote in quotes {
            let Some(ts_code) = code_map.get(&quote.code) else {
                continue;
            };
            match tx.try_send((ts_code.clone(), quote.clone())) {
                Ok(()) => queued += 1,
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => dropped += 1,
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        drop(tx);

        for worker in workers {
            let _ = worker.await;
        }

        if dropped > 0 {
            warn!(dropped, queued, "merge fan-out queue overflow, symbols skipped this cycle");
        }
        info!(
            merged = merged.load(Ordering::Relaxed),
            queued, "realtime merge fan-out complete"
        );
    }

    /// `symbol -> ts_code` for every registered stock and ETF.
    async fn known_ts_codes(&self) -> ServiceResult<HashMap<String, String>> {
        let mut map = HashMap::new();
        for record in self.registry.load().await? {
            map.insert(record.symbol.clone(), record.ts_code.clone());
        }
        for record in self.registry.load_etfs().await? {
            map.insert(record.symbol.clone(), record.ts_code.clone());
        }
        Ok(map)
    }

    /// One symbol's quote, answered from the cached cycle when possible.
    /// A batch pull is cheaper upstream than any per-symbol endpoint.
    pub async fn snapshot_one(
        &self,
        symbol: &str,
        now: DateTime<Local>,
    ) -> ServiceResult<Quote> {
        if let Some(cycle) =
            kv::get_json::<SnapshotCycle>(self.kv.as_ref(), keys::STOCK_REALTIME).await?
        {
            if let Some(quote) = cycle.data.iter().find(|q| q.code == symbol) {
                return Ok(quote.clone());
            }
        }

        let cycle = self
            .snapshot_all(SnapshotOptions::default(), now)
            .await?;
        cycle
            .data
            .into_iter()
            .find(|q| q.code == symbol)
            .ok_or_else(|| ServiceError::NotFound(format!("no realtime data for {symbol}")))
    }

    /// The last stored cycle, if any.
    pub async fn cached_cycle(&self) -> ServiceResult<Option<SnapshotCycle>> {
        kv::get_json(self.kv.as_ref(), keys::STOCK_REALTIME).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::model::{Bar, SymbolInfo};
    use crate::providers::{FabricConfig, ProviderAdapter};
    use crate::store::kv::MemoryKv;
    use crate::types::ProviderKind;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FakeProvider {
        kind: ProviderKind,
        quotes: Vec<Quote>,
        fail: bool,
    }

    #[async_trait]
    impl ProviderAdapter for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn snapshot_all_stocks(&self) -> ServiceResult<Vec<Quote>> {
            if self.fail {
                Err(ServiceError::ProviderHttp {
                    provider: self.kind.to_string(),
                    message: "http 500".into(),
                })
            } else {
                Ok(self.quotes.clone())
            }
        }

        async fn snapshot_all_etfs(&self) -> ServiceResult<Vec<Quote>> {
            Err(ServiceError::ProviderEmpty {
                provider: self.kind.to_string(),
            })
        }

        async fn daily_bars(&self, _: &str, _: &str, _: &str) -> ServiceResult<Vec<Bar>> {
            Err(ServiceError::ProviderEmpty {
                provider: self.kind.to_string(),
            })
        }

        async fn symbol_master(&self) -> ServiceResult<Vec<SymbolInfo>> {
            Err(ServiceError::ProviderEmpty {
                provider: self.kind.to_string(),
            })
        }
    }

    fn quote(code: &str, price: f64) -> Quote {
        Quote {
            code: code.to_string(),
            name: Some(format!("股票{code}")),
            price,
            change: 0.1,
            change_percent: 1.0,
            open: Some(price - 0.2),
            high: Some(price + 0.1),
            low: Some(price - 0.4),
            pre_close: Some(price - 0.1),
            volume: 12_345_678.0,
            amount: 1.0e8,
            turnover_rate: None,
            update_time: "2025-06-02 10:05:00".into(),
        }
    }

    fn big_universe(n: usize) -> Vec<Quote> {
        let mut quotes: Vec<Quote> = (0..n - 1)
            .map(|i| quote(&format!("{:06}", 600001 + i), 12.0))
            .collect();
        quotes.push(quote("600000", 10.0));
        quotes
    }

    fn session_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 2, 10, 5, 0).single().unwrap()
    }

    fn fast_config() -> FabricConfig {
        FabricConfig {
            min_request_interval: std::time::Duration::from_millis(1),
            jitter_max: std::time::Duration::ZERO,
            retry_times: 0,
            backoff_secs: (0.001, 0.002),
            auto_switch: true,
        }
    }

    async fn service_with(
        quotes: Vec<Quote>,
        fail: bool,
    ) -> (RealtimeService, Arc<MemoryKv>, Arc<KlineStore>) {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let kv_dyn: Arc<dyn KvStore> = kv.clone();
        let kline = Arc::new(KlineStore::new(kv_dyn.clone()));
        let registry = Arc::new(SymbolRegistry::new(kv_dyn.clone()));

        // Register the symbol whose series the merge must update.
        registry
            .store_stocks(vec![SymbolInfo {
                ts_code: "600000.SH".into(),
                symbol: "600000".into(),
                name: "浦发银行".into(),
                market: "SH".into(),
                industry: String::new(),
                area: String::new(),
                list_date: String::new(),
            }])
            .await
            .unwrap();

        // Seed a series ending on the session date.
        let mut bars: Vec<Bar> = (1..=24)
            .map(|d| Bar {
                trade_date: format!("2025-05-{d:02}"),
                open: 9.0,
                high: 9.5,
                low: 8.8,
                close: 9.2,
                vol: 1000.0,
                amount: 9200.0,
                pct_chg: 0.0,
                change: 0.0,
            })
            .collect();
        bars.push(Bar {
            trade_date: "2025-06-02".into(),
            open: 9.2,
            high: 9.6,
            low: 9.1,
            close: 9.4,
            vol: 1000.0,
            amount: 9400.0,
            pct_chg: 0.0,
            change: 0.0,
        });
        kline.put("600000.SH", bars, "tushare").await.unwrap();

        let em = Arc::new(FakeProvider {
            kind: ProviderKind::Eastmoney,
            quotes,
            fail,
        });
        let fabric = Arc::new(FetchFabric::new(vec![em], fast_config()));

        let service = RealtimeService::new(
            kv_dyn,
            fabric,
            kline.clone(),
            registry,
            ProviderChoice::Eastmoney,
            4,
        );
        (service, kv, kline)
    }

    #[tokio::test]
    async fn trading_hour_cycle_stores_snapshot_and_merges_last_bar() {
        let (service, kv, kline) = service_with(big_universe(3000), false).await;

        let cycle = service
            .snapshot_all(SnapshotOptions::default(), session_time())
            .await
            .unwrap();
        assert!(cycle.count >= 3000);
        assert_eq!(cycle.source, "eastmoney");

        // Snapshot persisted with TTL.
        let stored: SnapshotCycle = kv::get_json(kv.as_ref(), keys::STOCK_REALTIME)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.count >= 3000);
        assert!(kv.ttl_of(keys::STOCK_REALTIME).is_some());

        // Known symbol's last bar overwritten in place.
        let series = kline.get("600000.SH").await.unwrap().unwrap();
        let last = series.data.last().unwrap();
        assert_eq!(last.trade_date, "2025-06-02");
        assert_eq!(last.close, 10.0);
        assert_eq!(series.last_update_type, "realtime");
        assert!(series.is_monotonic());
    }

    #[tokio::test]
    async fn off_session_cycle_skips_merge() {
        let (service, _kv, kline) = service_with(big_universe(10), false).await;

        let evening = Local.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).single().unwrap();
        service
            .snapshot_all(SnapshotOptions::default(), evening)
            .await
            .unwrap();

        let series = kline.get("600000.SH").await.unwrap().unwrap();
        assert_eq!(series.data.last().unwrap().close, 9.4);
        assert_eq!(series.last_update_type, "history");
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let (service, kv, _kline) = service_with(big_universe(10), false).await;
        service
            .snapshot_all(SnapshotOptions::default(), session_time())
            .await
            .unwrap();

        // Second service against the same kv, but failing upstream.
        let kv_dyn: Arc<dyn KvStore> = kv.clone();
        let kline = Arc::new(KlineStore::new(kv_dyn.clone()));
        let registry = Arc::new(SymbolRegistry::new(kv_dyn.clone()));
        let em = Arc::new(FakeProvider {
            kind: ProviderKind::Eastmoney,
            quotes: Vec::new(),
            fail: true,
        });
        let fabric = Arc::new(FetchFabric::new(vec![em], fast_config()));
        let failing = RealtimeService::new(
            kv_dyn,
            fabric,
            kline,
            registry,
            ProviderChoice::Eastmoney,
            2,
        );

        let err = failing
            .snapshot_all(SnapshotOptions::default(), session_time())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limit_exhausted");

        // Previous cycle still readable.
        let cached = failing.cached_cycle().await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn snapshot_one_answers_from_cache() {
        let (service, _kv, _kline) = service_with(big_universe(10), false).await;
        service
            .snapshot_all(SnapshotOptions::default(), session_time())
            .await
            .unwrap();

        let quote = service.snapshot_one("600000", session_time()).await.unwrap();
        assert_eq!(quote.price, 10.0);

        let missing = service.snapshot_one("999999", session_time()).await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }
}
