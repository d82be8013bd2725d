// =============================================================================
// Symbol registry — stock + ETF master lists
// =============================================================================
//
// The registry owns `stocks:codes:all`, the per-symbol `stock_list` hash,
// and the parallel `etf:codes:all` namespace. Master data never expires;
// a refresh always overwrites. The completeness gate (>= 5000 stocks and
// >= 1 ETF) guards strategy and realtime jobs against running on a
// half-initialised keyspace.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::model::SymbolInfo;
use crate::store::keys;
use crate::store::kv::{self, KvStore};
use crate::types::{classify_symbol, ts_code_for, Market};

/// Minimum stock records for the registry to count as usable.
pub const MIN_STOCK_RECORDS: usize = 5_000;

/// ETF names containing any of these are tradable same-day (T+0):
/// cross-border, bond, commodity and money-market funds.
const T0_KEYWORDS: &[&str] = &[
    "跨境", "QDII", "海外", "全球", "国际", "港股", "恒生", "香港", "美股", "纳", "标普",
    "道琼", "日经", "欧洲", "德国", "英国", "法国", "新兴", "亚太", "债", "黄金", "货币",
    "白银", "原油",
];

/// Readiness diagnostic returned by the completeness gate.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub stock_count: usize,
    pub etf_count: usize,
    pub reason: Option<String>,
}

pub struct SymbolRegistry {
    kv: Arc<dyn KvStore>,
}

impl SymbolRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The stored stock master list (empty when never initialised).
    pub async fn load(&self) -> ServiceResult<Vec<SymbolInfo>> {
        Ok(kv::get_json(self.kv.as_ref(), keys::STOCK_CODES_ALL)
            .await?
            .unwrap_or_default())
    }

    /// The stored ETF master list.
    pub async fn load_etfs(&self) -> ServiceResult<Vec<SymbolInfo>> {
        Ok(kv::get_json(self.kv.as_ref(), keys::ETF_CODES_ALL)
            .await?
            .unwrap_or_default())
    }

    /// One record by 6-digit symbol, from the per-symbol hash.
    pub async fn lookup(&self, symbol: &str) -> ServiceResult<Option<SymbolInfo>> {
        kv::hget_json(self.kv.as_ref(), keys::STOCK_LIST, symbol).await
    }

    /// Overwrite the stock master list and the per-symbol hash.
    pub async fn store_stocks(&self, records: Vec<SymbolInfo>) -> ServiceResult<usize> {
        let records = normalise_master(records, false);
        kv::set_json(self.kv.as_ref(), keys::STOCK_CODES_ALL, &records, None).await?;

        let entries: Vec<(String, String)> = records
            .iter()
            .filter_map(|r| {
                serde_json::to_string(r)
                    .ok()
                    .map(|json| (r.symbol.clone(), json))
            })
            .collect();
        self.kv.hset_many(keys::STOCK_LIST, &entries).await?;

        info!(count = records.len(), "stock master list stored");
        Ok(records.len())
    }

    /// Overwrite the ETF master list (LOF funds excluded).
    pub async fn store_etfs(&self, records: Vec<SymbolInfo>) -> ServiceResult<usize> {
        let records = normalise_master(records, true);
        kv::set_json(self.kv.as_ref(), keys::ETF_CODES_ALL, &records, None).await?;
        info!(count = records.len(), "etf master list stored");
        Ok(records.len())
    }

    /// Completeness diagnostic without failing.
    pub async fn readiness(&self) -> ServiceResult<Readiness> {
        let stock_count = self.load().await?.len();
        let etf_count = self.load_etfs().await?.len();
        let ready = stock_count >= MIN_STOCK_RECORDS && etf_count >= 1;
        let reason = if ready {
            None
        } else {
            Some(format!(
                "registry incomplete: {stock_count}/{MIN_STOCK_RECORDS} stocks, {etf_count}/1 etfs"
            ))
        };
        Ok(Readiness {
            ready,
            stock_count,
            etf_count,
            reason,
        })
    }

    /// Gate for strategy / realtime jobs: `Err(NotReady)` with the
    /// diagnostic when the registry is incomplete.
    pub async fn ensure_ready(&self) -> ServiceResult<()> {
        let readiness = self.readiness().await?;
        match readiness.reason {
            None => Ok(()),
            Some(reason) => {
                warn!(
                    stocks = readiness.stock_count,
                    etfs = readiness.etf_count,
                    "completeness gate declined"
                );
                Err(ServiceError::NotReady(reason))
            }
        }
    }
}

/// Classify codes, fill missing markets, tag ETFs T+0/T+1, drop LOF funds
/// and records whose code cannot be classified.
fn normalise_master(records: Vec<SymbolInfo>, etf: bool) -> Vec<SymbolInfo> {
    let mut out = Vec::with_capacity(records.len());
    let mut skipped = 0usize;

    for mut record in records {
        if record.symbol.is_empty() {
            record.symbol = record
                .ts_code
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string();
        }

        let Some((market, _)) = classify_symbol(&record.symbol) else {
            skipped += 1;
            continue;
        };

        if etf {
            if record.name.contains("LOF") {
                skipped += 1;
                continue;
            }
            record.market = Market::ETF.to_string();
            let t0 = T0_KEYWORDS.iter().any(|kw| record.name.contains(kw));
            record.industry = if t0 { "T+0交易" } else { "T+1交易" }.to_string();
        } else {
            // Providers report board names here; the stored contract is the
            // exchange code.
            record.market = market.to_string();
        }

        if record.ts_code.is_empty() {
            match ts_code_for(&record.symbol) {
                Some(ts_code) => record.ts_code = ts_code,
                None => {
                    skipped += 1;
                    continue;
                }
            }
        }

        out.push(record);
    }

    if skipped > 0 {
        warn!(skipped, "skipped unclassifiable master records");
    }
    out
}
