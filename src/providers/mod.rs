// =============================================================================
// Provider adapters — uniform interface over upstream market data feeds
// =============================================================================
//
// One adapter per provider. Each adapter owns its wire format entirely:
// provider-specific field names (including the Chinese column headers of
// the spot tables) are parsed here and never leak past the adapter. All
// operations return the normalised shapes from `model` with fixed units
// (volume in shares, amount in yuan).
//
// Rows failing numeric parsing or carrying a non-positive price/close are
// dropped with a counted warning; a bulk parse never fails the operation.
// =============================================================================

pub mod eastmoney;
pub mod fabric;
pub mod sina;
pub mod tushare;

use async_trait::async_trait;

use crate::error::ServiceResult;
use crate::model::{Bar, Quote, SymbolInfo};
use crate::types::ProviderKind;

pub use fabric::{FetchFabric, FabricConfig, ProviderStats};

/// Uniform operations every provider adapter implements. Operations an
/// upstream genuinely does not offer return `ProviderEmpty` so that the
/// fetch fabric simply moves on to the next provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Full A-share realtime snapshot.
    async fn snapshot_all_stocks(&self) -> ServiceResult<Vec<Quote>>;

    /// Full ETF realtime snapshot.
    async fn snapshot_all_etfs(&self) -> ServiceResult<Vec<Quote>>;

    /// Daily bars for one symbol, dates in compact `YYYYMMDD` form.
    async fn daily_bars(&self, ts_code: &str, from: &str, to: &str) -> ServiceResult<Vec<Bar>>;

    /// The symbol master list (implemented by at least one provider).
    async fn symbol_master(&self) -> ServiceResult<Vec<SymbolInfo>>;
}

/// Lenient numeric extraction: upstream tables mix JSON numbers, numeric
/// strings, `"-"` placeholders and nulls.
pub(crate) fn json_num(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub(crate) fn json_str(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamp attached to every normalised quote.
pub(crate) fn snapshot_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
