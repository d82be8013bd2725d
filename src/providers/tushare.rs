// =============================================================================
// Tushare adapter — pro_api over HTTP POST
// =============================================================================
//
// Every call POSTs `{api_name, token, params, fields}` to the pro gateway
// and receives `{code, msg, data: {fields: [...], items: [[...]]}}`.
//
// Unit conversions fixed at this boundary:
//   * `vol` arrives in hands (lots of 100 shares)  -> ×100 to shares
//   * `amount` arrives in thousands of yuan        -> ×1000 to yuan
//
// Tushare has no batch realtime snapshot; those operations report
// `provider_empty` and the fabric falls through to Eastmoney/Sina.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::model::{Bar, Quote, SymbolInfo};
use crate::providers::{json_num, json_str, ProviderAdapter};
use crate::types::{is_etf_symbol, ProviderKind};

const DEFAULT_BASE_URL: &str = "http://api.tushare.pro";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const DAILY_FIELDS: &str = "ts_code,trade_date,open,high,low,close,vol,amount,pct_chg,change";
const STOCK_BASIC_FIELDS: &str = "ts_code,symbol,name,area,industry,market,list_date";
const FUND_BASIC_FIELDS: &str = "ts_code,name,market,list_date";

pub struct TushareAdapter {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl TushareAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Constructor with an explicit gateway URL, used by tests.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self {
            token: token.into(),
            base_url: base_url.into(),
            http,
        }
    }

    /// Issue one pro_api call and return `(fields, items)` from the payload.
    async fn query(
        &self,
        api_name: &str,
        params: Value,
        fields: &str,
    ) -> ServiceResult<(Vec<String>, Vec<Vec<Value>>)> {
        let body = json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": fields,
        });

        let resp = self
            .http
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderHttp {
                provider: "tushare".into(),
                message: format!("{api_name}: {e}"),
            })?;

        let status = resp.status();
        let payload: Value = resp.json().await.map_err(|e| ServiceError::ProviderParse {
            provider: "tushare".into(),
            message: format!("{api_name}: {e}"),
        })?;

        if !status.is_success() {
            return Err(ServiceError::ProviderHttp {
                provider: "tushare".into(),
                message: format!("{api_name}: http {status}"),
            });
        }

        let code = payload["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            let msg = payload["msg"].as_str().unwrap_or("unknown error");
            return Err(ServiceError::ProviderHttp {
                provider: "tushare".into(),
                message: format!("{api_name}: code {code}: {msg}"),
            });
        }

        let fields: Vec<String> = payload["data"]["fields"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| json_str(v)).collect())
            .unwrap_or_default();
        let items: Vec<Vec<Value>> = payload["data"]["items"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();

        debug!(api_name, rows = items.len(), "tushare response parsed");
        Ok((fields, items))
    }
}

/// Column-name → index lookup for the positional `items` rows.
fn field_index(fields: &[String]) -> HashMap<&str, usize> {
    fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.as_str(), i))
        .collect()
}

fn cell<'a>(row: &'a [Value], idx: &HashMap<&str, usize>, name: &str) -> Option<&'a Value> {
    idx.get(name).and_then(|i| row.get(*i))
}

#[async_trait]
impl ProviderAdapter for TushareAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tushare
    }

    async fn snapshot_all_stocks(&self) -> ServiceResult<Vec<Quote>> {
        Err(ServiceError::ProviderEmpty {
            provider: "tushare (no realtime snapshot api)".into(),
        })
    }

    async fn snapshot_all_etfs(&self) -> ServiceResult<Vec<Quote>> {
        Err(ServiceError::ProviderEmpty {
            provider: "tushare (no realtime snapshot api)".into(),
        })
    }

    async fn daily_bars(&self, ts_code: &str, from: &str, to: &str) -> ServiceResult<Vec<Bar>> {
        let symbol = ts_code.split('.').next().unwrap_or(ts_code);
        let api_name = if is_etf_symbol(symbol) {
            "fund_daily"
        } else {
            "daily"
        };

        let (fields, items) = self
            .query(
                api_name,
                json!({ "ts_code": ts_code, "start_date": from, "end_date": to }),
                DAILY_FIELDS,
            )
            .await?;

        if items.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "tushare".into(),
            });
        }

        let idx = field_index(&fields);
        let mut dropped = 0usize;
        let mut bars: Vec<Bar> = items
            .iter()
            .filter_map(|row| {
                let get = |name: &str| cell(row, &idx, name).and_then(json_num);
                let bar = Bar {
                    trade_date: cell(row, &idx, "trade_date").and_then(json_str)?,
                    open: get("open")?,
                    high: get("high")?,
                    low: get("low")?,
                    close: get("close")?,
                    // hands -> shares
                    vol: get("vol")? * 100.0,
                    // thousands of yuan -> yuan
                    amount: get("amount").unwrap_or(0.0) * 1000.0,
                    pct_chg: get("pct_chg").unwrap_or(0.0),
                    change: get("change").unwrap_or(0.0),
                };
                if bar.close > 0.0 {
                    Some(bar)
                } else {
                    dropped += 1;
                    None
                }
            })
            .collect();

        if dropped > 0 {
            warn!(ts_code, dropped, "tushare daily rows dropped");
        }

        // Tushare returns newest-first; callers expect date-ascending.
        bars.sort_by(|a, b| a.trade_date.cmp(&b.trade_date));
        Ok(bars)
    }

    async fn symbol_master(&self) -> ServiceResult<Vec<SymbolInfo>> {
        let (fields, items) = self
            .query(
                "stock_basic",
                json!({ "exchange": "", "list_status": "L" }),
                STOCK_BASIC_FIELDS,
            )
            .await?;

        if items.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "tushare".into(),
            });
        }

        let idx = field_index(&fields);
        let mut dropped = 0usize;
        let records: Vec<SymbolInfo> = items
            .iter()
            .filter_map(|row| {
                let get = |name: &str| cell(row, &idx, name).and_then(json_str);
                let record = SymbolInfo {
                    ts_code: get("ts_code")?,
                    symbol: get("symbol").unwrap_or_default(),
                    name: get("name")?,
                    market: get("market").unwrap_or_default(),
                    industry: get("industry").unwrap_or_default(),
                    area: get("area").unwrap_or_default(),
                    list_date: get("list_date").unwrap_or_default(),
                };
                Some(record)
            })
            .collect();

        dropped += items.len() - records.len();
        if dropped > 0 {
            warn!(dropped, "tushare stock_basic rows dropped");
        }
        Ok(records)
    }
}

impl TushareAdapter {
    /// ETF master list via `fund_basic` (exchange-traded funds only).
    pub async fn etf_master(&self) -> ServiceResult<Vec<SymbolInfo>> {
        let (fields, items) = self
            .query("fund_basic", json!({ "market": "E" }), FUND_BASIC_FIELDS)
            .await?;

        if items.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "tushare".into(),
            });
        }

        let idx = field_index(&fields);
        let records: Vec<SymbolInfo> = items
            .iter()
            .filter_map(|row| {
                let get = |name: &str| cell(row, &idx, name).and_then(json_str);
                let ts_code = get("ts_code")?;
                let symbol = ts_code.split('.').next().unwrap_or_default().to_string();
                Some(SymbolInfo {
                    ts_code,
                    symbol,
                    name: get("name")?,
                    market: "ETF".into(),
                    industry: String::new(),
                    area: String::new(),
                    list_date: get("list_date").unwrap_or_default(),
                })
            })
            .collect();
        Ok(records)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn daily_payload() -> (Vec<String>, Vec<Vec<Value>>) {
        let fields: Vec<String> = DAILY_FIELDS.split(',').map(str::to_string).collect();
        let items = vec![
            vec![
                json!("600000.SH"),
                json!("20241220"),
                json!(10.0),
                json!(10.5),
                json!(9.8),
                json!(10.2),
                json!(123.45),
                json!(1260.0),
                json!(2.0),
                json!(0.2),
            ],
            // close == 0 -> dropped
            vec![
                json!("600000.SH"),
                json!("20241219"),
                json!(10.0),
                json!(10.5),
                json!(9.8),
                json!(0.0),
                json!(100.0),
                json!(1000.0),
                json!(0.0),
                json!(0.0),
            ],
        ];
        (fields, items)
    }

    // Exercise the row-mapping logic directly; the HTTP path is covered by
    // the fabric tests with an injected fake adapter.
    #[test]
    fn daily_row_unit_conversion() {
        let (fields, items) = daily_payload();
        let idx = field_index(&fields);

        let row = &items[0];
        let vol = cell(row, &idx, "vol").and_then(json_num).unwrap() * 100.0;
        let amount = cell(row, &idx, "amount").and_then(json_num).unwrap() * 1000.0;
        assert_eq!(vol, 12_345.0);
        assert_eq!(amount, 1_260_000.0);
    }

    #[test]
    fn field_index_maps_positionally() {
        let fields: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let idx = field_index(&fields);
        let row = vec![json!(1), json!(2), json!(3)];
        assert_eq!(cell(&row, &idx, "b").and_then(json_num), Some(2.0));
        assert_eq!(cell(&row, &idx, "missing"), None);
    }

    #[tokio::test]
    async fn snapshot_is_unsupported() {
        let adapter = TushareAdapter::new("test-token");
        let err = adapter.snapshot_all_stocks().await.unwrap_err();
        assert_eq!(err.kind(), "provider_empty");
    }
}
