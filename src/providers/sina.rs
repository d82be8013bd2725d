// =============================================================================
// Sina adapter — spot table with exchange-prefixed codes
// =============================================================================
//
// Same AKShare-compatible gateway as the Eastmoney adapter, but the Sina
// feed reports codes as `sh600000` / `sz000001` / `bj430047`. The prefix
// is stripped and the 6-digit remainder validated before a row is
// accepted. Sina provides no turnover rate and no daily-history endpoint.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::model::{Bar, Quote, SymbolInfo};
use crate::providers::{json_num, json_str, snapshot_stamp, ProviderAdapter};
use crate::types::ProviderKind;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SinaAdapter {
    base_url: String,
    http: reqwest::Client,
}

impl SinaAdapter {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    async fn fetch_rows(&self, path: &str) -> ServiceResult<Vec<Value>> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderHttp {
                provider: "sina".into(),
                message: format!("{path}: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ServiceError::ProviderHttp {
                provider: "sina".into(),
                message: format!("{path}: http {status}"),
            });
        }

        let payload: Value = resp.json().await.map_err(|e| ServiceError::ProviderParse {
            provider: "sina".into(),
            message: format!("{path}: {e}"),
        })?;

        payload
            .as_array()
            .cloned()
            .ok_or_else(|| ServiceError::ProviderParse {
                provider: "sina".into(),
                message: format!("{path}: expected a row array"),
            })
    }

    /// Strip the `sh`/`sz`/`bj` exchange prefix; the remainder must be six
    /// digits or the row is rejected.
    fn clean_code(raw: &str) -> Option<String> {
        let code = raw
            .strip_prefix("sh")
            .or_else(|| raw.strip_prefix("sz"))
            .or_else(|| raw.strip_prefix("bj"))
            .unwrap_or(raw);
        if code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) {
            Some(code.to_string())
        } else {
            None
        }
    }

    fn parse_spot_rows(rows: Vec<Value>) -> Vec<Quote> {
        let stamp = snapshot_stamp();
        let mut dropped = 0usize;

        let quotes: Vec<Quote> = rows
            .iter()
            .filter_map(|row| {
                let raw_code = json_str(&row["代码"])?;
                let Some(code) = Self::clean_code(&raw_code) else {
                    dropped += 1;
                    return None;
                };
                let price = json_num(&row["最新价"]).unwrap_or(0.0);
                if price <= 0.0 {
                    dropped += 1;
                    return None;
                }
                Some(Quote {
                    code,
                    name: json_str(&row["名称"]),
                    price,
                    change: json_num(&row["涨跌额"]).unwrap_or(0.0),
                    change_percent: json_num(&row["涨跌幅"]).unwrap_or(0.0),
                    open: json_num(&row["今开"]),
                    high: json_num(&row["最高"]),
                    low: json_num(&row["最低"]),
                    pre_close: json_num(&row["昨收"]),
                    volume: json_num(&row["成交量"]).unwrap_or(0.0),
                    amount: json_num(&row["成交额"]).unwrap_or(0.0),
                    // Sina does not report turnover.
                    turnover_rate: None,
                    update_time: stamp.clone(),
                })
            })
            .collect();

        if dropped > 0 {
            warn!(dropped, kept = quotes.len(), "sina spot rows dropped");
        }
        quotes
    }
}

impl Default for SinaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for SinaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sina
    }

    async fn snapshot_all_stocks(&self) -> ServiceResult<Vec<Quote>> {
        let rows = self.fetch_rows("/api/public/stock_zh_a_spot").await?;
        let quotes = Self::parse_spot_rows(rows);
        if quotes.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "sina".into(),
            });
        }
        debug!(count = quotes.len(), "sina stock snapshot parsed");
        Ok(quotes)
    }

    async fn snapshot_all_etfs(&self) -> ServiceResult<Vec<Quote>> {
        let rows = self.fetch_rows("/api/public/fund_etf_category_sina").await?;
        let quotes = Self::parse_spot_rows(rows);
        if quotes.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "sina".into(),
            });
        }
        Ok(quotes)
    }

    async fn daily_bars(&self, _ts_code: &str, _from: &str, _to: &str) -> ServiceResult<Vec<Bar>> {
        Err(ServiceError::ProviderEmpty {
            provider: "sina (no daily history api)".into(),
        })
    }

    async fn symbol_master(&self) -> ServiceResult<Vec<SymbolInfo>> {
        Err(ServiceError::ProviderEmpty {
            provider: "sina (no symbol master api)".into(),
        })
    }
}
