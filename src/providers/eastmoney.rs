// =============================================================================
// Eastmoney adapter — spot tables via an AKShare-compatible gateway
// =============================================================================
//
// The upstream is an AKTools-style HTTP deployment of AKShare: each
// endpoint returns a JSON array of row objects keyed by the original
// Chinese column headers (代码, 名称, 最新价, ...). Those headers are
// mapped to the normalised `Quote`/`Bar` shapes here and nowhere else.
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

pub struct EastmoneyAdapter {
    base_url: String,
    http: reqwest::Client,
}

impl EastmoneyAdapter {
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

    async fn fetch_rows(&self, path: &str, query: &[(&str, &str)]) -> ServiceResult<Vec<Value>> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderHttp {
                provider: "eastmoney".into(),
                message: format!("{path}: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ServiceError::ProviderHttp {
                provider: "eastmoney".into(),
                message: format!("{path}: http {status}"),
            });
        }

        let payload: Value = resp.json().await.map_err(|e| ServiceError::ProviderParse {
            provider: "eastmoney".into(),
            message: format!("{path}: {e}"),
        })?;

        payload
            .as_array()
            .cloned()
            .ok_or_else(|| ServiceError::ProviderParse {
                provider: "eastmoney".into(),
                message: format!("{path}: expected a row array"),
            })
    }

    fn parse_spot_rows(rows: Vec<Value>) -> Vec<Quote> {
        let stamp = snapshot_stamp();
        let mut dropped = 0usize;

        let quotes: Vec<Quote> = rows
            .iter()
            .filter_map(|row| {
                let code = json_str(&row["代码"])?;
                if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
                    dropped += 1;
                    return None;
                }
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
                    turnover_rate: json_num(&row["换手率"]),
                    update_time: stamp.clone(),
                })
            })
            .collect();

        if dropped > 0 {
            warn!(dropped, kept = quotes.len(), "eastmoney spot rows dropped");
        }
        quotes
    }
}

impl Default for EastmoneyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for EastmoneyAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Eastmoney
    }

    async fn snapshot_all_stocks(&self) -> ServiceResult<Vec<Quote>> {
        let rows = self
            .fetch_rows("/api/public/stock_zh_a_spot_em", &[])
            .await?;
        let quotes = Self::parse_spot_rows(rows);
        if quotes.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "eastmoney".into(),
            });
        }
        debug!(count = quotes.len(), "eastmoney stock snapshot parsed");
        Ok(quotes)
    }

    async fn snapshot_all_etfs(&self) -> ServiceResult<Vec<Quote>> {
        let rows = self.fetch_rows("/api/public/fund_etf_spot_em", &[]).await?;
        let quotes = Self::parse_spot_rows(rows);
        if quotes.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "eastmoney".into(),
            });
        }
        debug!(count = quotes.len(), "eastmoney etf snapshot parsed");
        Ok(quotes)
    }

    async fn daily_bars(&self, ts_code: &str, from: &str, to: &str) -> ServiceResult<Vec<Bar>> {
        let symbol = ts_code.split('.').next().unwrap_or(ts_code);
        let rows = self
            .fetch_rows(
                "/api/public/stock_zh_a_hist",
                &[
                    ("symbol", symbol),
                    ("period", "daily"),
                    ("start_date", from),
                    ("end_date", to),
                    ("adjust", ""),
                ],
            )
            .await?;

        if rows.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "eastmoney".into(),
            });
        }

        let mut dropped = 0usize;
        let mut bars: Vec<Bar> = rows
            .iter()
            .filter_map(|row| {
                let bar = Bar {
                    trade_date: json_str(&row["日期"])?,
                    open: json_num(&row["开盘"])?,
                    high: json_num(&row["最高"])?,
                    low: json_num(&row["最低"])?,
                    close: json_num(&row["收盘"])?,
                    vol: json_num(&row["成交量"]).unwrap_or(0.0),
                    amount: json_num(&row["成交额"]).unwrap_or(0.0),
                    pct_chg: json_num(&row["涨跌幅"]).unwrap_or(0.0),
                    change: json_num(&row["涨跌额"]).unwrap_or(0.0),
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
            warn!(ts_code, dropped, "eastmoney history rows dropped");
        }
        bars.sort_by(|a, b| a.trade_date.cmp(&b.trade_date));
        Ok(bars)
    }

    /// Derive a minimal master list from the spot table (code + name);
    /// used as the fallback when Tushare's `stock_basic` is unavailable.
    async fn symbol_master(&self) -> ServiceResult<Vec<SymbolInfo>> {
        let quotes = self.snapshot_all_stocks().await?;
        Ok(quotes
            .into_iter()
            .map(|q| SymbolInfo {
                ts_code: String::new(),
                symbol: q.code,
                name: q.name.unwrap_or_default(),
                market: String::new(),
                industry: String::new(),
                area: String::new(),
                list_date: String::new(),
            })
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spot_fixture() -> Vec<Value> {
        vec![
            json!({
                "代码": "600519",
                "名称": "贵州茅台",
                "最新价": 1850.5,
                "涨跌额": 25.3,
                "涨跌幅": 2.5,
                "成交量": 12345678.0,
                "成交额": 2.28e10,
                "最高": 1860.0,
                "最低": 1820.0,
                "今开": 1830.0,
                "昨收": 1825.2,
                "换手率": 0.98,
            }),
            // Numeric strings must still parse.
            json!({
                "代码": "000001",
                "名称": "平安银行",
                "最新价": "11.25",
                "涨跌额": "0.15",
                "涨跌幅": "1.35",
                "成交量": "98765432",
                "成交额": "1.1e9",
                "最高": "11.30",
                "最低": "11.05",
                "今开": "11.10",
                "昨收": "11.10",
                "换手率": "0.51",
            }),
            // Suspended stock: "-" price placeholder -> dropped.
            json!({
                "代码": "300001",
                "名称": "特锐德",
                "最新价": "-",
                "涨跌额": "-",
                "涨跌幅": "-",
                "成交量": 0,
                "成交额": 0,
            }),
            // Malformed code -> dropped.
            json!({
                "代码": "60051",
                "名称": "bad",
                "最新价": 10.0,
            }),
        ]
    }

    #[test]
    fn spot_rows_normalise_to_english_schema() {
        let quotes = EastmoneyAdapter::parse_spot_rows(spot_fixture());
        assert_eq!(quotes.len(), 2);

        let mao = &quotes[0];
        assert_eq!(mao.code, "600519");
        assert_eq!(mao.name.as_deref(), Some("贵州茅台"));
        assert_eq!(mao.price, 1850.5);
        assert_eq!(mao.change_percent, 2.5);
        assert_eq!(mao.open, Some(1830.0));
        assert_eq!(mao.turnover_rate, Some(0.98));

        let pab = &quotes[1];
        assert_eq!(pab.price, 11.25);
        assert_eq!(pab.volume, 98_765_432.0);
    }

    #[test]
    fn serialised_quote_has_no_chinese_keys() {
        let quotes = EastmoneyAdapter::parse_spot_rows(spot_fixture());
        let json = serde_json::to_string(&quotes[0]).unwrap();
        assert!(json.contains("\"price\""));
        assert!(json.contains("\"change_percent\""));
        assert!(!json.contains("最新价"));
        assert!(!json.contains("代码"));
    }

    #[test]
    fn empty_table_yields_no_quotes() {
        assert!(EastmoneyAdapter::parse_spot_rows(Vec::new()).is_empty());
    }
}
