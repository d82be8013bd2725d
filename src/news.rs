// =============================================================================
// News cache — headline feed for the front-end ticker
// =============================================================================
//
// Pulls the latest financial headlines from the AKShare-compatible
// gateway and caches a bounded list under `news:latest`. The LLM analysis
// layer is an external collaborator; this service only maintains the raw
// headline cache it consumes.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::providers::json_str;
use crate::store::keys::{self, ttl};
use crate::store::kv::{self, KvStore};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound on cached headlines.
const MAX_HEADLINES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub published_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsCache {
    pub items: Vec<NewsItem>,
    pub count: usize,
    pub updated_at: String,
}

pub struct NewsService {
    kv: Arc<dyn KvStore>,
    base_url: String,
    http: reqwest::Client,
}

impl NewsService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_base_url(kv, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(kv: Arc<dyn KvStore>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self {
            kv,
            base_url: base_url.into(),
            http,
        }
    }

    /// Fetch the feed and refresh `news:latest`; returns the cached count.
    pub async fn refresh(&self) -> ServiceResult<usize> {
        let url = format!("{}/api/public/stock_info_global_em", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderHttp {
                provider: "eastmoney".into(),
                message: format!("news feed: {e}"),
            })?;

        if !resp.status().is_success() {
            return Err(ServiceError::ProviderHttp {
                provider: "eastmoney".into(),
                message: format!("news feed: http {}", resp.status()),
            });
        }

        let rows: Vec<Value> = resp
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::ProviderParse {
                provider: "eastmoney".into(),
                message: format!("news feed: {e}"),
            })?
            .as_array()
            .cloned()
            .ok_or_else(|| ServiceError::ProviderParse {
                provider: "eastmoney".into(),
                message: "news feed: expected a row array".into(),
            })?;

        let items = Self::parse_rows(rows);
        if items.is_empty() {
            return Err(ServiceError::ProviderEmpty {
                provider: "eastmoney".into(),
            });
        }

        let cache = NewsCache {
            count: items.len(),
            items,
            updated_at: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        kv::set_json(self.kv.as_ref(), keys::NEWS_LATEST, &cache, Some(ttl::NEWS)).await?;
        info!(count = cache.count, "news cache refreshed");
        Ok(cache.count)
    }

    fn parse_rows(rows: Vec<Value>) -> Vec<NewsItem> {
        let mut dropped = 0usize;
        let items: Vec<NewsItem> = rows
            .iter()
            .take(MAX_HEADLINES)
            .filter_map(|row| {
                let title = json_str(&row["标题"])?;
                Some(NewsItem {
                    title,
                    summary: json_str(&row["摘要"]),
                    source: json_str(&row["来源"]).unwrap_or_else(|| "东方财富".into()),
                    url: json_str(&row["链接"]),
                    published_at: json_str(&row["发布时间"]).unwrap_or_default(),
                })
            })
            .collect();
        dropped += rows.len().min(MAX_HEADLINES) - items.len();
        if dropped > 0 {
            warn!(dropped, "news rows without titles dropped");
        }
        items
    }

    pub async fn latest(&self) -> ServiceResult<Option<NewsCache>> {
        kv::get_json(self.kv.as_ref(), keys::NEWS_LATEST).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;
    use serde_json::json;

    #[test]
    fn rows_parse_and_drop_untitled() {
        let rows = vec![
            json!({
                "标题": "两市震荡走高",
                "摘要": "沪指收涨",
                "发布时间": "2025-06-02 15:05:00",
                "链接": "https://example.com/a",
                "来源": "东方财富",
            }),
            json!({ "摘要": "no title", "发布时间": "2025-06-02" }),
        ];
        let items = NewsService::parse_rows(rows);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "两市震荡走高");
        assert_eq!(items[0].published_at, "2025-06-02 15:05:00");
    }

    #[test]
    fn headline_cap_enforced() {
        let rows: Vec<Value> = (0..80)
            .map(|i| json!({ "标题": format!("标题{i}"), "发布时间": "2025-06-02" }))
            .collect();
        assert_eq!(NewsService::parse_rows(rows).len(), MAX_HEADLINES);
    }

    #[tokio::test]
    async fn latest_roundtrip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let service = NewsService::new(kv.clone());
        assert!(service.latest().await.unwrap().is_none());

        let cache = NewsCache {
            items: vec![NewsItem {
                title: "测试".into(),
                summary: None,
                source: "东方财富".into(),
                url: None,
                published_at: "2025-06-02".into(),
            }],
            count: 1,
            updated_at: "2025-06-02T10:00:00".into(),
        };
        kv::set_json(kv.as_ref(), keys::NEWS_LATEST, &cache, Some(ttl::NEWS))
            .await
            .unwrap();
        let read = service.latest().await.unwrap().unwrap();
        assert_eq!(read.count, 1);
        assert_eq!(read.items[0].title, "测试");
    }
}
