// =============================================================================
// Rate-limited fetch fabric — spacing, retry, fail-over, stats
// =============================================================================
//
// Every upstream call runs through the fabric:
//
//   1. pre-wait so that two calls to the same provider are separated by at
//      least `min_request_interval` (plus a uniform jitter up to 500 ms to
//      avoid a regular request rhythm),
//   2. the adapter call itself,
//   3. on a recoverable provider error, retry with a randomised 1.5–3.0 s
//      back-off, then fall through to the next provider in the order.
//
// Per-provider success/fail counters feed both the `auto` selection (the
// provider with the higher recent success count goes first) and the
// status endpoint.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::providers::ProviderAdapter;
use crate::types::{ProviderChoice, ProviderKind};

#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Minimum wall-clock spacing between calls to one provider.
    pub min_request_interval: Duration,
    /// Upper bound of the uniform jitter layered on the pre-wait.
    pub jitter_max: Duration,
    /// Retries per provider after the first attempt.
    pub retry_times: u32,
    /// Back-off sleep range between retries, in seconds.
    pub backoff_secs: (f64, f64),
    /// Whether a failed primary falls through to the other providers.
    pub auto_switch: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            min_request_interval: Duration::from_secs(1),
            jitter_max: Duration::from_millis(500),
            retry_times: 2,
            backoff_secs: (1.5, 3.0),
            auto_switch: true,
        }
    }
}

/// Per-provider call counters, serialisable for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub success: u64,
    pub fail: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
}

/// Snapshot of the fabric state for observers.
#[derive(Debug, Clone, Serialize)]
pub struct FabricSnapshot {
    pub providers: HashMap<String, ProviderStats>,
    pub last_provider: Option<String>,
}

pub struct FetchFabric {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    config: FabricConfig,
    stats: Mutex<HashMap<ProviderKind, ProviderStats>>,
    last_request: Mutex<HashMap<ProviderKind, Instant>>,
    last_provider: Mutex<Option<ProviderKind>>,
}

impl FetchFabric {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, config: FabricConfig) -> Self {
        Self {
            adapters,
            config,
            stats: Mutex::new(HashMap::new()),
            last_request: Mutex::new(HashMap::new()),
            last_provider: Mutex::new(None),
        }
    }

    fn adapter(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind).cloned()
    }

    fn success_count(&self, kind: ProviderKind) -> u64 {
        self.stats.lock().get(&kind).map_or(0, |s| s.success)
    }

    /// The provider order for one call. `auto` ranks the snapshot
    /// providers by recent success count; an explicit primary is followed
    /// by the others only when auto-switch is on.
    pub fn provider_order(&self, choice: ProviderChoice) -> Vec<ProviderKind> {
        let snapshot_pair = || {
            if self.success_count(ProviderKind::Sina) > self.success_count(ProviderKind::Eastmoney)
            {
                [ProviderKind::Sina, ProviderKind::Eastmoney]
            } else {
                [ProviderKind::Eastmoney, ProviderKind::Sina]
            }
        };

        let mut order: Vec<ProviderKind> = match choice {
            ProviderChoice::Auto => snapshot_pair().to_vec(),
            ProviderChoice::Eastmoney => {
                let mut v = vec![ProviderKind::Eastmoney];
                if self.config.auto_switch {
                    v.push(ProviderKind::Sina);
                    v.push(ProviderKind::Tushare);
                }
                v
            }
            ProviderChoice::Sina => {
                let mut v = vec![ProviderKind::Sina];
                if self.config.auto_switch {
                    v.push(ProviderKind::Eastmoney);
                    v.push(ProviderKind::Tushare);
                }
                v
            }
            ProviderChoice::Tushare => {
                let mut v = vec![ProviderKind::Tushare];
                if self.config.auto_switch {
                    v.extend(snapshot_pair());
                }
                v
            }
        };

        order.retain(|kind| self.adapters.iter().any(|a| a.kind() == *kind));
        order
    }

    /// Run `op` against the providers in order, honouring spacing, retries
    /// and fail-over. Returns the value together with the provider that
    /// produced it. `op` receives the adapter by `Arc` so retries can
    /// re-invoke it.
    pub async fn call<T: Send>(
        &self,
        choice: ProviderChoice,
        op: impl Fn(Arc<dyn ProviderAdapter>) -> BoxFuture<'static, ServiceResult<T>>,
    ) -> ServiceResult<(T, ProviderKind)> {
        let order = self.provider_order(choice);
        if order.is_empty() {
            return Err(ServiceError::ConfigInvalid(format!(
                "no adapter registered for provider choice {choice}"
            )));
        }

        let mut attempts: u32 = 0;
        let mut last_error: Option<ServiceError> = None;

        for kind in order {
            let Some(adapter) = self.adapter(kind) else {
                continue;
            };

            for attempt in 0..=self.config.retry_times {
                self.pace(kind).await;
                attempts += 1;

                match op(adapter.clone()).await {
                    Ok(value) => {
                        self.record_success(kind);
                        return Ok((value, kind));
                    }
                    Err(e) if e.is_provider_recoverable() => {
                        self.record_fail(kind);
                        warn!(
                            provider = %kind,
                            attempt = attempt + 1,
                            error = %e,
                            "provider call failed"
                        );
                        last_error = Some(e);

                        if attempt < self.config.retry_times {
                            let (lo, hi) = self.config.backoff_secs;
                            let secs = rand::thread_rng().gen_range(lo..hi);
                            debug!(provider = %kind, backoff_secs = secs, "retrying");
                            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                        }
                    }
                    // Non-provider errors (redis, cancellation, ...) are
                    // not the upstream's fault; bubble immediately.
                    Err(e) => return Err(e),
                }
            }
        }

        Err(ServiceError::RateLimitExhausted {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no provider available".into()),
        })
    }

    /// Enforce the minimum inter-call spacing for `kind`, with jitter.
    async fn pace(&self, kind: ProviderKind) {
        let wait = {
            let mut last = self.last_request.lock();
            let now = Instant::now();
            let wait = match last.get(&kind) {
                Some(prev) => {
                    let elapsed = now.duration_since(*prev);
                    self.config.min_request_interval.saturating_sub(elapsed)
                }
                None => Duration::ZERO,
            };
            // Reserve the slot now: the spacing is measured between call
            // starts, so concurrent callers queue behind this one.
            last.insert(kind, now + wait);
            wait
        };

        if !wait.is_zero() {
            let jitter_ns = if self.config.jitter_max.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..self.config.jitter_max.as_nanos() as u64)
            };
            tokio::time::sleep(wait + Duration::from_nanos(jitter_ns)).await;
        }
    }

    fn record_success(&self, kind: ProviderKind) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(kind).or_default();
        entry.success += 1;
        entry.last_success_at =
            Some(chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        *self.last_provider.lock() = Some(kind);
    }

    fn record_fail(&self, kind: ProviderKind) {
        self.stats.lock().entry(kind).or_default().fail += 1;
    }

    /// Counters for one provider (zeroed default when it was never called).
    pub fn stats_for(&self, kind: ProviderKind) -> ProviderStats {
        self.stats.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> FabricSnapshot {
        let providers = self
            .stats
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        FabricSnapshot {
            providers,
            last_provider: self.last_provider.lock().map(|k| k.to_string()),
        }
    }
}
