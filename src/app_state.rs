// =============================================================================
// Central application state
// =============================================================================
//
// The explicitly constructed component graph: every subsystem is built
// once at startup and wired through this struct, which all tasks share
// via `Arc<AppState>`. Lifetime equals the process; `Start`/`Stop` hooks
// live in main and the scheduler.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::Settings;
use crate::news::NewsService;
use crate::providers::eastmoney::EastmoneyAdapter;
use crate::providers::sina::SinaAdapter;
use crate::providers::tushare::TushareAdapter;
use crate::providers::{FabricConfig, FetchFabric, ProviderAdapter};
use crate::realtime::RealtimeService;
use crate::scheduler::Scheduler;
use crate::store::kv::KvStore;
use crate::store::{KlineStore, SymbolRegistry};
use crate::strategy::StrategyEngine;
use crate::ws::{PricePublisher, WsHub};

pub struct AppState {
    pub settings: Settings,
    pub kv: Arc<dyn KvStore>,

    // ── Storage ─────────────────────────────────────────────────────────
    pub kline: Arc<KlineStore>,
    pub registry: Arc<SymbolRegistry>,

    // ── Upstream ────────────────────────────────────────────────────────
    pub fabric: Arc<FetchFabric>,
    pub tushare: Arc<TushareAdapter>,

    // ── Services ────────────────────────────────────────────────────────
    pub engine: Arc<StrategyEngine>,
    pub realtime: Arc<RealtimeService>,
    pub news: Arc<NewsService>,

    // ── Push layer ──────────────────────────────────────────────────────
    pub hub: Arc<WsHub>,
    pub publisher: Arc<PricePublisher>,

    // ── Lifecycle ───────────────────────────────────────────────────────
    scheduler: RwLock<Option<Arc<Scheduler>>>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire the full component graph over the given store.
    pub fn new(settings: Settings, kv: Arc<dyn KvStore>) -> Arc<Self> {
        let kline = Arc::new(KlineStore::new(kv.clone()));
        let registry = Arc::new(SymbolRegistry::new(kv.clone()));

        let tushare = Arc::new(TushareAdapter::new(settings.tushare_token.clone()));
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            tushare.clone(),
            Arc::new(EastmoneyAdapter::new()),
            Arc::new(SinaAdapter::new()),
        ];
        let fabric = Arc::new(FetchFabric::new(
            adapters,
            FabricConfig {
                auto_switch: settings.realtime_auto_switch,
                ..FabricConfig::default()
            },
        ));

        let engine = Arc::new(StrategyEngine::new(kv.clone(), kline.clone()));
        let realtime = Arc::new(RealtimeService::new(
            kv.clone(),
            fabric.clone(),
            kline.clone(),
            registry.clone(),
            settings.realtime_provider,
            settings.max_threads,
        ));
        let news = Arc::new(NewsService::new(kv.clone()));

        let hub = Arc::new(WsHub::new());
        let publisher = Arc::new(PricePublisher::new(
            hub.clone(),
            engine.clone(),
            kline.clone(),
        ));

        Arc::new(Self {
            settings,
            kv,
            kline,
            registry,
            fabric,
            tushare,
            engine,
            realtime,
            news,
            hub,
            publisher,
            scheduler: RwLock::new(None),
            start_time: Instant::now(),
        })
    }

    /// Attach the scheduler once it exists (it needs the state to run
    /// jobs, so it is constructed second).
    pub fn attach_scheduler(&self, scheduler: Arc<Scheduler>) {
        *self.scheduler.write() = Some(scheduler);
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.read().clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
