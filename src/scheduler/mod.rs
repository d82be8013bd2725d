// =============================================================================
// Scheduler — wall-clock job orchestration
// =============================================================================
//
// A 30-second tick loop matches local wall-clock time against each job's
// trigger and fires it at most once per slot. Every job is a singleton:
// while a run is in flight, further scheduled triggers are dropped with a
// skip-log entry (`already_running`). Manual triggers bypass that check
// only for idempotent jobs and are rejected otherwise.
//
// The startup mode (`STOCK_INIT_MODE`) selects the work the lifecycle may
// do before the first scheduled tick; in `skip` mode startup performs no
// provider calls at all.
//
// Each job runs in its own spawned task: a panic is caught at the job
// boundary, logged as `internal`, and never takes the scheduler down.
// Execution logs (success / fail / skip, elapsed, rows) land in Redis
// with a 7-day TTL.
// =============================================================================

pub mod jobs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::calendar;
use crate::error::{ServiceError, ServiceResult};
use crate::store::keys::{self, ttl};
use crate::store::kv::{self, KvStore};
use crate::types::InitMode;

/// Tick cadence of the trigger loop.
const TICK_INTERVAL: Duration = Duration::from_secs(30);
/// Maximum execution-log entries returned by the status endpoint.
const STATUS_LOG_LIMIT: usize = 20;
/// Local minute-of-day for the close-run of the signal job (15:30).
const SIGNAL_CLOSE_RUN: (u32, u32) = (15, 30);
/// Local time for the incremental bar update (after the close).
const SMART_UPDATE_AT: (u32, u32) = (15, 45);
/// Local time for the weekday full refresh.
const FULL_REFRESH_AT: (u32, u32) = (17, 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RefreshSymbolList,
    FullBarRefresh,
    SmartBarUpdate,
    ComputeSignals,
    RealtimeSnapshot,
    NewsCrawl,
    CleanupCharts,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::RefreshSymbolList,
        JobKind::FullBarRefresh,
        JobKind::SmartBarUpdate,
        JobKind::ComputeSignals,
        JobKind::RealtimeSnapshot,
        JobKind::NewsCrawl,
        JobKind::CleanupCharts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RefreshSymbolList => "refresh_symbol_list",
            Self::FullBarRefresh => "full_bar_refresh",
            Self::SmartBarUpdate => "smart_bar_update",
            Self::ComputeSignals => "compute_signals",
            Self::RealtimeSnapshot => "realtime_snapshot",
            Self::NewsCrawl => "news_crawl",
            Self::CleanupCharts => "cleanup_charts",
        }
    }

    /// Whether a manual trigger may bypass the singleton check. The bulk
    /// history jobs are not safe to overlap with themselves.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::FullBarRefresh | Self::SmartBarUpdate)
    }

    /// Accepts both the job names above and the legacy task aliases of
    /// the manual-trigger API.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refresh_symbol_list" | "check_codes" | "refresh_stocks" => {
                Some(Self::RefreshSymbolList)
            }
            "full_bar_refresh" | "clear_refetch" => Some(Self::FullBarRefresh),
            "smart_bar_update" | "smart_update" => Some(Self::SmartBarUpdate),
            "compute_signals" | "calc_signals" => Some(Self::ComputeSignals),
            "realtime_snapshot" | "update_realtime" => Some(Self::RealtimeSnapshot),
            "news_crawl" | "news" => Some(Self::NewsCrawl),
            "cleanup_charts" => Some(Self::CleanupCharts),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Startup,
    Manual,
}

/// Scope passed to data jobs; `etf_only` restricts the universe.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobScope {
    pub etf_only: bool,
}

/// One execution-log record (7-day TTL in Redis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecLogEntry {
    pub job: String,
    /// `success`, `fail`, or `skip`.
    pub status: String,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_ms: u64,
    pub rows: u64,
    pub at: String,
}

/// RAII guard marking a job as running; dropping it releases the slot.
pub struct JobGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    state: Arc<AppState>,
    mode: InitMode,
    running: HashMap<&'static str, Arc<AtomicUsize>>,
    fired_slots: parking_lot::Mutex<HashMap<&'static str, String>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, mode: InitMode) -> Arc<Self> {
        let running = JobKind::ALL
            .iter()
            .map(|kind| (kind.name(), Arc::new(AtomicUsize::new(0))))
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            state,
            mode,
            running,
            fired_slots: parking_lot::Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn mode(&self) -> InitMode {
        self.mode
    }

    /// Launch the startup sequence for the configured mode and the tick
    /// loop.
    pub fn start(self: Arc<Self>) {
        info!(mode = %self.mode, "scheduler starting");
        self.clone().spawn_startup(self.mode);

        let scheduler = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            let mut shutdown = scheduler.shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.clone().tick(Local::now()),
                    _ = shutdown.changed() => {
                        info!("scheduler tick loop stopping");
                        break;
                    }
                }
            }
        });
    }

    /// Signal every job loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the pre-tick work for `mode`. Also used by the manual init
    /// endpoint to re-run a mode on demand.
    pub fn spawn_startup(self: Arc<Self>, mode: InitMode) {
        tokio::spawn(async move {
            match mode {
                InitMode::Skip => {
                    info!("startup mode skip: no pre-tick work");
                }
                InitMode::TasksOnly => {
                    self.startup_refresh_if_incomplete().await;
                    let scope = JobScope::default();
                    self.clone().trigger(JobKind::NewsCrawl, TriggerSource::Startup, scope);
                    self.clone()
                        .trigger(JobKind::ComputeSignals, TriggerSource::Startup, scope);
                    self.clone()
                        .trigger(JobKind::RealtimeSnapshot, TriggerSource::Startup, scope);
                }
                InitMode::FullInit => {
                    let scope = JobScope::default();
                    self.run_logged(JobKind::RefreshSymbolList, TriggerSource::Startup, scope)
                        .await;
                    self.run_logged(JobKind::FullBarRefresh, TriggerSource::Startup, scope)
                        .await;
                    self.clone()
                        .trigger(JobKind::ComputeSignals, TriggerSource::Startup, scope);
                    self.clone().trigger(JobKind::NewsCrawl, TriggerSource::Startup, scope);
                }
                InitMode::EtfOnly => {
                    let scope = JobScope { etf_only: true };
                    self.run_logged(JobKind::RefreshSymbolList, TriggerSource::Startup, scope)
                        .await;
                    self.run_logged(JobKind::FullBarRefresh, TriggerSource::Startup, scope)
                        .await;
                    self.clone()
                        .trigger(JobKind::ComputeSignals, TriggerSource::Startup, scope);
                }
            }
        });
    }

    async fn startup_refresh_if_incomplete(&self) {
        match self.state.registry.readiness().await {
            Ok(readiness) if readiness.ready => {}
            Ok(readiness) => {
                info!(
                    stocks = readiness.stock_count,
                    etfs = readiness.etf_count,
                    "registry incomplete, refreshing symbol list at startup"
                );
                self.run_logged(
                    JobKind::RefreshSymbolList,
                    TriggerSource::Startup,
                    JobScope::default(),
                )
                .await;
            }
            Err(e) => warn!(error = %e, "registry readiness check failed at startup"),
        }
    }

    // -------------------------------------------------------------------------
    // Trigger evaluation
    // -------------------------------------------------------------------------

    /// Evaluate due jobs at `now` and fire each at most once per slot.
    pub fn tick(self: Arc<Self>, now: DateTime<Local>) {
        for kind in JobKind::ALL {
            let Some(slot) = due_slot(
                kind,
                now,
                self.state.settings.realtime_update_interval_min,
            ) else {
                continue;
            };

            {
                let mut fired = self.fired_slots.lock();
                if fired.get(kind.name()) == Some(&slot) {
                    continue;
                }
                fired.insert(kind.name(), slot);
            }

            let scope = JobScope {
                etf_only: self.mode == InitMode::EtfOnly,
            };
            self.clone().trigger(kind, TriggerSource::Schedule, scope);
        }
    }

    /// Fire a job asynchronously, honouring the singleton rule.
    pub fn trigger(self: Arc<Self>, kind: JobKind, source: TriggerSource, scope: JobScope) {
        tokio::spawn(async move {
            self.run_logged(kind, source, scope).await;
        });
    }

    /// Manual trigger entry point for the HTTP surface.
    pub fn manual_trigger(self: Arc<Self>, kind: JobKind, scope: JobScope) -> ServiceResult<()> {
        // Stock-wide bulk refreshes are inconsistent with the ETF-scoped
        // lifecycle; scoped variants go through the init endpoint instead.
        if self.mode == InitMode::EtfOnly
            && !scope.etf_only
            && matches!(kind, JobKind::FullBarRefresh | JobKind::SmartBarUpdate)
        {
            return Err(ServiceError::BadInput(format!(
                "task {} is not available in etf_only mode",
                kind.name()
            )));
        }

        if self.running_count(kind) > 0 && !kind.is_idempotent() {
            return Err(ServiceError::ConflictSingleton(kind.name().into()));
        }

        self.trigger(kind, TriggerSource::Manual, scope);
        Ok(())
    }

    fn running_count(&self, kind: JobKind) -> usize {
        self.running
            .get(kind.name())
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Claim the singleton slot. `None` means the trigger must be dropped
    /// (a skip entry is the caller's duty). Manual triggers of idempotent
    /// jobs claim the slot even when one is in flight.
    fn try_begin(&self, kind: JobKind, source: TriggerSource) -> Option<JobGuard> {
        let counter = self.running.get(kind.name())?.clone();
        let prev = counter.fetch_add(1, Ordering::SeqCst);
        if prev > 0 && !(source == TriggerSource::Manual && kind.is_idempotent()) {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(JobGuard { counter })
    }

    // -------------------------------------------------------------------------
    // Execution & logging
    // -------------------------------------------------------------------------

    async fn run_logged(&self, kind: JobKind, source: TriggerSource, scope: JobScope) {
        let Some(_guard) = self.try_begin(kind, source) else {
            warn!(job = kind.name(), "trigger dropped, job already running");
            self.write_log(ExecLogEntry {
                job: kind.name().into(),
                status: "skip".into(),
                trigger: trigger_name(source).into(),
                reason: Some("already_running".into()),
                elapsed_ms: 0,
                rows: 0,
                at: now_stamp(),
            })
            .await;
            return;
        };

        info!(job = kind.name(), trigger = trigger_name(source), "job starting");
        let started = std::time::Instant::now();
        let shutdown = self.shutdown_rx.clone();

        // The job body is isolated: a panic is recorded as `internal` and
        // does not propagate past this boundary.
        let result = std::panic::AssertUnwindSafe(jobs::run(
            self.state.clone(),
            kind,
            scope,
            shutdown,
        ))
        .catch_unwind()
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let entry = match result {
            Ok(Ok(rows)) => {
                info!(job = kind.name(), rows, elapsed_ms, "job finished");
                ExecLogEntry {
                    job: kind.name().into(),
                    status: "success".into(),
                    trigger: trigger_name(source).into(),
                    reason: None,
                    elapsed_ms,
                    rows,
                    at: now_stamp(),
                }
            }
            Ok(Err(e)) if e.kind() == "not_ready" => {
                warn!(job = kind.name(), reason = %e, "job skipped, gate not ready");
                ExecLogEntry {
                    job: kind.name().into(),
                    status: "skip".into(),
                    trigger: trigger_name(source).into(),
                    reason: Some(e.to_string()),
                    elapsed_ms,
                    rows: 0,
                    at: now_stamp(),
                }
            }
            Ok(Err(e)) => {
                error!(job = kind.name(), error = %e, elapsed_ms, "job failed");
                ExecLogEntry {
                    job: kind.name().into(),
                    status: "fail".into(),
                    trigger: trigger_name(source).into(),
                    reason: Some(format!("{}: {e}", e.kind())),
                    elapsed_ms,
                    rows: 0,
                    at: now_stamp(),
                }
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(job = kind.name(), detail, "job panicked");
                ExecLogEntry {
                    job: kind.name().into(),
                    status: "fail".into(),
                    trigger: trigger_name(source).into(),
                    reason: Some(format!("internal: {detail}")),
                    elapsed_ms,
                    rows: 0,
                    at: now_stamp(),
                }
            }
        };

        self.write_log(entry).await;
    }

    async fn write_log(&self, entry: ExecLogEntry) {
        let key = keys::exec_log(&entry.job, Local::now().timestamp_millis());
        if let Err(e) = kv::set_json(self.state.kv.as_ref(), &key, &entry, Some(ttl::EXEC_LOG)).await
        {
            // Log storage is best-effort; a Redis outage on this path must
            // not fail the job bookkeeping.
            warn!(error = %e, "failed to persist execution log entry");
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub async fn status(&self) -> serde_json::Value {
        let jobs: serde_json::Map<String, serde_json::Value> = JobKind::ALL
            .iter()
            .map(|kind| {
                (
                    kind.name().to_string(),
                    json!({
                        "running": self.running_count(*kind),
                        "idempotent": kind.is_idempotent(),
                        "last_slot": self.fired_slots.lock().get(kind.name()).cloned(),
                    }),
                )
            })
            .collect();

        let readiness = self.state.registry.readiness().await.ok();
        let now = Local::now();

        json!({
            "mode": self.mode.to_string(),
            "uptime_secs": self.state.uptime_secs(),
            "is_trading_day": calendar::is_trading_day(now),
            "is_trading_time": calendar::is_trading_time(now),
            "is_after_close": calendar::is_after_close(now),
            "jobs": jobs,
            "registry": readiness,
            "providers": self.state.fabric.snapshot(),
            "recent_logs": self.recent_logs().await,
        })
    }

    async fn recent_logs(&self) -> Vec<ExecLogEntry> {
        let mut keys_found = match self.state.kv.scan_prefix(keys::EXEC_LOG_PREFIX).await {
            Ok(keys) => keys,
            Err(_) => return Vec::new(),
        };
        // Key suffix is a millisecond timestamp; newest first.
        keys_found.sort_by(|a, b| {
            let stamp = |k: &str| {
                k.rsplit(':')
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0)
            };
            stamp(b).cmp(&stamp(a))
        });

        let mut entries = Vec::new();
        for key in keys_found.into_iter().take(STATUS_LOG_LIMIT) {
            if let Ok(Some(entry)) =
                kv::get_json::<ExecLogEntry>(self.state.kv.as_ref(), &key).await
            {
                entries.push(entry);
            }
        }
        entries
    }
}

fn trigger_name(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Schedule => "schedule",
        TriggerSource::Startup => "startup",
        TriggerSource::Manual => "manual",
    }
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// The slot identifier when `kind` is due at `now`; `None` otherwise.
/// Each slot fires at most once.
fn due_slot(kind: JobKind, now: DateTime<Local>, realtime_interval_min: u64) -> Option<String> {
    let date = now.format("%Y-%m-%d").to_string();
    let hm = (now.hour(), now.minute());

    match kind {
        JobKind::RefreshSymbolList => {
            (now.weekday() == Weekday::Mon && hm == (8, 0)).then(|| date)
        }
        JobKind::FullBarRefresh => {
            if calendar::is_force_update_day(now) {
                Some(date)
            } else {
                (calendar::is_trading_day(now) && hm == FULL_REFRESH_AT).then(|| date)
            }
        }
        JobKind::SmartBarUpdate => {
            (calendar::is_trading_day(now) && hm == SMART_UPDATE_AT).then(|| date)
        }
        JobKind::ComputeSignals => {
            if calendar::is_trading_day(now) && hm == SIGNAL_CLOSE_RUN {
                Some(format!("{date} close"))
            } else if calendar::is_trading_time(now) && now.minute() % 30 == 0 {
                Some(format!("{date} {:02}:{:02}", now.hour(), now.minute()))
            } else {
                None
            }
        }
        JobKind::RealtimeSnapshot => {
            let interval = realtime_interval_min.max(1) as u32;
            (calendar::is_trading_time(now) && now.minute() % interval == 0)
                .then(|| format!("{date} {:02}:{:02}", now.hour(), now.minute()))
        }
        JobKind::NewsCrawl => {
            (now.hour() % 2 == 0 && now.minute() == 0).then(|| format!("{date} {:02}", now.hour()))
        }
        JobKind::CleanupCharts => (hm == (0, 0)).then(|| date),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::kv::MemoryKv;
    use chrono::TimeZone;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn scheduler(mode: InitMode) -> Arc<Scheduler> {
        let settings = Settings::from_env();
        let state = AppState::new(settings, Arc::new(MemoryKv::new()));
        Scheduler::new(state, mode)
    }

    // ---- due_slot ---------------------------------------------------------

    #[test]
    fn symbol_refresh_fires_monday_morning() {
        // 2025-06-02 is a Monday.
        assert!(due_slot(JobKind::RefreshSymbolList, local(2025, 6, 2, 8, 0), 15).is_some());
        assert!(due_slot(JobKind::RefreshSymbolList, local(2025, 6, 3, 8, 0), 15).is_none());
        assert!(due_slot(JobKind::RefreshSymbolList, local(2025, 6, 2, 9, 0), 15).is_none());
    }

    #[test]
    fn full_refresh_weekday_evening_and_saturday_any_time() {
        assert!(due_slot(JobKind::FullBarRefresh, local(2025, 6, 2, 17, 30), 15).is_some());
        assert!(due_slot(JobKind::FullBarRefresh, local(2025, 6, 2, 12, 0), 15).is_none());
        // Saturday: eligible whenever the tick lands.
        assert!(due_slot(JobKind::FullBarRefresh, local(2025, 6, 7, 3, 14), 15).is_some());
        // Sunday: never.
        assert!(due_slot(JobKind::FullBarRefresh, local(2025, 6, 8, 17, 30), 15).is_none());
    }

    #[test]
    fn signals_every_half_hour_in_session_plus_close_run() {
        assert!(due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 10, 0), 15).is_some());
        assert!(due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 10, 30), 15).is_some());
        assert!(due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 10, 15), 15).is_none());
        // Lunch break is outside the session.
        assert!(due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 12, 0), 15).is_none());
        // Close run at 15:30 even though the session has ended.
        let close = due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 15, 30), 15).unwrap();
        assert!(close.ends_with("close"));
        // Weekend: nothing.
        assert!(due_slot(JobKind::ComputeSignals, local(2025, 6, 7, 10, 0), 15).is_none());
    }

    #[test]
    fn snapshot_respects_configured_interval() {
        assert!(due_slot(JobKind::RealtimeSnapshot, local(2025, 6, 2, 10, 15), 15).is_some());
        assert!(due_slot(JobKind::RealtimeSnapshot, local(2025, 6, 2, 10, 20), 15).is_none());
        assert!(due_slot(JobKind::RealtimeSnapshot, local(2025, 6, 2, 10, 20), 5).is_some());
        // Outside the session: never, whatever the interval.
        assert!(due_slot(JobKind::RealtimeSnapshot, local(2025, 6, 2, 16, 0), 15).is_none());
    }

    #[test]
    fn news_every_two_hours_and_cleanup_at_midnight() {
        assert!(due_slot(JobKind::NewsCrawl, local(2025, 6, 2, 8, 0), 15).is_some());
        assert!(due_slot(JobKind::NewsCrawl, local(2025, 6, 2, 9, 0), 15).is_none());
        assert!(due_slot(JobKind::CleanupCharts, local(2025, 6, 2, 0, 0), 15).is_some());
        assert!(due_slot(JobKind::CleanupCharts, local(2025, 6, 2, 0, 1), 15).is_none());
    }

    #[test]
    fn slots_are_distinct_per_fire() {
        let a = due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 10, 0), 15).unwrap();
        let b = due_slot(JobKind::ComputeSignals, local(2025, 6, 2, 10, 30), 15).unwrap();
        assert_ne!(a, b);
    }

    // ---- singleton guard --------------------------------------------------

    #[tokio::test]
    async fn scheduled_trigger_dropped_while_running() {
        let scheduler = scheduler(InitMode::Skip);

        let guard = scheduler
            .try_begin(JobKind::ComputeSignals, TriggerSource::Schedule)
            .expect("first trigger claims the slot");
        assert!(scheduler
            .try_begin(JobKind::ComputeSignals, TriggerSource::Schedule)
            .is_none());

        drop(guard);
        assert!(scheduler
            .try_begin(JobKind::ComputeSignals, TriggerSource::Schedule)
            .is_some());
    }

    #[tokio::test]
    async fn manual_trigger_rules() {
        let scheduler = scheduler(InitMode::Skip);

        // Non-idempotent job: manual trigger rejected while running.
        let _guard = scheduler
            .try_begin(JobKind::FullBarRefresh, TriggerSource::Schedule)
            .unwrap();
        let err = scheduler
            .clone()
            .manual_trigger(JobKind::FullBarRefresh, JobScope::default())
            .unwrap_err();
        assert_eq!(err.kind(), "conflict_singleton");

        // Idempotent job: manual bypasses the running check.
        let _first = scheduler
            .try_begin(JobKind::ComputeSignals, TriggerSource::Schedule)
            .unwrap();
        assert!(scheduler
            .try_begin(JobKind::ComputeSignals, TriggerSource::Manual)
            .is_some());
    }

    #[tokio::test]
    async fn etf_only_mode_rejects_stock_bulk_jobs() {
        let scheduler = scheduler(InitMode::EtfOnly);
        let err = scheduler
            .clone()
            .manual_trigger(JobKind::FullBarRefresh, JobScope::default())
            .unwrap_err();
        assert_eq!(err.kind(), "bad_input");

        // The ETF-scoped variant is fine.
        assert!(scheduler
            .manual_trigger(JobKind::FullBarRefresh, JobScope { etf_only: true })
            .is_ok());
    }

    #[tokio::test]
    async fn skip_log_entry_written_on_dropped_trigger() {
        let scheduler = scheduler(InitMode::Skip);

        // Hold the slot, then route a scheduled trigger through the full
        // logged path.
        let _guard = scheduler
            .try_begin(JobKind::CleanupCharts, TriggerSource::Schedule)
            .unwrap();
        scheduler
            .run_logged(
                JobKind::CleanupCharts,
                TriggerSource::Schedule,
                JobScope::default(),
            )
            .await;

        let logs = scheduler.recent_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "skip");
        assert_eq!(logs[0].reason.as_deref(), Some("already_running"));
        assert_eq!(logs[0].job, "cleanup_charts");
    }

    #[tokio::test]
    async fn job_kind_parse_accepts_legacy_aliases() {
        assert_eq!(JobKind::parse("calc_signals"), Some(JobKind::ComputeSignals));
        assert_eq!(JobKind::parse("clear_refetch"), Some(JobKind::FullBarRefresh));
        assert_eq!(
            JobKind::parse("update_realtime"),
            Some(JobKind::RealtimeSnapshot)
        );
        assert_eq!(JobKind::parse("bogus"), None);
    }

    #[tokio::test]
    async fn status_reports_mode_and_jobs() {
        let scheduler = scheduler(InitMode::TasksOnly);
        let status = scheduler.status().await;
        assert_eq!(status["mode"], "tasks_only");
        assert!(status["jobs"]["compute_signals"]["idempotent"].as_bool().unwrap());
        assert!(!status["jobs"]["full_bar_refresh"]["idempotent"].as_bool().unwrap());
    }
}
