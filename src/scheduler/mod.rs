//! Scheduled pull engine.
//!
//! One process-wide scheduler owns a pull task per provider. Every 60 seconds
//! the loop wakes, finds due tasks, and spawns their runs. A run acquires the
//! cluster-wide execution lock first, so a provider executes at most once per
//! instance (the `is_running` guard) and at most once cluster-wide (the lock).
//! The lock is released on every exit path.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::lock::PullLockManager;
use crate::providers::Provider;

/// Schedule shape of a pull task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Run at the top of each hour
    Hourly,
    /// Run every `interval_minutes`
    Interval,
    /// Only run when triggered
    Manual,
}

/// Per-provider execution interval configuration (hours).
fn execution_interval_hours(slug: &str) -> f64 {
    match slug {
        "theta_whoop" => 24.0,
        "theta_renpho" => 24.0,
        "theta_cgm" => 1.0,
        _ => 1.0,
    }
}

/// Per-provider lock duration configuration (hours). Defaults to the
/// execution interval minus a half-hour buffer, floored at 0.1.
fn lock_duration_hours(slug: &str, execution_interval: f64) -> f64 {
    match slug {
        "theta_whoop" => 23.5,
        "theta_renpho" => 23.5,
        _ => (execution_interval - 0.5).max(0.1),
    }
}

/// Static execution configuration of every known provider, for the
/// management console.
pub fn provider_execution_config() -> serde_json::Value {
    let slugs = ["theta_whoop", "theta_renpho", "theta_cgm", "default"];
    let intervals: HashMap<&str, f64> = slugs
        .iter()
        .map(|slug| (*slug, execution_interval_hours(slug)))
        .collect();
    let locks: HashMap<&str, f64> = slugs
        .iter()
        .map(|slug| (*slug, lock_duration_hours(slug, execution_interval_hours(slug))))
        .collect();
    serde_json::json!({
        "execution_intervals": intervals,
        "lock_durations": locks,
    })
}

#[derive(Debug, Clone, Default)]
struct TaskState {
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    is_running: bool,
    success_count: u64,
    error_count: u64,
    last_error: Option<String>,
    current_execution_id: Option<String>,
}

/// Scheduler-facing task status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub provider_slug: String,
    pub schedule_kind: ScheduleKind,
    pub interval_minutes: i64,
    pub execution_interval_hours: f64,
    pub lock_duration_hours: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub current_execution_id: Option<String>,
}

/// One provider's scheduled pull task.
pub struct PullTask {
    slug: String,
    schedule_kind: ScheduleKind,
    interval_minutes: i64,
    execution_interval: f64,
    lock_duration: f64,
    provider: Arc<dyn Provider>,
    lock: Arc<PullLockManager>,
    state: Mutex<TaskState>,
}

impl PullTask {
    pub fn new(provider: Arc<dyn Provider>, lock: Arc<PullLockManager>) -> Self {
        Self::with_schedule(provider, lock, ScheduleKind::Hourly, 30)
    }

    pub fn with_schedule(
        provider: Arc<dyn Provider>,
        lock: Arc<PullLockManager>,
        schedule_kind: ScheduleKind,
        interval_minutes: i64,
    ) -> Self {
        let slug = provider.info().slug;
        let execution_interval = execution_interval_hours(&slug);
        let lock_duration = lock_duration_hours(&slug, execution_interval);

        info!(
            slug,
            execution_interval_hours = execution_interval,
            lock_duration_hours = lock_duration,
            schedule = ?schedule_kind,
            "Initialized pull task"
        );

        Self {
            slug,
            schedule_kind,
            interval_minutes,
            execution_interval,
            lock_duration,
            provider,
            lock,
            state: Mutex::new(TaskState::default()),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    fn compute_next_run(&self, state: &TaskState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_kind {
            ScheduleKind::Manual => None,
            ScheduleKind::Hourly => {
                let top = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                Some(top + TimeDelta::hours(1))
            }
            ScheduleKind::Interval => {
                let interval = TimeDelta::minutes(self.interval_minutes);
                match state.last_run {
                    None => Some(now + interval),
                    Some(last) => {
                        if state.last_error.is_some() {
                            // Errored runs wait double before retrying.
                            Some(last + interval * 2)
                        } else {
                            Some(last + interval)
                        }
                    }
                }
            }
        }
    }

    /// Whether the task is due: schedule time reached, the real execution
    /// interval elapsed, and no run in flight on this instance.
    pub async fn should_run(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        if state.is_running || self.schedule_kind == ScheduleKind::Manual {
            return false;
        }

        let schedule_ready = state.next_run.map(|next| now >= next).unwrap_or(true);
        let execution_ready = match state.last_run {
            None => true,
            Some(last) => {
                let gap = TimeDelta::seconds((self.execution_interval * 3600.0) as i64);
                now >= last + gap
            }
        };

        schedule_ready && execution_ready
    }

    /// Run the task under the cluster execution lock. Returns whether the run
    /// executed and succeeded; a lock held elsewhere is a silent skip.
    pub async fn try_execute_with_lock(&self, force: bool) -> bool {
        let duration = Duration::from_secs_f64(self.lock_duration * 3600.0);
        let Some(execution_id) = self.lock.try_acquire(&self.slug, duration, force).await else {
            if force {
                error!(slug = self.slug, "Failed to acquire lock even in force mode");
            } else {
                info!(slug = self.slug, "Lock held by another instance, skipping run");
            }
            return false;
        };

        {
            let mut state = self.state.lock().await;
            state.current_execution_id = Some(execution_id.clone());
        }
        info!(slug = self.slug, execution = %execution_id, "Starting execution");

        let result = self.execute_internal().await;

        // Release on every exit path so a failed run cannot wedge the slot.
        self.lock.release(&self.slug, &execution_id).await;
        let mut state = self.state.lock().await;
        state.current_execution_id = None;

        result
    }

    async fn execute_internal(&self) -> bool {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            if state.is_running {
                warn!(slug = self.slug, "Task already running on this instance");
                return false;
            }
            state.is_running = true;
            state.last_run = Some(now);
        }

        let success = self.provider.pull_and_push().await;

        let mut state = self.state.lock().await;
        if success {
            state.success_count += 1;
            state.last_error = None;
            info!(slug = self.slug, "Task completed successfully");
        } else {
            state.error_count += 1;
            state.last_error = Some("Task execution returned failure".to_string());
            error!(slug = self.slug, "Task failed");
        }
        state.next_run = self.compute_next_run(&state, Utc::now());
        state.is_running = false;
        success
    }

    /// Manual trigger. `force` bypasses the execution-interval check and
    /// clears the incremental-sync timestamp so the next pull uses its default
    /// lookback window.
    pub async fn manual_trigger(&self, force: bool) -> bool {
        info!(slug = self.slug, force, "Manual trigger");

        if force {
            self.lock.clear_last_timestamp(&self.slug).await;
            return self.try_execute_with_lock(true).await;
        }

        {
            let state = self.state.lock().await;
            if let Some(last) = state.last_run {
                let gap = TimeDelta::seconds((self.execution_interval * 3600.0) as i64);
                if Utc::now() < last + gap {
                    info!(slug = self.slug, "Execution interval not reached, skipping manual trigger");
                    return false;
                }
            }
        }

        self.try_execute_with_lock(false).await
    }

    pub async fn status(&self) -> TaskStatus {
        let state = self.state.lock().await;
        TaskStatus {
            provider_slug: self.slug.clone(),
            schedule_kind: self.schedule_kind,
            interval_minutes: self.interval_minutes,
            execution_interval_hours: self.execution_interval,
            lock_duration_hours: self.lock_duration,
            last_run: state.last_run,
            next_run: state.next_run,
            is_running: state.is_running,
            success_count: state.success_count,
            error_count: state.error_count,
            last_error: state.last_error.clone(),
            current_execution_id: state.current_execution_id.clone(),
        }
    }

    /// Full status including lock state and cached run data.
    pub async fn full_status(&self) -> serde_json::Value {
        let base = self.status().await;
        let lock_status = self.lock.status(&self.slug).await;
        let last_timestamp = self.lock.get_last_timestamp(&self.slug).await;
        let stats = self.lock.get_stats(&self.slug).await;

        serde_json::json!({
            "task": base,
            "lock_status": lock_status,
            "last_execution_timestamp": last_timestamp,
            "task_stats": stats,
        })
    }
}

/// Process-wide background scheduler. Task registration happens during
/// startup composition; the map is read-only afterwards.
pub struct Scheduler {
    tasks: StdRwLock<HashMap<String, Arc<PullTask>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: StdRwLock::new(HashMap::new()),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn register_task(&self, task: PullTask) {
        let slug = task.slug().to_string();
        self.tasks
            .write()
            .expect("task map poisoned")
            .insert(slug.clone(), Arc::new(task));
        info!(slug, "Registered pull task");
    }

    pub fn get_task(&self, slug: &str) -> Option<Arc<PullTask>> {
        self.tasks.read().expect("task map poisoned").get(slug).cloned()
    }

    fn all_tasks(&self) -> Vec<Arc<PullTask>> {
        self.tasks
            .read()
            .expect("task map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Manually trigger one task.
    pub async fn trigger_task(&self, slug: &str, force: bool) -> anyhow::Result<bool> {
        match self.get_task(slug) {
            Some(task) => Ok(task.manual_trigger(force).await),
            None => anyhow::bail!("Task not found: {}", slug),
        }
    }

    pub async fn tasks_status(&self) -> serde_json::Value {
        let mut statuses = HashMap::new();
        for task in self.all_tasks() {
            statuses.insert(task.slug().to_string(), task.status().await);
        }
        serde_json::json!({
            "total_tasks": statuses.len(),
            "tasks": statuses,
        })
    }

    pub async fn task_status(&self, slug: &str) -> Option<serde_json::Value> {
        let task = self.get_task(slug)?;
        Some(task.full_status().await)
    }

    /// Start the scheduling loop as a background task.
    pub async fn start(self: &Arc<Self>) {
        let mut handle_slot = self.handle.lock().await;
        if handle_slot.is_some() {
            warn!("Scheduler already running");
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!("Scheduler main loop started");
            loop {
                let now = Utc::now();
                let mut due = Vec::new();
                for task in scheduler.all_tasks() {
                    if task.should_run(now).await {
                        due.push(task);
                    }
                }

                for task in due {
                    info!(slug = task.slug(), "Executing scheduled task");
                    tokio::spawn(async move {
                        task.try_execute_with_lock(false).await;
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = shutdown.changed() => {
                        info!("Scheduler loop cancelled");
                        break;
                    }
                }
            }
        });
        *handle_slot = Some(handle);
        info!("Scheduler started as background task");
    }

    /// Stop the loop and wait for it to drain. In-flight runs complete on
    /// their own and release their locks.
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task join failed");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryKv;
    use crate::pipeline::records::PulseData;
    use crate::providers::{LinkRequest, ProviderInfo, ProviderStatus};
    use crate::vault::AuthKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProvider {
        slug: String,
        runs: AtomicUsize,
        succeed: AtomicBool,
    }

    impl FakeProvider {
        fn new(slug: &str) -> Self {
            Self {
                slug: slug.to_string(),
                runs: AtomicUsize::new(0),
                succeed: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                slug: self.slug.clone(),
                name: "Fake".to_string(),
                description: String::new(),
                logo: None,
                supported: true,
                auth_kind: AuthKind::Password,
                status: ProviderStatus::Available,
                platform: Some("theta".to_string()),
                connect_info_fields: None,
            }
        }

        async fn link(&self, _request: &LinkRequest) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }

        async fn unlink(&self, _user_id: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }

        async fn format_data(&self, _raw: &serde_json::Value) -> anyhow::Result<PulseData> {
            Ok(PulseData::empty("r", "u", &self.slug))
        }

        async fn pull_and_push(&self) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.succeed.load(Ordering::SeqCst)
        }
    }

    fn lock_manager() -> Arc<PullLockManager> {
        Arc::new(PullLockManager::new(Some(Arc::new(MemoryKv::new()))))
    }

    #[tokio::test]
    async fn test_execute_updates_counters_and_next_run() {
        let provider = Arc::new(FakeProvider::new("theta_test"));
        let task = PullTask::new(provider.clone(), lock_manager());

        assert!(task.try_execute_with_lock(false).await);
        assert_eq!(provider.runs.load(Ordering::SeqCst), 1);

        let status = task.status().await;
        assert_eq!(status.success_count, 1);
        assert_eq!(status.error_count, 0);
        assert!(status.last_run.is_some());
        assert!(status.next_run.is_some());
        assert!(!status.is_running);
        assert!(status.current_execution_id.is_none());
    }

    #[tokio::test]
    async fn test_failed_run_counts_error_and_releases_lock() {
        let provider = Arc::new(FakeProvider::new("theta_test"));
        provider.succeed.store(false, Ordering::SeqCst);
        let lock = lock_manager();
        let task = PullTask::new(provider, Arc::clone(&lock));

        assert!(!task.try_execute_with_lock(false).await);

        let status = task.status().await;
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.is_some());
        // The lock must be gone after the failed run.
        assert!(!lock.status("theta_test").await.locked);
    }

    #[tokio::test]
    async fn test_lock_exclusion_between_instances() {
        let store: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let lock_a = Arc::new(PullLockManager::new(Some(store.clone() as Arc<dyn crate::lock::KvStore>)));
        let lock_b = Arc::new(PullLockManager::new(Some(store as Arc<dyn crate::lock::KvStore>)));

        let held = lock_a
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await;
        assert!(held.is_some());

        // The second instance sees the lock and its task skips the run.
        let provider = Arc::new(FakeProvider::new("theta_whoop"));
        let task = PullTask::new(provider.clone(), lock_b);
        assert!(!task.try_execute_with_lock(false).await);
        assert_eq!(provider.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_trigger_respects_execution_interval() {
        let provider = Arc::new(FakeProvider::new("theta_whoop"));
        let task = PullTask::new(provider.clone(), lock_manager());

        assert!(task.manual_trigger(false).await);
        // whoop's execution interval is 24h, so an immediate retrigger skips.
        assert!(!task.manual_trigger(false).await);
        assert_eq!(provider.runs.load(Ordering::SeqCst), 1);

        // Force bypasses the interval.
        assert!(task.manual_trigger(true).await);
        assert_eq!(provider.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_trigger_clears_last_timestamp() {
        let lock = lock_manager();
        lock.set_last_timestamp("theta_whoop", 1_700_000_000).await;

        let provider = Arc::new(FakeProvider::new("theta_whoop"));
        let task = PullTask::new(provider, Arc::clone(&lock));
        assert!(task.manual_trigger(true).await);

        assert!(lock.get_last_timestamp("theta_whoop").await.is_none());
    }

    #[tokio::test]
    async fn test_should_run_gating() {
        let provider = Arc::new(FakeProvider::new("theta_test"));
        let task = PullTask::new(provider, lock_manager());

        // Fresh task with no runs is due.
        assert!(task.should_run(Utc::now()).await);

        task.try_execute_with_lock(false).await;
        // Right after a run neither the schedule nor the interval is ready.
        assert!(!task.should_run(Utc::now()).await);
        // Two hours later both gates open (execution interval is 1h).
        assert!(task.should_run(Utc::now() + TimeDelta::hours(2)).await);
    }

    #[tokio::test]
    async fn test_manual_schedule_never_auto_runs(){
        let provider = Arc::new(FakeProvider::new("theta_test"));
        let task = PullTask::with_schedule(provider, lock_manager(), ScheduleKind::Manual, 30);
        assert!(!task.should_run(Utc::now() + TimeDelta::days(365)).await);
    }

    #[tokio::test]
    async fn test_interval_doubling_after_error() {
        let provider = Arc::new(FakeProvider::new("theta_test"));
        provider.succeed.store(false, Ordering::SeqCst);
        let task = PullTask::with_schedule(provider, lock_manager(), ScheduleKind::Interval, 30);

        task.try_execute_with_lock(false).await;
        let status = task.status().await;
        let delta = status.next_run.unwrap() - status.last_run.unwrap();
        // Errored interval runs wait double (60 minutes instead of 30).
        assert_eq!(delta.num_minutes(), 60);
    }

    #[tokio::test]
    async fn test_scheduler_trigger_unknown_task() {
        let scheduler = Arc::new(Scheduler::new());
        assert!(scheduler.trigger_task("missing", false).await.is_err());
    }

    #[tokio::test]
    async fn test_scheduler_start_stop() {
        let scheduler = Arc::new(Scheduler::new());
        let provider = Arc::new(FakeProvider::new("theta_test"));
        scheduler.register_task(PullTask::new(provider, lock_manager()));

        scheduler.start().await;
        scheduler.stop().await;

        let status = scheduler.tasks_status().await;
        assert_eq!(status["total_tasks"], 1);
    }
}
