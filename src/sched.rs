//! Background sync scheduler.
//!
//! One [`SyncJob`] exists per refreshable data type, created at scheduler
//! start and never destroyed, only reprioritized or rescheduled. Scheduling
//! itself is a pure state transition over the job table (`due_at`), driven
//! by a fixed tick; job bodies run through the injected [`JobRunner`].
//!
//! Failures never escape a tick: a failing job is logged and rescheduled
//! sooner than its normal interval, but never faster than a floor, so a
//! persistently failing source cannot hot-loop the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::FetchResult;

/// The refreshable data types, one scheduled job each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
  MergeRequests,
  WorkItems,
  TicketGroups,
}

impl std::fmt::Display for DataType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DataType::MergeRequests => write!(f, "merge_requests"),
      DataType::WorkItems => write!(f, "work_items"),
      DataType::TicketGroups => write!(f, "ticket_groups"),
    }
  }
}

/// Fixed iteration order; also the tie-break order for equal priorities.
const ALL_DATA_TYPES: [DataType; 3] = [
  DataType::TicketGroups,
  DataType::WorkItems,
  DataType::MergeRequests,
];

const BASELINE_PRIORITY: u32 = 10;

/// Which part of the UI is currently active. Boosts the jobs that feed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveContext {
  /// The grouped ticket board is visible.
  TicketBoard,
  /// The review queue (flat merge request list) is visible.
  ReviewQueue,
}

impl ActiveContext {
  /// Boost applied on top of the baseline, descending with freshness
  /// sensitivity for the active view.
  fn boost(&self, data_type: DataType) -> u32 {
    match (self, data_type) {
      (ActiveContext::TicketBoard, DataType::TicketGroups) => 50,
      (ActiveContext::TicketBoard, DataType::WorkItems) => 30,
      (ActiveContext::TicketBoard, DataType::MergeRequests) => 10,
      (ActiveContext::ReviewQueue, DataType::MergeRequests) => 50,
      (ActiveContext::ReviewQueue, DataType::TicketGroups) => 30,
      (ActiveContext::ReviewQueue, DataType::WorkItems) => 10,
    }
  }
}

/// Mutable scheduling state for one data type.
#[derive(Debug, Clone)]
pub struct SyncJob {
  pub data_type: DataType,
  pub interval: Duration,
  pub priority: u32,
  pub last_run: Option<DateTime<Utc>>,
  pub next_run: DateTime<Utc>,
  pub is_running: bool,
}

/// Executes the refresh behind a scheduled job.
#[async_trait]
pub trait JobRunner: Send + Sync {
  async fn run(&self, data_type: DataType) -> FetchResult<()>;
}

/// The scheduler: a job table plus the tick that drives it.
pub struct Scheduler<R: JobRunner> {
  jobs: Mutex<Vec<SyncJob>>,
  runner: Arc<R>,
  config: SyncConfig,
}

impl<R: JobRunner> Scheduler<R> {
  /// Create the job table. All jobs start due immediately at baseline
  /// priority.
  pub fn new(runner: Arc<R>, config: SyncConfig) -> Self {
    let now = Utc::now();
    let interval = Duration::seconds(config.interval_secs as i64);

    let jobs = ALL_DATA_TYPES
      .iter()
      .map(|&data_type| SyncJob {
        data_type,
        interval,
        priority: BASELINE_PRIORITY,
        last_run: None,
        next_run: now,
        is_running: false,
      })
      .collect();

    Self {
      jobs: Mutex::new(jobs),
      runner,
      config,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SyncJob>> {
    self.jobs.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Snapshot of the job table, for inspection.
  pub fn jobs(&self) -> Vec<SyncJob> {
    self.lock().clone()
  }

  /// The jobs due at `now`, sorted by descending priority (stable over the
  /// fixed data-type order on ties) and truncated to the per-tick admission
  /// bound. Pure with respect to the table: selection does not mutate.
  pub fn due_at(&self, now: DateTime<Utc>) -> Vec<DataType> {
    let jobs = self.lock();
    let mut due: Vec<(u32, DataType)> = jobs
      .iter()
      .filter(|j| !j.is_running && j.next_run <= now)
      .map(|j| (j.priority, j.data_type))
      .collect();

    due.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));
    due.truncate(self.config.max_concurrent_per_tick);
    due.into_iter().map(|(_, dt)| dt).collect()
  }

  /// Examine the table and run everything due. Job failures are contained:
  /// logged, reflected in the job's backoff, never propagated.
  pub async fn tick(&self) {
    self.tick_at(Utc::now()).await;
  }

  /// `tick` with an explicit clock, for deterministic tests.
  pub async fn tick_at(&self, now: DateTime<Utc>) {
    let admitted = self.due_at(now);
    if admitted.is_empty() {
      return;
    }
    debug!(?admitted, "admitting due sync jobs");

    {
      let mut jobs = self.lock();
      for job in jobs.iter_mut() {
        if admitted.contains(&job.data_type) {
          job.is_running = true;
        }
      }
    }

    let results = join_all(admitted.iter().map(|&data_type| {
      let runner = Arc::clone(&self.runner);
      async move { (data_type, runner.run(data_type).await) }
    }))
    .await;

    let mut jobs = self.lock();
    for (data_type, result) in results {
      let Some(job) = jobs.iter_mut().find(|j| j.data_type == data_type) else {
        continue;
      };
      job.is_running = false;
      Self::settle(job, result, now, self.config.min_backoff_secs);
    }
  }

  /// Apply the post-run transition: back to idle with the next run scheduled.
  fn settle(job: &mut SyncJob, result: FetchResult<()>, now: DateTime<Utc>, min_backoff_secs: u64) {
    match result {
      Ok(()) => {
        job.last_run = Some(now);
        job.next_run = now + job.interval;
      }
      Err(e) => {
        // Retry sooner than the normal interval, but never below the floor
        let delay = std::cmp::max(Duration::seconds(min_backoff_secs as i64), job.interval / 3);
        job.next_run = now + delay;
        warn!(data_type = %job.data_type, error = %e, retry_in = ?delay, "sync job failed");
      }
    }
  }

  /// Reset every job to baseline priority, then boost the jobs feeding the
  /// active view.
  pub fn set_active_context(&self, context: ActiveContext) {
    let mut jobs = self.lock();
    for job in jobs.iter_mut() {
      job.priority = BASELINE_PRIORITY + context.boost(job.data_type);
    }
  }

  /// Run one job immediately, out of band. Returns false when the job is
  /// already running (the guard against overlapping refreshes of the same
  /// job) or unknown.
  pub async fn refresh_now(&self, data_type: DataType) -> bool {
    {
      let mut jobs = self.lock();
      let Some(job) = jobs.iter_mut().find(|j| j.data_type == data_type) else {
        return false;
      };
      if job.is_running {
        return false;
      }
      job.is_running = true;
    }

    let result = self.runner.run(data_type).await;

    let now = Utc::now();
    let mut jobs = self.lock();
    if let Some(job) = jobs.iter_mut().find(|j| j.data_type == data_type) {
      job.is_running = false;
      Self::settle(job, result, now, self.config.min_backoff_secs);
    }
    true
  }

  /// Turnkey driver: tick forever on the configured cadence.
  pub async fn run_loop(&self) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs));
    loop {
      ticker.tick().await;
      self.tick().await;
    }
  }

  #[cfg(test)]
  fn force_running(&self, data_type: DataType, running: bool) {
    let mut jobs = self.lock();
    if let Some(job) = jobs.iter_mut().find(|j| j.data_type == data_type) {
      job.is_running = running;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::FetchError;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default)]
  struct CountingRunner {
    runs: Mutex<HashMap<DataType, u32>>,
    failures: AtomicU32,
    fail_merge_requests: bool,
  }

  impl CountingRunner {
    fn count(&self, data_type: DataType) -> u32 {
      *self.runs.lock().unwrap().get(&data_type).unwrap_or(&0)
    }
  }

  #[async_trait]
  impl JobRunner for CountingRunner {
    async fn run(&self, data_type: DataType) -> FetchResult<()> {
      *self.runs.lock().unwrap().entry(data_type).or_insert(0) += 1;
      if self.fail_merge_requests && data_type == DataType::MergeRequests {
        self.failures.fetch_add(1, Ordering::SeqCst);
        return Err(FetchError::Transient("source down".into()));
      }
      Ok(())
    }
  }

  fn config() -> SyncConfig {
    SyncConfig {
      tick_secs: 30,
      max_concurrent_per_tick: 2,
      min_backoff_secs: 60,
      interval_secs: 300,
    }
  }

  #[test]
  fn test_context_boost_orders_due_jobs() {
    let scheduler = Scheduler::new(Arc::new(CountingRunner::default()), config());
    scheduler.set_active_context(ActiveContext::ReviewQueue);

    let due = scheduler.due_at(Utc::now());
    // Admission bound of 2: the two highest boosts for the review queue
    assert_eq!(due, vec![DataType::MergeRequests, DataType::TicketGroups]);
  }

  #[test]
  fn test_context_switch_resets_priorities() {
    let scheduler = Scheduler::new(Arc::new(CountingRunner::default()), config());
    scheduler.set_active_context(ActiveContext::ReviewQueue);
    scheduler.set_active_context(ActiveContext::TicketBoard);

    let due = scheduler.due_at(Utc::now());
    // Boosts do not stack across context switches
    assert_eq!(due, vec![DataType::TicketGroups, DataType::WorkItems]);

    let jobs = scheduler.jobs();
    let mr_job = jobs
      .iter()
      .find(|j| j.data_type == DataType::MergeRequests)
      .unwrap();
    assert_eq!(mr_job.priority, BASELINE_PRIORITY + 10);
  }

  #[test]
  fn test_equal_priorities_tie_break_deterministically() {
    let scheduler = Scheduler::new(Arc::new(CountingRunner::default()), config());
    // No context set: everything at baseline, fixed order decides
    let due = scheduler.due_at(Utc::now());
    assert_eq!(due, vec![DataType::TicketGroups, DataType::WorkItems]);
  }

  #[test]
  fn test_running_job_is_not_due() {
    let scheduler = Scheduler::new(Arc::new(CountingRunner::default()), config());
    scheduler.force_running(DataType::TicketGroups, true);

    let due = scheduler.due_at(Utc::now());
    assert!(!due.contains(&DataType::TicketGroups));
  }

  #[tokio::test]
  async fn test_tick_success_schedules_next_interval() {
    let runner = Arc::new(CountingRunner::default());
    let scheduler = Scheduler::new(Arc::clone(&runner), config());
    let now = Utc::now();

    scheduler.tick_at(now).await;

    assert_eq!(runner.count(DataType::TicketGroups), 1);
    let jobs = scheduler.jobs();
    let job = jobs
      .iter()
      .find(|j| j.data_type == DataType::TicketGroups)
      .unwrap();
    assert!(!job.is_running);
    assert_eq!(job.last_run, Some(now));
    assert_eq!(job.next_run, now + Duration::seconds(300));

    // Not due again until the interval elapses
    assert!(!scheduler.due_at(now + Duration::seconds(299)).contains(&DataType::TicketGroups));
    assert!(scheduler.due_at(now + Duration::seconds(300)).contains(&DataType::TicketGroups));
  }

  #[tokio::test]
  async fn test_failure_backoff_is_sooner_than_interval_but_floored() {
    let runner = Arc::new(CountingRunner {
      fail_merge_requests: true,
      ..Default::default()
    });
    let scheduler = Scheduler::new(Arc::clone(&runner), config());
    scheduler.set_active_context(ActiveContext::ReviewQueue);
    let now = Utc::now();

    scheduler.tick_at(now).await;

    let jobs = scheduler.jobs();
    let job = jobs
      .iter()
      .find(|j| j.data_type == DataType::MergeRequests)
      .unwrap();
    // max(min_backoff, interval / 3) = max(60, 100) = 100
    assert_eq!(job.next_run, now + Duration::seconds(100));
    assert!(job.next_run < now + Duration::seconds(300));
    // Failure does not count as a completed run
    assert_eq!(job.last_run, None);
  }

  #[tokio::test]
  async fn test_failure_backoff_floor_applies() {
    let mut cfg = config();
    cfg.interval_secs = 90; // interval / 3 = 30, below the 60s floor
    let runner = Arc::new(CountingRunner {
      fail_merge_requests: true,
      ..Default::default()
    });
    let scheduler = Scheduler::new(Arc::clone(&runner), cfg);
    scheduler.set_active_context(ActiveContext::ReviewQueue);
    let now = Utc::now();

    scheduler.tick_at(now).await;

    let jobs = scheduler.jobs();
    let job = jobs
      .iter()
      .find(|j| j.data_type == DataType::MergeRequests)
      .unwrap();
    assert_eq!(job.next_run, now + Duration::seconds(60));
  }

  #[tokio::test]
  async fn test_job_failure_does_not_starve_siblings() {
    let runner = Arc::new(CountingRunner {
      fail_merge_requests: true,
      ..Default::default()
    });
    let scheduler = Scheduler::new(Arc::clone(&runner), config());
    scheduler.set_active_context(ActiveContext::ReviewQueue);
    let now = Utc::now();

    // First tick admits merge_requests (fails) and ticket_groups (succeeds)
    scheduler.tick_at(now).await;
    assert_eq!(runner.count(DataType::MergeRequests), 1);
    assert_eq!(runner.count(DataType::TicketGroups), 1);

    // Next tick still serves the remaining job
    scheduler.tick_at(now + Duration::seconds(1)).await;
    assert_eq!(runner.count(DataType::WorkItems), 1);
  }

  #[tokio::test]
  async fn test_refresh_now_respects_running_guard() {
    let runner = Arc::new(CountingRunner::default());
    let scheduler = Scheduler::new(Arc::clone(&runner), config());

    scheduler.force_running(DataType::WorkItems, true);
    assert!(!scheduler.refresh_now(DataType::WorkItems).await);
    assert_eq!(runner.count(DataType::WorkItems), 0);

    scheduler.force_running(DataType::WorkItems, false);
    assert!(scheduler.refresh_now(DataType::WorkItems).await);
    assert_eq!(runner.count(DataType::WorkItems), 1);
  }
}
