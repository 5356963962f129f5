// Periodic background jobs with an explicit start/stop lifecycle.

use crate::random_tours::{RandomTourGenerator, RandomToursReport};
use crate::warming::{CacheWarmer, WarmingReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// Wait after a cycle that blew up before trying again
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CacheWarming,
    RandomTours,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CacheWarming => "cache_warming",
            JobKind::RandomTours => "random_tours",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatus {
    pub scheduled: bool,
    pub cycle_in_progress: bool,
    pub cycles_completed: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    fn interval(&self) -> Duration;

    fn auto_start(&self) -> bool;

    // One-line outcome for the job status
    async fn run_cycle(&self) -> String;
}

#[async_trait]
impl ScheduledJob for CacheWarmer {
    fn kind(&self) -> JobKind {
        JobKind::CacheWarming
    }

    fn interval(&self) -> Duration {
        self.config().update_interval
    }

    fn auto_start(&self) -> bool {
        self.config().auto_start
    }

    async fn run_cycle(&self) -> String {
        let report = CacheWarmer::run_cycle(self).await;
        format!(
            "{}/{} directions warmed ({:.0}%)",
            report.successful_directions, report.total_directions, report.success_rate
        )
    }
}

#[async_trait]
impl ScheduledJob for RandomTourGenerator {
    fn kind(&self) -> JobKind {
        JobKind::RandomTours
    }

    fn interval(&self) -> Duration {
        self.config().update_interval
    }

    fn auto_start(&self) -> bool {
        self.config().auto_start
    }

    async fn run_cycle(&self) -> String {
        let report = RandomTourGenerator::run_cycle(self).await;
        format!(
            "{} tours across {} hotel types ({} empty)",
            report.total_tours,
            report.hotel_types.len(),
            report.empty_types
        )
    }
}

struct JobSlot {
    job: Arc<dyn ScheduledJob>,
    status: Mutex<JobStatus>,
    // Serializes scheduled and forced runs of the same job
    run_lock: tokio::sync::Mutex<()>,
}

impl JobSlot {
    fn new(job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            job,
            status: Mutex::new(JobStatus::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn begin(&self) {
        let mut status = self.status.lock();
        status.cycle_in_progress = true;
        status.last_started = Some(Utc::now());
    }

    fn finish(&self, outcome: Result<String, String>) {
        let mut status = self.status.lock();
        status.cycle_in_progress = false;
        status.last_finished = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                status.cycles_completed += 1;
                status.last_summary = Some(summary);
                status.last_error = None;
            }
            Err(err) => status.last_error = Some(err),
        }
    }

    // Runs the cycle in its own task so a panic is contained and reported
    async fn run_guarded(&self) -> bool {
        let _guard = self.run_lock.lock().await;
        let kind = self.job.kind();
        info!(job = kind.as_str(), "job cycle started");
        self.begin();

        let job = Arc::clone(&self.job);
        match tokio::spawn(async move { job.run_cycle().await }).await {
            Ok(summary) => {
                info!(job = kind.as_str(), summary = %summary, "job cycle finished");
                self.finish(Ok(summary));
                true
            }
            Err(err) => {
                error!(job = kind.as_str(), error = %err, "job cycle aborted");
                self.finish(Err(err.to_string()));
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            error_backoff: ERROR_BACKOFF,
        }
    }
}

pub struct Scheduler {
    warmer: Arc<CacheWarmer>,
    generator: Arc<RandomTourGenerator>,
    slots: HashMap<JobKind, Arc<JobSlot>>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        warmer: Arc<CacheWarmer>,
        generator: Arc<RandomTourGenerator>,
        config: SchedulerConfig,
    ) -> Self {
        let mut slots = HashMap::new();
        let warming_job: Arc<dyn ScheduledJob> = warmer.clone();
        let random_job: Arc<dyn ScheduledJob> = generator.clone();
        slots.insert(JobKind::CacheWarming, Arc::new(JobSlot::new(warming_job)));
        slots.insert(JobKind::RandomTours, Arc::new(JobSlot::new(random_job)));

        let (shutdown, _) = watch::channel(false);
        Self {
            warmer,
            generator,
            slots,
            config,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("scheduler already running");
            return;
        }

        self.shutdown.send_replace(false);
        for slot in self.slots.values() {
            slot.status.lock().scheduled = true;
            let slot = Arc::clone(slot);
            let shutdown = self.shutdown.subscribe();
            let error_backoff = self.config.error_backoff;
            handles.push(tokio::spawn(job_loop(slot, shutdown, error_backoff)));
        }
        info!(jobs = handles.len(), "scheduler started");
    }

    /// Signals every job loop and waits for them. A cycle already running is
    /// allowed to finish first.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "job loop ended abnormally");
            }
        }
        for slot in self.slots.values() {
            slot.status.lock().scheduled = false;
        }
        info!("scheduler stopped");
    }

    pub fn status(&self, kind: JobKind) -> JobStatus {
        self.slots
            .get(&kind)
            .map(|slot| slot.status.lock().clone())
            .unwrap_or_default()
    }

    pub async fn run_warming_now(&self) -> WarmingReport {
        self.run_typed(JobKind::CacheWarming, self.warmer.run_cycle()).await
    }

    pub async fn run_random_tours_now(&self) -> RandomToursReport {
        self.run_typed(JobKind::RandomTours, self.generator.run_cycle()).await
    }

    async fn run_typed<R>(&self, kind: JobKind, cycle: impl std::future::Future<Output = R>) -> R {
        match self.slots.get(&kind) {
            Some(slot) => {
                let _guard = slot.run_lock.lock().await;
                info!(job = kind.as_str(), "forced job cycle started");
                slot.begin();
                let report = cycle.await;
                slot.finish(Ok("forced run".to_string()));
                report
            }
            None => cycle.await,
        }
    }
}

async fn job_loop(slot: Arc<JobSlot>, mut shutdown: watch::Receiver<bool>, error_backoff: Duration) {
    let kind = slot.job.kind();
    let mut healthy = true;

    if slot.job.auto_start() {
        healthy = slot.run_guarded().await;
    }

    loop {
        let wait = if healthy {
            slot.job.interval()
        } else {
            warn!(job = kind.as_str(), wait_secs = error_backoff.as_secs(), "backing off after failure");
            error_backoff
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        healthy = slot.run_guarded().await;
    }
    info!(job = kind.as_str(), "job loop stopped");
}
