//! The core dispatcher: worker pool, supervisor tick, and the public
//! enqueue/cancel/pause/resume/stop surface.
//!
//! Lifecycle mirrors this codebase's own construct -> start -> stop shape:
//! [`Scheduler::new`] builds an inert value; [`Scheduler::start`] spawns the
//! worker tasks and the cap-ramp supervisor under a root
//! [`CancellationToken`] and returns a [`SchedulerHandle`]; dropping or
//! calling [`SchedulerHandle::stop`] cancels the token tree and joins every
//! worker.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_caps::AgentCaps;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{Broadcaster, EventSink, SchedulerEvent};
use crate::job::{JobId, JobStatus, SpawnJob};
use crate::job_store::JobStore;
use crate::progress::{JobView, Progress, RunState, TokenBucketStats};
use crate::runner::{Runner, RunnerOutcome};
use crate::token_bucket::TokenBucket;

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    runner: Arc<dyn Runner>,
    store: JobStore,
    token_bucket: TokenBucket,
    agent_caps: AgentCaps,
    events: Broadcaster,
    paused: AtomicBool,
    wake: Notify,
    /// Cancel tokens for jobs currently inside `Runner::execute`, keyed by
    /// job id, so [`Scheduler::cancel`] can reach a *running* job (a queued
    /// job is simply removed from the priority queue instead).
    job_cancels: parking_lot::Mutex<std::collections::HashMap<JobId, CancellationToken>>,
    /// Jobs whose running instance has been asked to cancel. Consulted when
    /// a worker observes `Runner::execute` return, to report the terminal
    /// event as `Cancelled` rather than `Completed`/`Failed`/`Retrying`.
    cancel_requested: parking_lot::Mutex<std::collections::HashSet<JobId>>,
}

/// The inert, not-yet-running scheduler value.
///
/// Construct with [`Scheduler::new`], then call [`Scheduler::start`] to
/// begin dispatching.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a new scheduler. Fails only if `config.agent_caps` is
    /// internally inconsistent (e.g. an override's `initial` exceeds its
    /// `max_cap`).
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        runner: Arc<dyn Runner>,
    ) -> SchedulerResult<Self> {
        let default_cap_config = crate::agent_caps::AgentTypeConfig {
            initial: config.agent_caps.default_initial,
            max_cap: config.agent_caps.default_max_cap,
            rampup_enabled: config.agent_caps.default_rampup_enabled,
            ramp_rate: config.agent_caps.default_ramp_rate,
            cooldown_enabled: config.agent_caps.default_cooldown_enabled,
            cooldown_reduction: config.agent_caps.default_cooldown_reduction,
            cooldown_duration: Duration::from_secs(config.agent_caps.default_cooldown_duration_secs),
        };
        let overrides = config
            .agent_caps
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.into()))
            .collect();
        let agent_caps = AgentCaps::new(default_cap_config, config.agent_caps.global_max, overrides)?;
        let token_bucket = TokenBucket::new(config.global_capacity, config.global_rate, clock.as_ref());
        let store = JobStore::new(config.recent_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                runner,
                store,
                token_bucket,
                agent_caps,
                events: Broadcaster::new(),
                paused: AtomicBool::new(false),
                wake: Notify::new(),
                job_cancels: parking_lot::Mutex::new(std::collections::HashMap::new()),
                cancel_requested: parking_lot::Mutex::new(std::collections::HashSet::new()),
            }),
        })
    }

    /// Submit a job. Returns [`SchedulerError::QueueFull`] if the queue is
    /// already at `queue_capacity`, or [`SchedulerError::DuplicateId`] if a
    /// job with this id is already known.
    pub fn enqueue(&self, job: SpawnJob) -> SchedulerResult<()> {
        if self.inner.store.queued_count() >= self.inner.config.queue_capacity {
            warn!(job_id = %job.id, "queue at capacity, rejecting enqueue");
            self.inner
                .events
                .publish(SchedulerEvent::Backpressure { job_id: job.id.clone() });
            return Err(SchedulerError::QueueFull);
        }
        let now = self.inner.clock.now();
        let job_id = job.id.clone();
        let mut job = job;
        if job.max_retries.is_none() {
            job.max_retries = Some(self.inner.config.default_max_retries);
        }
        self.inner.store.insert(job, now)?;
        metrics::counter!("fleet_scheduler_jobs_enqueued_total").increment(1);
        debug!(job_id = %job_id, "job enqueued");
        self.inner.events.publish(SchedulerEvent::Enqueued { job_id });
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Cancel a job. A queued job is removed from the priority queue
    /// immediately. A running job has its per-job [`CancellationToken`]
    /// fired; per the [`crate::runner::Runner`] contract it must then
    /// return promptly, and the worker that observes this reports the
    /// job's terminal event as `Cancelled` rather than whatever
    /// [`RunnerOutcome`] the runner happened to return.
    pub fn cancel(&self, id: &JobId) -> SchedulerResult<()> {
        let Some(job) = self.inner.store.get(id) else {
            return Err(SchedulerError::NotFound(id.clone()));
        };
        if job.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(id.clone()));
        }
        if job.status == JobStatus::Running {
            self.inner.cancel_requested.lock().insert(id.clone());
            if let Some(token) = self.inner.job_cancels.lock().get(id) {
                token.cancel();
            }
            return Ok(());
        }
        let now = self.inner.clock.now();
        if !self.inner.store.try_remove_queued(id) {
            // Lost the race: a worker already popped this job off the queue
            // (but has not yet called `mark_running`). Treat it the same as
            // any other already-terminal-from-our-perspective case per R1.
            return Err(SchedulerError::AlreadyTerminal(id.clone()));
        }
        self.inner.store.mark_cancelled_terminal(id, now);
        self.inner
            .events
            .publish(SchedulerEvent::Cancelled { job_id: id.clone() });
        Ok(())
    }

    /// Pause dispatch. Jobs already running continue; no new job starts
    /// until [`Scheduler::resume`] is called.
    pub fn pause(&self) {
        self.inner.paused.store(true, AtomicOrdering::Release);
        self.inner.events.publish(SchedulerEvent::Paused);
    }

    /// Resume dispatch after a pause.
    pub fn resume(&self) {
        self.inner.paused.store(false, AtomicOrdering::Release);
        self.inner.events.publish(SchedulerEvent::Resumed);
        self.inner.wake.notify_waiters();
    }

    /// Subscribe to the scheduler's event stream.
    pub fn subscribe(&self) -> EventSink {
        self.inner.events.subscribe()
    }

    /// Read-only snapshot of current scheduler state.
    pub fn progress(&self) -> Progress {
        let queued: Vec<JobView> = self.inner.store.queued_snapshot().iter().map(JobView::from).collect();
        let running: Vec<JobView> = self.inner.store.running_snapshot().iter().map(JobView::from).collect();
        let recent: Vec<JobView> = self.inner.store.recent_snapshot().iter().map(JobView::from).collect();
        let completed_count = recent.iter().filter(|j| j.status == JobStatus::Completed).count();
        let failed_count = recent.iter().filter(|j| j.status == JobStatus::Failed).count();

        let token_bucket = TokenBucketStats {
            available_tokens: self.inner.token_bucket.available_tokens(self.inner.clock.as_ref()),
            rate: self.inner.config.global_rate,
            capacity: self.inner.config.global_capacity,
            waiters: self.inner.token_bucket.waiter_count(),
            time_until_next_token: self.inner.token_bucket.time_until_next_token(self.inner.clock.as_ref()),
        };
        let drain_eta = if self.inner.config.global_rate > 0.0 && self.inner.config.workers > 0 {
            let effective_rate = self.inner.config.global_rate;
            Some(Duration::from_secs_f64(
                queued.len() as f64 / self.inner.config.workers as f64 / effective_rate,
            ))
        } else {
            None
        };
        let status = if self.inner.paused.load(AtomicOrdering::Acquire) {
            RunState::Paused
        } else {
            RunState::Running
        };
        let agent_caps = self.inner.agent_caps.stats();
        let sessions = Vec::new();

        metrics::gauge!("fleet_scheduler_queued_jobs").set(queued.len() as f64);
        metrics::gauge!("fleet_scheduler_running_jobs").set(running.len() as f64);

        Progress {
            status,
            queued_count: queued.len(),
            running_count: running.len(),
            completed_count,
            failed_count,
            token_bucket,
            drain_eta,
            queued,
            running,
            recent,
            agent_caps,
            sessions,
        }
    }

    /// Snapshot grouped by session, attaching known pane counts.
    pub fn progress_for_sessions(&self, totals: &std::collections::HashMap<String, u32>) -> Progress {
        let mut progress = self.progress();
        progress.sessions = progress.group_by_session(totals);
        progress
    }

    /// Spawn the worker pool and the cap-ramp supervisor, returning a
    /// handle used to stop them.
    pub fn start(self) -> SchedulerHandle {
        let root_token = CancellationToken::new();
        let mut tasks = Vec::new();

        for worker_id in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            let token = root_token.child_token();
            tasks.push(tokio::spawn(worker_loop(inner, token, worker_id)));
        }

        let inner = self.inner.clone();
        let token = root_token.child_token();
        tasks.push(tokio::spawn(supervisor_tick_loop(inner, token)));

        info!(workers = self.inner.config.workers, "scheduler started");

        SchedulerHandle {
            scheduler: self,
            cancel_token: root_token,
            tasks,
        }
    }
}

/// A started scheduler. Delegates enqueue/cancel/pause/resume/progress to
/// the underlying [`Scheduler`]; adds [`SchedulerHandle::stop`] to tear down
/// the worker pool.
pub struct SchedulerHandle {
    scheduler: Scheduler,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn enqueue(&self, job: SpawnJob) -> SchedulerResult<()> {
        self.scheduler.enqueue(job)
    }

    pub fn cancel(&self, id: &JobId) -> SchedulerResult<()> {
        self.scheduler.cancel(id)
    }

    pub fn pause(&self) {
        self.scheduler.pause()
    }

    pub fn resume(&self) {
        self.scheduler.resume()
    }

    pub fn subscribe(&self) -> EventSink {
        self.scheduler.subscribe()
    }

    pub fn progress(&self) -> Progress {
        self.scheduler.progress()
    }

    pub fn progress_for_sessions(&self, totals: &std::collections::HashMap<String, u32>) -> Progress {
        self.scheduler.progress_for_sessions(totals)
    }

    /// Cancel the worker pool's cancellation-token tree and wait up to
    /// `grace` for every worker to exit. Returns
    /// [`SchedulerError::ShutdownTimeout`] if they do not.
    pub async fn stop(mut self, grace: Duration) -> SchedulerResult<()> {
        self.cancel_token.cancel();
        let join_all = futures::future::join_all(self.tasks.drain(..));
        match tokio::time::timeout(grace, join_all).await {
            Ok(_) => {
                info!("scheduler stopped");
                Ok(())
            }
            Err(_) => {
                warn!("scheduler shutdown exceeded grace period");
                Err(SchedulerError::ShutdownTimeout)
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, token: CancellationToken, worker_id: usize) {
    debug!(worker_id, "worker started");
    loop {
        if token.is_cancelled() {
            break;
        }
        if inner.paused.load(AtomicOrdering::Acquire) {
            tokio::select! {
                _ = inner.wake.notified() => continue,
                _ = token.cancelled() => break,
            }
        }

        let Some(job_id) = inner.store.peek_next() else {
            tokio::select! {
                _ = inner.wake.notified() => continue,
                _ = token.cancelled() => break,
                outcome = inner.clock.sleep(Duration::from_millis(100), &token) => {
                    if matches!(outcome, crate::clock::SleepOutcome::Cancelled) && token.is_cancelled() {
                        break;
                    }
                    continue;
                }
            }
        };

        let Some(job) = inner.store.get(&job_id) else {
            continue;
        };
        if job.status.is_terminal() {
            continue;
        }

        if !inner.token_bucket.acquire(inner.clock.as_ref(), &token).await {
            // Cancelled while waiting for a token: put the job back so it
            // isn't lost, without having consumed a token for it. It keeps
            // its original FIFO position rather than losing ground to jobs
            // enqueued while it waited.
            inner.store.requeue_unchanged(&job_id, job.priority);
            break;
        }

        // No cap slot free right now: park in that agent type's FIFO
        // waiter queue instead of busy-polling. `acquire` only returns
        // `false` if `token` fired while waiting, in which case the token
        // already spent above is not refunded (the spec's shaping, not
        // queue backpressure, applies here) but the job keeps its place in
        // line via the same unchanged-position requeue.
        if !inner.agent_caps.acquire(&job.agent_type, &token).await {
            inner.store.requeue_unchanged(&job_id, job.priority);
            break;
        }

        let now = inner.clock.now();
        inner.store.mark_running(&job_id, now);
        debug!(job_id = %job_id, "job started");
        inner.events.publish(SchedulerEvent::Started { job_id: job_id.clone() });

        let job = inner.store.get(&job_id).unwrap_or(job);
        let job_token = token.child_token();
        inner.job_cancels.lock().insert(job_id.clone(), job_token.clone());
        let outcome = run_catching_panics(inner.runner.clone(), job.clone(), job_token.clone()).await;
        inner.job_cancels.lock().remove(&job_id);
        inner.agent_caps.release(&job.agent_type);

        let now = inner.clock.now();
        let was_cancel_requested = inner.cancel_requested.lock().remove(&job_id);
        if was_cancel_requested {
            inner.store.retire(&job_id, JobStatus::Cancelled, None, now);
            debug!(job_id = %job_id, "job cancelled");
            inner.events.publish(SchedulerEvent::Cancelled { job_id: job_id.clone() });
            continue;
        }
        match outcome {
            RunnerOutcome::Ok => {
                inner.store.retire(&job_id, JobStatus::Completed, None, now);
                metrics::counter!("fleet_scheduler_jobs_completed_total").increment(1);
                debug!(job_id = %job_id, "job completed");
                inner.events.publish(SchedulerEvent::Completed { job_id: job_id.clone() });
            }
            RunnerOutcome::Failed { error, retryable } => {
                inner.agent_caps.record_failure(&job.agent_type, now);
                if retryable && job.retry_count < job.max_retries.unwrap_or(0) {
                    let attempt = job.retry_count + 1;
                    let delay = retry_delay(&inner.config, job.retry_count);
                    inner.store.requeue_for_retry(&job_id);
                    warn!(job_id = %job_id, attempt, delay_ms = delay.as_millis() as u64, %error, "job failed, scheduling retry");
                    inner.events.publish(SchedulerEvent::Retrying { job_id: job_id.clone(), attempt });
                    let inner2 = inner.clone();
                    let token2 = token.clone();
                    tokio::spawn(async move {
                        inner2.clock.sleep(delay, &token2).await;
                        inner2.wake.notify_waiters();
                    });
                } else {
                    inner
                        .store
                        .retire(&job_id, JobStatus::Failed, Some(error.clone()), now);
                    metrics::counter!("fleet_scheduler_jobs_failed_total").increment(1);
                    debug!(job_id = %job_id, %error, "job failed, no retry");
                    inner
                        .events
                        .publish(SchedulerEvent::Failed { job_id: job_id.clone(), retryable: false });
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Run `runner.execute` on its own task so a panic inside it is caught at
/// the `JoinHandle` boundary instead of taking down the worker task (and
/// with it every other job that worker would ever have run). Converted to a
/// synthetic, retryable failure per the "Runner panics" fatal condition.
async fn run_catching_panics(
    runner: Arc<dyn Runner>,
    job: SpawnJob,
    cancel: CancellationToken,
) -> RunnerOutcome {
    let job_id = job.id.clone();
    match tokio::spawn(async move { runner.execute(&job, &cancel).await }).await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            warn!(job_id = %job_id, error = %join_err, "runner panicked");
            RunnerOutcome::Failed {
                error: format!("runner panicked: {join_err}"),
                retryable: true,
            }
        }
    }
}

async fn supervisor_tick_loop(inner: Arc<Inner>, token: CancellationToken) {
    let interval = inner.config.agent_caps.tick_interval;
    loop {
        let outcome = inner.clock.sleep(interval, &token).await;
        if matches!(outcome, crate::clock::SleepOutcome::Cancelled) && token.is_cancelled() {
            break;
        }
        let now = inner.clock.now();
        inner.agent_caps.tick(now, interval);
    }
}

/// `base * 2^attempt`, capped, with +/- `jitter` fractional noise.
fn retry_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let base = config.retry_backoff_base.as_secs_f64();
    let uncapped = base * 2f64.powi(attempt as i32);
    let capped = uncapped.min(config.retry_backoff_cap.as_secs_f64());
    let jitter_fraction = rand::thread_rng().gen_range(-config.retry_backoff_jitter..=config.retry_backoff_jitter);
    let jittered = (capped * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::job::{AgentType, JobKind, Priority};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct AlwaysOk;
    #[async_trait]
    impl Runner for AlwaysOk {
        async fn execute(&self, _job: &SpawnJob, _cancel: &CancellationToken) -> RunnerOutcome {
            RunnerOutcome::Ok
        }
    }

    struct CountingRunner {
        calls: Arc<AtomicU32>,
    }
    #[async_trait]
    impl Runner for CountingRunner {
        async fn execute(&self, _job: &SpawnJob, _cancel: &CancellationToken) -> RunnerOutcome {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            RunnerOutcome::Ok
        }
    }

    fn job(id: &str, priority: Priority) -> SpawnJob {
        SpawnJob::new(
            JobId::from_string(id),
            JobKind::StartAgent,
            AgentType::new("cc"),
            "session-1",
            priority,
            serde_json::Value::Null,
            3,
        )
    }

    #[tokio::test]
    async fn enqueue_and_complete_via_runner() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new());
        let calls = Arc::new(AtomicU32::new(0));
        let runner = Arc::new(CountingRunner { calls: calls.clone() });
        let config = SchedulerConfig {
            workers: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, clock, runner).unwrap();
        scheduler.enqueue(job("a", Priority::Normal)).unwrap();
        let handle = scheduler.start();

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if calls.load(AtomicOrdering::SeqCst) >= 1 {
                break;
            }
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_enqueue_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new());
        let runner = Arc::new(AlwaysOk);
        let scheduler = Scheduler::new(SchedulerConfig::default(), clock, runner).unwrap();
        scheduler.enqueue(job("a", Priority::Normal)).unwrap();
        let err = scheduler.enqueue(job("a", Priority::Normal)).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn queue_full_rejects_enqueue() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new());
        let runner = Arc::new(AlwaysOk);
        let config = SchedulerConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, clock, runner).unwrap();
        scheduler.enqueue(job("a", Priority::Normal)).unwrap();
        let err = scheduler.enqueue(job("b", Priority::Normal)).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull));
    }

    #[tokio::test]
    async fn pause_prevents_dispatch() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new());
        let calls = Arc::new(AtomicU32::new(0));
        let runner = Arc::new(CountingRunner { calls: calls.clone() });
        let config = SchedulerConfig {
            workers: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, clock, runner).unwrap();
        scheduler.pause();
        scheduler.enqueue(job("a", Priority::Normal)).unwrap();
        let handle = scheduler.start();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        handle.resume();
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if calls.load(AtomicOrdering::SeqCst) >= 1 {
                break;
            }
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }
}
