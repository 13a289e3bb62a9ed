//! Id-indexed job table backing the scheduler.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::clock::Instant;
use crate::error::SchedulerError;
use crate::job::{JobId, JobStatus, SpawnJob};
use crate::priority_queue::PriorityQueue;

/// Default number of terminal jobs retained for [`crate::progress::Progress`].
pub const DEFAULT_RECENT_CAPACITY: usize = 100;

/// Owns every job the scheduler knows about: the full by-id table, the
/// priority queue of ids waiting to run, the set of ids currently running,
/// and a bounded ring buffer of recently terminated jobs.
///
/// Per I13, `by_id` keeps a terminal job's record until it is evicted from
/// `recent` — so `get()` (and therefore `cancel`'s `NotFound` vs.
/// `AlreadyTerminal` distinction) stays correct for any job still inside the
/// recent-history window, not just ones still queued or running.
pub struct JobStore {
    by_id: parking_lot::Mutex<HashMap<JobId, SpawnJob>>,
    queued: parking_lot::Mutex<PriorityQueue>,
    running: parking_lot::Mutex<HashSet<JobId>>,
    recent: parking_lot::Mutex<VecDeque<JobId>>,
    recent_capacity: usize,
}

impl JobStore {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            by_id: parking_lot::Mutex::new(HashMap::new()),
            queued: parking_lot::Mutex::new(PriorityQueue::new()),
            running: parking_lot::Mutex::new(HashSet::new()),
            recent: parking_lot::Mutex::new(VecDeque::new()),
            recent_capacity,
        }
    }

    /// Append `id` to the recent-history ring, evicting (and forgetting
    /// entirely) the oldest entry once `recent_capacity` is exceeded.
    fn push_recent(&self, id: JobId) {
        let mut recent = self.recent.lock();
        if recent.len() >= self.recent_capacity {
            if let Some(evicted) = recent.pop_front() {
                self.by_id.lock().remove(&evicted);
            }
        }
        recent.push_back(id);
    }

    /// Insert a freshly submitted job and place it on the priority queue.
    pub fn insert(&self, job: SpawnJob, now: Instant) -> Result<(), SchedulerError> {
        let mut by_id = self.by_id.lock();
        if by_id.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateId(job.id));
        }
        let mut job = job;
        job.enqueued_at = Some(now);
        let (id, priority) = (job.id.clone(), job.priority);
        let sequence = self.queued.lock().push_new(id.clone(), priority);
        job.queue_sequence = sequence;
        by_id.insert(id, job);
        Ok(())
    }

    /// Pop the next runnable job id from the queue without marking it
    /// running. Returns `None` if the queue is empty.
    pub fn peek_next(&self) -> Option<JobId> {
        self.queued.lock().pop()
    }

    /// Move a job from queued to running.
    pub fn mark_running(&self, id: &JobId, now: Instant) {
        let mut by_id = self.by_id.lock();
        if let Some(job) = by_id.get_mut(id) {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
        }
        self.running.lock().insert(id.clone());
    }

    /// Re-queue a job that is being retried after a transient failure. This
    /// is a genuinely new scheduling attempt, so it gets a fresh FIFO
    /// position rather than reclaiming its old one.
    pub fn requeue_for_retry(&self, id: &JobId) {
        self.running.lock().remove(id);
        let mut by_id = self.by_id.lock();
        let Some(job) = by_id.get_mut(id) else {
            return;
        };
        job.status = JobStatus::Retrying;
        job.retry_count += 1;
        let priority = job.priority;
        let sequence = self.queued.lock().push_new(id.clone(), priority);
        job.queue_sequence = sequence;
    }

    /// Put a job that lost a race for a resource (token bucket, agent cap)
    /// back on the queue without counting it as a retry attempt or
    /// changing its status away from `Queued`. Re-enters at the FIFO
    /// position it already held (its stored `queue_sequence`), rather than
    /// a fresh one, so a job denied a resource more than once doesn't keep
    /// losing ground to jobs that arrived after it.
    pub fn requeue_unchanged(&self, id: &JobId, priority: crate::job::Priority) {
        self.running.lock().remove(id);
        let sequence = self.by_id.lock().get(id).map(|j| j.queue_sequence).unwrap_or(0);
        self.queued.lock().push_at(id.clone(), priority, sequence);
    }

    /// Retire a job to a terminal status. The record stays in `by_id`,
    /// addressable by [`JobStore::get`], until evicted from the
    /// recent-history ring.
    pub fn retire(&self, id: &JobId, status: JobStatus, error: Option<String>, now: Instant) {
        debug_assert!(status.is_terminal());
        self.running.lock().remove(id);
        {
            let mut by_id = self.by_id.lock();
            if let Some(job) = by_id.get_mut(id) {
                job.status = status;
                job.finished_at = Some(now);
                job.error = error;
            } else {
                return;
            }
        }
        self.push_recent(id.clone());
    }

    /// Attempt to remove `id` from the priority queue outright. Returns
    /// `false` if it was not there — either a worker already popped it for
    /// dispatch (but has not yet called [`JobStore::mark_running`]), or it
    /// is already running. Callers that get `false` back should fall back
    /// to a cancel-token-based cancellation rather than assuming the job
    /// was queued at all.
    pub fn try_remove_queued(&self, id: &JobId) -> bool {
        self.queued.lock().remove(id)
    }

    /// Finalize a job — known to have just been removed from the queue via
    /// [`JobStore::try_remove_queued`] — as cancelled.
    pub fn mark_cancelled_terminal(&self, id: &JobId, now: Instant) {
        {
            let mut by_id = self.by_id.lock();
            let Some(job) = by_id.get_mut(id) else {
                return;
            };
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
        }
        self.push_recent(id.clone());
    }

    /// Fetch a clone of a job's current state, wherever it sits.
    pub fn get(&self, id: &JobId) -> Option<SpawnJob> {
        self.by_id.lock().get(id).cloned()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn running_ids(&self) -> Vec<JobId> {
        self.running.lock().iter().cloned().collect()
    }

    pub fn queued_snapshot(&self) -> Vec<SpawnJob> {
        let by_id = self.by_id.lock();
        let running = self.running.lock();
        by_id
            .values()
            .filter(|j| !running.contains(&j.id) && !j.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn running_snapshot(&self) -> Vec<SpawnJob> {
        let by_id = self.by_id.lock();
        let running = self.running.lock();
        running
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect()
    }

    pub fn recent_snapshot(&self) -> Vec<SpawnJob> {
        let by_id = self.by_id.lock();
        self.recent
            .lock()
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect()
    }
}
