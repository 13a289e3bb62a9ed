//! Read-only snapshots of scheduler state for external observers.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_caps::AgentCapStats;
use crate::job::{JobId, JobStatus, Priority, SpawnJob};

/// A trimmed, serializable view of a [`SpawnJob`] for progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub session_name: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl From<&SpawnJob> for JobView {
    fn from(job: &SpawnJob) -> Self {
        Self {
            id: job.id.clone(),
            session_name: job.session_name.clone(),
            priority: job.priority,
            status: job.status,
            retry_count: job.retry_count,
            error: job.error.clone(),
        }
    }
}

/// Token bucket state, for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketStats {
    pub available_tokens: f64,
    pub rate: f64,
    pub capacity: f64,
    pub waiters: usize,
    pub time_until_next_token: Duration,
}

/// Jobs grouped by terminal-multiplexer session. The scheduler has no
/// notion of pane topology itself; `total_panes` is supplied by the caller
/// through [`crate::scheduler::SchedulerHandle::progress_for_sessions`]
/// when it wants that context reflected in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_name: String,
    pub total_panes: Option<u32>,
    pub jobs: Vec<JobView>,
}

/// Whether the scheduler is actively dispatching or paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// A point-in-time view of the scheduler, built by reading each component's
/// lock in turn (job store, then token bucket, then agent caps) — a
/// consistent-per-component view rather than a single atomic instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub status: RunState,
    pub queued_count: usize,
    pub running_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub token_bucket: TokenBucketStats,
    /// Estimated time to drain the current queue at the current global
    /// rate. This is computed from queue depth and rate alone: it ignores
    /// the distribution of individual job durations and so under-estimates
    /// when job duration, not rate, is the bottleneck.
    pub drain_eta: Option<Duration>,
    pub queued: Vec<JobView>,
    pub running: Vec<JobView>,
    pub recent: Vec<JobView>,
    #[serde(skip)]
    pub agent_caps: Vec<AgentCapStats>,
    pub sessions: Vec<SessionProgress>,
}

impl Progress {
    /// Re-group `queued`, `running`, and `recent` by `session_name`,
    /// attaching an optional known pane count per session.
    pub fn group_by_session(&self, totals: &HashMap<String, u32>) -> Vec<SessionProgress> {
        let mut by_session: HashMap<String, Vec<JobView>> = HashMap::new();
        for view in self
            .queued
            .iter()
            .chain(self.running.iter())
            .chain(self.recent.iter())
        {
            by_session
                .entry(view.session_name.clone())
                .or_default()
                .push(view.clone());
        }
        by_session
            .into_iter()
            .map(|(session_name, jobs)| SessionProgress {
                total_panes: totals.get(&session_name).copied(),
                session_name,
                jobs,
            })
            .collect()
    }
}
