//! The work-item data model: [`SpawnJob`] and its identifying types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Instant;

/// Unique identifier for a [`SpawnJob`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a caller-supplied string as a job id verbatim.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A short free-form tag identifying a class of agent (e.g. `"cc"`, `"cod"`,
/// `"gmi"`). Opaque to the scheduler: it is only ever used as a
/// [`crate::agent_caps::AgentCaps`] lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentType(String);

impl AgentType {
    /// Wrap a string as an agent type tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Borrow the underlying tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What kind of operation a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Create a new terminal-multiplexer pane for an agent.
    SpawnPane,
    /// Start an agent process inside an existing pane.
    StartAgent,
    /// Restart a previously running agent.
    RestartAgent,
    /// Caller-defined operation; the scheduler treats it opaquely.
    Custom,
}

/// Dispatch priority. `Critical` jobs are always dequeued ahead of lower
/// tiers; jobs of equal priority are served FIFO.
///
/// ```
/// use fleet_scheduler::job::Priority;
/// assert!(Priority::Critical > Priority::High);
/// assert!(Priority::High > Priority::Normal);
/// assert!(Priority::Normal > Priority::Low);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Where a job currently sits in its lifecycle.
///
/// Valid transitions: `Queued -> Running`, `Running -> Completed`,
/// `Running -> Failed`, `Running -> Retrying -> Queued`, and
/// `Queued | Running -> Cancelled`. Every other transition is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status can never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnJob {
    pub id: JobId,
    pub kind: JobKind,
    pub agent_type: AgentType,
    pub session_name: String,
    pub pane_index: Option<u32>,
    pub priority: Priority,
    pub payload: serde_json::Value,

    pub status: JobStatus,
    pub retry_count: u32,
    /// `None` means "use the scheduler's configured
    /// [`crate::config::SchedulerConfig::default_max_retries`]"; resolved to
    /// a concrete value by [`crate::scheduler::Scheduler::enqueue`].
    pub max_retries: Option<u32>,

    #[serde(skip)]
    pub enqueued_at: Option<Instant>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
    /// Priority-queue tie-break position. Assigned once by
    /// [`crate::job_store::JobStore::insert`] and preserved across any
    /// requeue that is not itself a fresh scheduling attempt, so a job that
    /// loses a token-bucket or agent-cap race keeps its original place in
    /// line instead of being shoved behind jobs enqueued later.
    #[serde(skip)]
    pub(crate) queue_sequence: u64,
    pub error: Option<String>,
}

impl SpawnJob {
    /// Build a new, unqueued job in [`JobStatus::Queued`] with zero retries
    /// consumed so far. `max_retries` accepts either a bare `u32` or `None`;
    /// `None` defers to the scheduler's configured default at enqueue time.
    pub fn new(
        id: JobId,
        kind: JobKind,
        agent_type: AgentType,
        session_name: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
        max_retries: impl Into<Option<u32>>,
    ) -> Self {
        Self {
            id,
            kind,
            agent_type,
            session_name: session_name.into(),
            pane_index: None,
            priority,
            payload,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries: max_retries.into(),
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            queue_sequence: 0,
            error: None,
        }
    }
}
