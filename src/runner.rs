//! The capability the scheduler dispatches work through.
//!
//! The scheduler itself never spawns panes, starts processes, or touches a
//! terminal multiplexer — it only knows how to call [`Runner::execute`] and
//! interpret the [`RunnerOutcome`] it returns.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::SpawnJob;

/// Result of one [`Runner::execute`] call.
#[derive(Debug, Clone)]
pub enum RunnerOutcome {
    /// The job completed successfully.
    Ok,
    /// The job did not complete successfully.
    Failed {
        /// Human-readable description, surfaced on the job's terminal
        /// state and in [`crate::events::SchedulerEvent::Failed`].
        error: String,
        /// Whether the scheduler should retry this job (subject to
        /// `max_retries`) or fail it immediately.
        retryable: bool,
    },
}

/// The single external capability the scheduler depends on to actually do
/// work.
///
/// Implementations must be `Send + Sync`: the scheduler calls `execute`
/// concurrently from every worker task. `execute` must return promptly once
/// `cancel` fires — the scheduler relies on this for timely cancellation
/// and shutdown.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(&self, job: &SpawnJob, cancel: &CancellationToken) -> RunnerOutcome;
}
