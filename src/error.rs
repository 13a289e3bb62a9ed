//! Error taxonomy for the scheduler's public API.
//!
//! Runner failures are deliberately not represented here: a job that fails
//! inside [`crate::runner::Runner::execute`] is not a fault of the
//! scheduler itself, and is surfaced through [`crate::events::SchedulerEvent`]
//! and the job's terminal status, not through `Result`.

use crate::job::JobId;
use thiserror::Error;

/// Errors returned by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A [`crate::config::SchedulerConfig`] or
    /// [`crate::config::AgentCapsConfig`] value failed validation at
    /// construction time.
    #[error("invalid configuration for `{field}`: {reason}")]
    ConfigurationInvalid {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason the value was rejected.
        reason: String,
    },

    /// The queue already holds `queue_capacity` jobs.
    #[error("queue is at capacity")]
    QueueFull,

    /// A job with this id is already known to the scheduler.
    #[error("job `{0}` already exists")]
    DuplicateId(JobId),

    /// No job with this id is known to the scheduler.
    #[error("job `{0}` not found")]
    NotFound(JobId),

    /// The requested operation does not apply to a job that has already
    /// reached a terminal status.
    #[error("job `{0}` is already in a terminal state")]
    AlreadyTerminal(JobId),

    /// [`crate::scheduler::SchedulerHandle::stop`] did not observe all
    /// workers exit within the requested grace period.
    #[error("shutdown did not complete within the grace period")]
    ShutdownTimeout,
}

/// Convenience alias used throughout the crate's public functions.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
