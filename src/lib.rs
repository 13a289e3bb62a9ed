//! A priority-queued, rate-shaped, concurrency-capped dispatcher for fleets
//! of long-running agent processes.
//!
//! The scheduler depends on exactly two external capabilities the caller
//! supplies: a [`runner::Runner`] that knows how to actually execute a job
//! (spawning a pane, starting or restarting an agent process — the
//! mechanics are entirely up to the implementation), and a
//! [`clock::Clock`] for monotonic time and cancellable sleep. Everything
//! else — priority ordering, global rate limiting, per-agent-type
//! concurrency caps with ramp-up and cooldown, retry with backoff,
//! cancellation, pause/resume, and progress/event reporting — lives here.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleet_scheduler::clock::SystemClock;
//! use fleet_scheduler::config::SchedulerConfig;
//! use fleet_scheduler::job::{AgentType, JobKind, JobId, Priority, SpawnJob};
//! use fleet_scheduler::runner::{Runner, RunnerOutcome};
//! use fleet_scheduler::scheduler::Scheduler;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! struct EchoRunner;
//! #[async_trait]
//! impl Runner for EchoRunner {
//!     async fn execute(&self, _job: &SpawnJob, _cancel: &CancellationToken) -> RunnerOutcome {
//!         RunnerOutcome::Ok
//!     }
//! }
//!
//! # async fn run() {
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(SystemClock::new()),
//!     Arc::new(EchoRunner),
//! ).unwrap();
//!
//! scheduler.enqueue(SpawnJob::new(
//!     JobId::new(),
//!     JobKind::StartAgent,
//!     AgentType::new("cc"),
//!     "main",
//!     Priority::Normal,
//!     serde_json::Value::Null,
//!     3,
//! )).unwrap();
//!
//! let handle = scheduler.start();
//! // ... later ...
//! handle.stop(std::time::Duration::from_secs(5)).await.unwrap();
//! # }
//! ```

pub mod agent_caps;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod job_store;
pub mod priority_queue;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod token_bucket;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerHandle};
