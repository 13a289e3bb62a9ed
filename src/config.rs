//! Typed configuration. This crate never reads a config file or the
//! environment itself — that belongs to the caller's own CLI/config-file
//! layer, which is outside this library's scope. These structs exist so a
//! caller *can* deserialize one from whatever format they use.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::AgentType;

/// Per-agent-type override of the default concurrency cap behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeOverride {
    pub initial: u32,
    pub max_cap: u32,
    /// Whether this type ramps from `initial` toward `max_cap` over time, or
    /// starts (and stays) at `max_cap`.
    pub rampup_enabled: bool,
    pub ramp_rate: f64,
    /// Whether a failed job of this type triggers a cooldown reduction.
    pub cooldown_enabled: bool,
    pub cooldown_reduction: u32,
    pub cooldown_duration_secs: u64,
}

impl From<&AgentTypeOverride> for crate::agent_caps::AgentTypeConfig {
    fn from(o: &AgentTypeOverride) -> Self {
        Self {
            initial: o.initial,
            max_cap: o.max_cap,
            rampup_enabled: o.rampup_enabled,
            ramp_rate: o.ramp_rate,
            cooldown_enabled: o.cooldown_enabled,
            cooldown_reduction: o.cooldown_reduction,
            cooldown_duration: Duration::from_secs(o.cooldown_duration_secs),
        }
    }
}

/// Concurrency-cap configuration across all agent types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapsConfig {
    pub default_initial: u32,
    pub default_max_cap: u32,
    pub default_rampup_enabled: bool,
    pub default_ramp_rate: f64,
    pub default_cooldown_enabled: bool,
    pub default_cooldown_reduction: u32,
    pub default_cooldown_duration_secs: u64,
    pub global_max: Option<u32>,
    pub tick_interval: Duration,
    pub overrides: HashMap<AgentType, AgentTypeOverride>,
}

impl Default for AgentCapsConfig {
    fn default() -> Self {
        Self {
            default_initial: 2,
            default_max_cap: 8,
            default_rampup_enabled: true,
            default_ramp_rate: 0.5,
            default_cooldown_enabled: true,
            default_cooldown_reduction: 2,
            default_cooldown_duration_secs: 60,
            global_max: None,
            tick_interval: Duration::from_secs(1),
            overrides: HashMap::new(),
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent worker tasks.
    pub workers: usize,
    /// Maximum number of jobs the queue will hold before `enqueue` returns
    /// [`crate::error::SchedulerError::QueueFull`].
    pub queue_capacity: usize,
    /// Global token bucket refill rate, tokens per second.
    pub global_rate: f64,
    /// Global token bucket burst capacity.
    pub global_capacity: f64,
    /// Retries granted to a job that does not specify its own.
    pub default_max_retries: u32,
    /// Base delay for the first retry.
    pub retry_backoff_base: Duration,
    /// Maximum delay any retry will wait, regardless of attempt count.
    pub retry_backoff_cap: Duration,
    /// Fractional jitter applied to each computed backoff, e.g. `0.2` for
    /// ±20%.
    pub retry_backoff_jitter: f64,
    /// Number of terminal jobs retained for progress reporting.
    pub recent_capacity: usize,
    pub agent_caps: AgentCapsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            global_rate: 5.0,
            global_capacity: 10.0,
            default_max_retries: 3,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(60),
            retry_backoff_jitter: 0.2,
            recent_capacity: crate::job_store::DEFAULT_RECENT_CAPACITY,
            agent_caps: AgentCapsConfig::default(),
        }
    }
}
