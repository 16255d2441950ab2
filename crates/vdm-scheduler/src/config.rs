//! Scheduler and resource configuration

use crate::error::{SchedulerError, SchedulerResult};
use crate::resource::Policy;
use serde::{Deserialize, Serialize};
use vdm_primitives::{Priority, ResourceId, Time};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seed of the jitter PRNG
    pub seed: u64,
    /// Maximum outstanding activations of one periodic operation (0 = unlimited)
    pub max_periodic_overlaps: usize,
    /// Maximum call nesting
    pub max_call_depth: usize,
    /// Priority of operations that declare none
    pub default_priority: Priority,
    /// Stop before the clock would pass this time
    pub time_limit: Option<Time>,
    /// Record the execution-event log
    pub trace: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_periodic_overlaps: 10,
            max_call_depth: 512,
            default_priority: 1,
            time_limit: None,
            trace: true,
        }
    }
}

impl SchedulerConfig {
    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the overlap limit
    pub fn with_max_periodic_overlaps(mut self, max: usize) -> Self {
        self.max_periodic_overlaps = max;
        self
    }

    /// Set the call depth limit
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }

    /// Set the time limit
    pub fn with_time_limit(mut self, limit: Time) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_call_depth == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_call_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_speed() -> u64 {
    1
}

/// CPU declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Unique name
    pub name: String,
    /// Scheduling discipline
    #[serde(default)]
    pub policy: Policy,
    /// Cycles executed per time unit
    #[serde(default = "default_speed")]
    pub speed: u64,
}

impl CpuConfig {
    /// Fixed-priority CPU running one cycle per time unit
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: Policy::default(),
            speed: default_speed(),
        }
    }

    /// Set the policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the speed
    pub fn with_speed(mut self, speed: u64) -> Self {
        self.speed = speed;
        self
    }

    /// Validate
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.speed == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "cpu {} has zero speed",
                self.name
            )));
        }
        Ok(())
    }
}

/// Bus declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Unique name
    pub name: String,
    /// Connected CPUs
    pub cpus: Vec<ResourceId>,
    /// Fixed transit latency
    #[serde(default)]
    pub latency: Time,
    /// Value units transferred per time unit (0 = unbounded)
    #[serde(default)]
    pub speed: u64,
}

impl BusConfig {
    /// Zero-latency, unbounded bus between `cpus`
    pub fn new(name: impl Into<String>, cpus: Vec<ResourceId>) -> Self {
        Self {
            name: name.into(),
            cpus,
            latency: 0,
            speed: 0,
        }
    }

    /// Set the latency
    pub fn with_latency(mut self, latency: Time) -> Self {
        self.latency = latency;
        self
    }

    /// Set the speed
    pub fn with_speed(mut self, speed: u64) -> Self {
        self.speed = speed;
        self
    }

    /// Validate
    pub fn validate(&self) -> SchedulerResult<()> {
        let mut cpus = self.cpus.clone();
        cpus.sort();
        cpus.dedup();
        if cpus.len() < 2 {
            return Err(SchedulerError::InvalidConfig(format!(
                "bus {} must connect at least two CPUs",
                self.name
            )));
        }
        Ok(())
    }
}
