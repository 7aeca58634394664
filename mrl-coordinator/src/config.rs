use std::time::Duration;

use clap::ValueEnum;
use rand::Rng;
use serde::Serialize;

use common::Resource;

use crate::scheduler::{NodeState, QueueState};

/// Placement strategy for the coordinating container of an application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
pub enum SchedulerKind {
    /// First node with enough free resources.
    #[default]
    Capacity,
    /// Node with the most free memory.
    Fair,
}

/// Bounded exponential backoff for scheduler calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): doubles each time, capped,
    /// plus up to 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        base + base.mul_f64(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Largest per-task request a plan may carry.
    pub max_allocation: Resource,

    /// Interval `await_completion` uses when the caller has no preference.
    pub poll_interval: Duration,

    /// Bound on every single scheduler call.
    pub rpc_timeout: Duration,

    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_allocation: Resource::new(8192, 8),
            poll_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub capability: Resource,
    pub state: NodeState,
}

impl NodeConfig {
    pub fn running(id: impl Into<String>, capability: Resource) -> Self {
        Self {
            id: id.into(),
            capability,
            state: NodeState::Running,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub capacity: f32,
    pub max_capacity: f32,
    pub max_running_apps: usize,
    pub state: QueueState,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, capacity: f32) -> Self {
        Self {
            name: name.into(),
            capacity,
            max_capacity: 100.0,
            max_running_apps: 16,
            state: QueueState::Running,
        }
    }
}

/// Shape of an in-process cluster.
#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    pub scheduler: SchedulerKind,
    pub nodes: Vec<NodeConfig>,
    pub queues: Vec<QueueConfig>,

    /// Requests are rounded up to this.
    pub min_allocation: Resource,

    /// Requests above this are rejected.
    pub max_allocation: Resource,

    /// Map and reduce tasks that may run at once across every application.
    pub task_slots: usize,

    /// How often an application waiting for a container looks again.
    pub placement_interval: Duration,

    /// Finished applications kept for reporting. Older ones are forgotten.
    pub max_completed_apps: usize,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Capacity,
            nodes: vec![
                NodeConfig::running("node-1:8041", Resource::new(8192, 8)),
                NodeConfig::running("node-2:8041", Resource::new(8192, 8)),
            ],
            queues: vec![QueueConfig::new("default", 100.0)],
            min_allocation: Resource::new(1024, 1),
            max_allocation: Resource::new(8192, 8),
            task_slots: 8,
            placement_interval: Duration::from_millis(50),
            max_completed_apps: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));
        let third = policy.backoff(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(480));
        let late = policy.backoff(30);
        assert!(late >= Duration::from_secs(1) && late <= Duration::from_millis(1200));
    }

    #[test]
    fn default_cluster_has_a_running_default_queue() {
        let config = LocalClusterConfig::default();
        assert_eq!(config.scheduler, SchedulerKind::Capacity);
        assert_eq!(config.queues[0].name, "default");
        assert_eq!(config.queues[0].state, QueueState::Running);
        assert!(config
            .nodes
            .iter()
            .all(|n| n.state == NodeState::Running));
        assert!(config.min_allocation.fits_within(&config.max_allocation));
    }
}
