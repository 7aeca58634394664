//! Read-only view of cluster capacity, queues and applications.

use std::fmt;

use serde::Serialize;

use common::{now_millis, Resource, Result};

use crate::config::CoordinatorConfig;
use crate::job::JobState;
use crate::retry::with_retry;
use crate::scheduler::{
    ApplicationId, ApplicationReport, FinalStatus, NodeReport, NodeState, QueueInfo,
    SharedScheduler,
};

/// Aggregate of every running node at one point in time.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterSnapshot {
    pub taken_at: u64,
    pub nodes: Vec<NodeReport>,
    pub capability: Resource,
    pub used: Resource,
}

impl ClusterSnapshot {
    /// Nodes that are not running are left out of the totals and the list.
    pub fn from_nodes(nodes: Vec<NodeReport>) -> Self {
        let nodes: Vec<NodeReport> = nodes
            .into_iter()
            .filter(|n| n.state == NodeState::Running)
            .collect();
        let capability = nodes
            .iter()
            .fold(Resource::default(), |acc, n| acc.saturating_add(&n.capability));
        let used = nodes
            .iter()
            .fold(Resource::default(), |acc, n| acc.saturating_add(&n.used));
        Self {
            taken_at: now_millis(),
            nodes,
            capability,
            used,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Utilization {
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub total_vcores: u32,
    pub used_vcores: u32,
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    used / total * 100.0
}

impl Utilization {
    pub fn memory_pct(&self) -> f64 {
        percent(self.used_memory_mb as f64, self.total_memory_mb as f64)
    }

    pub fn core_pct(&self) -> f64 {
        percent(self.used_vcores as f64, self.total_vcores as f64)
    }
}

impl fmt::Display for Utilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Memory: {}/{} MB ({:.2}%), Cores: {}/{} ({:.2}%)",
            self.used_memory_mb,
            self.total_memory_mb,
            self.memory_pct(),
            self.used_vcores,
            self.total_vcores,
            self.core_pct()
        )
    }
}

/// Node counts by state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClusterMetrics {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub decommissioned_nodes: usize,
    pub lost_nodes: usize,
    pub unhealthy_nodes: usize,
    pub rebooted_nodes: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplicationSummary {
    pub id: ApplicationId,
    pub name: String,
    pub queue: String,
    pub state: JobState,
    pub final_status: FinalStatus,
    pub progress: f32,
}

impl From<&ApplicationReport> for ApplicationSummary {
    fn from(report: &ApplicationReport) -> Self {
        Self {
            id: report.id,
            name: report.name.clone(),
            queue: report.queue.clone(),
            state: report.state.into(),
            final_status: report.final_status,
            progress: report.progress,
        }
    }
}

pub struct ResourceMonitor {
    scheduler: SharedScheduler,
    config: CoordinatorConfig,
}

impl ResourceMonitor {
    pub fn new(scheduler: SharedScheduler, config: CoordinatorConfig) -> Self {
        Self { scheduler, config }
    }

    async fn nodes(&self, states: &[NodeState]) -> Result<Vec<NodeReport>> {
        let scheduler = &self.scheduler;
        with_retry(
            "get_node_reports",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.get_node_reports(states),
        )
        .await
    }

    pub async fn cluster_snapshot(&self) -> Result<ClusterSnapshot> {
        Ok(ClusterSnapshot::from_nodes(
            self.nodes(&[NodeState::Running]).await?,
        ))
    }

    pub fn utilization(snapshot: &ClusterSnapshot) -> Utilization {
        Utilization {
            total_memory_mb: snapshot.capability.memory_mb,
            used_memory_mb: snapshot.used.memory_mb,
            total_vcores: snapshot.capability.vcores,
            used_vcores: snapshot.used.vcores,
        }
    }

    /// Applications in any of `states`, or all of them if `states` is empty.
    pub async fn applications(&self, states: &[JobState]) -> Result<Vec<ApplicationSummary>> {
        let scheduler = &self.scheduler;
        let reports = with_retry(
            "get_applications",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.get_applications(),
        )
        .await?;
        Ok(reports
            .iter()
            .map(ApplicationSummary::from)
            .filter(|a| states.is_empty() || states.contains(&a.state))
            .collect())
    }

    pub async fn queues(&self) -> Result<Vec<QueueInfo>> {
        let scheduler = &self.scheduler;
        with_retry(
            "get_queues",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.get_queues(),
        )
        .await
    }

    pub async fn cluster_metrics(&self) -> Result<ClusterMetrics> {
        let nodes = self.nodes(&[]).await?;
        let count = |state: NodeState| nodes.iter().filter(|n| n.state == state).count();
        Ok(ClusterMetrics {
            total_nodes: nodes.len(),
            active_nodes: count(NodeState::Running),
            decommissioned_nodes: count(NodeState::Decommissioned),
            lost_nodes: count(NodeState::Lost),
            unhealthy_nodes: count(NodeState::Unhealthy),
            rebooted_nodes: count(NodeState::Rebooted),
        })
    }
}
