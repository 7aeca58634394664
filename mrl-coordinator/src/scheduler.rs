//! The cluster scheduler collaborator: where applications are admitted,
//! placed on nodes and reported on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use common::{JobId, Resource, Result};
use mrl_engine::JobPlan;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ApplicationId {
    pub cluster_timestamp: u64,
    pub id: u32,
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_timestamp, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ApplicationState {
    New,
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationState::Finished | ApplicationState::Failed | ApplicationState::Killed
        )
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationState::New => "NEW",
            ApplicationState::Submitted => "SUBMITTED",
            ApplicationState::Accepted => "ACCEPTED",
            ApplicationState::Running => "RUNNING",
            ApplicationState::Finished => "FINISHED",
            ApplicationState::Failed => "FAILED",
            ApplicationState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// What the application itself said about how it ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FinalStatus {
    #[default]
    Undefined,
    Succeeded,
    Failed,
    Killed,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalStatus::Undefined => "UNDEFINED",
            FinalStatus::Succeeded => "SUCCEEDED",
            FinalStatus::Failed => "FAILED",
            FinalStatus::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ApplicationReport {
    pub id: ApplicationId,
    pub name: String,
    pub queue: String,
    pub state: ApplicationState,
    pub final_status: FinalStatus,

    /// In `[0, 1]`. Not guaranteed to be monotonic across reports.
    pub progress: f32,

    pub diagnostics: String,
    pub counters: BTreeMap<String, u64>,
    pub start_time: u64,
    pub finish_time: Option<u64>,

    /// Node hosting the coordinating container, once there is one.
    pub am_node: Option<String>,
    pub allocated: Resource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum NodeState {
    New,
    Running,
    Unhealthy,
    Decommissioned,
    Lost,
    Rebooted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeReport {
    pub id: String,
    pub state: NodeState,
    pub capability: Resource,
    pub used: Resource,
    pub containers: u32,
    pub health_report: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum QueueState {
    Running,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueInfo {
    pub name: String,

    /// Guaranteed share of the cluster, in percent.
    pub capacity: f32,

    /// Share the queue may grow to, in percent.
    pub max_capacity: f32,

    /// Used share of the guaranteed capacity, in percent.
    pub current_capacity: f32,

    pub state: QueueState,
    pub running_apps: usize,
    pub max_running_apps: usize,
}

#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    /// Admit a job. Rejections surface as [`common::Error::SchedulerRejected`].
    async fn submit_application(&self, job: JobId, plan: Arc<JobPlan>) -> Result<ApplicationId>;

    async fn get_application_report(&self, app: ApplicationId) -> Result<ApplicationReport>;

    /// Best effort. Killing a finished application is not an error.
    async fn kill_application(&self, app: ApplicationId) -> Result<()>;

    /// Nodes in any of `states`, or every node if `states` is empty.
    async fn get_node_reports(&self, states: &[NodeState]) -> Result<Vec<NodeReport>>;

    async fn get_queues(&self) -> Result<Vec<QueueInfo>>;

    async fn get_applications(&self) -> Result<Vec<ApplicationReport>>;
}

pub type SharedScheduler = Arc<dyn ClusterScheduler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_display() {
        let id = ApplicationId {
            cluster_timestamp: 1700000000000,
            id: 12,
        };
        assert_eq!(id.to_string(), "application_1700000000000_0012");
    }

    #[test]
    fn terminal_states() {
        assert!(ApplicationState::Killed.is_terminal());
        assert!(!ApplicationState::Accepted.is_terminal());
    }
}
