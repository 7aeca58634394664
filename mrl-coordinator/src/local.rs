//! An in-process cluster: a handful of simulated nodes and queues, with every
//! admitted application driven through the engine's executor on this runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::storage::SharedStorage;
use common::{now_millis, Error, JobId, Resource, Result};
use mrl_engine::{ExecutionOutcome, Executor, JobPlan, Progress};

use crate::config::{LocalClusterConfig, NodeConfig, QueueConfig, SchedulerKind};
use crate::scheduler::{
    ApplicationId, ApplicationReport, ApplicationState, ClusterScheduler, FinalStatus, NodeReport,
    NodeState, QueueInfo, QueueState,
};

#[derive(Debug)]
struct Node {
    config: NodeConfig,
    used: Resource,
    containers: u32,
}

impl Node {
    fn available(&self) -> Resource {
        self.config.capability.saturating_sub(&self.used)
    }

    fn report(&self) -> NodeReport {
        let health_report = match self.config.state {
            NodeState::Running => String::new(),
            state => format!("node is {state:?}"),
        };
        NodeReport {
            id: self.config.id.clone(),
            state: self.config.state,
            capability: self.config.capability,
            used: self.used,
            containers: self.containers,
            health_report,
        }
    }
}

#[derive(Debug)]
struct Queue {
    config: QueueConfig,
    running_apps: usize,
    used: Resource,
}

struct Application {
    report: ApplicationReport,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

impl Application {
    /// Bring the report up to date with the live execution.
    fn refresh(&mut self) {
        if self.report.state.is_terminal() {
            return;
        }
        if self.report.state == ApplicationState::Accepted && self.progress.has_started() {
            self.report.state = ApplicationState::Running;
        }
        self.report.progress = self.progress.fraction();
        self.report.counters = self.progress.counters.snapshot();
    }
}

struct ClusterState {
    config: LocalClusterConfig,
    cluster_timestamp: u64,
    next_id: AtomicU32,
    nodes: Mutex<Vec<Node>>,
    queues: Mutex<Vec<Queue>>,
    apps: DashMap<ApplicationId, Application>,
    executor: Executor,
}

#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<ClusterState>,
}

impl LocalCluster {
    pub fn new(config: LocalClusterConfig, storage: SharedStorage) -> Self {
        let executor = Executor::new(storage, config.task_slots);
        let nodes = config
            .nodes
            .iter()
            .cloned()
            .map(|config| Node {
                config,
                used: Resource::default(),
                containers: 0,
            })
            .collect();
        let queues = config
            .queues
            .iter()
            .cloned()
            .map(|config| Queue {
                config,
                running_apps: 0,
                used: Resource::default(),
            })
            .collect();
        info!(
            "Starting local cluster with {} nodes, {:?} scheduler",
            config.nodes.len(),
            config.scheduler
        );
        Self {
            state: Arc::new(ClusterState {
                cluster_timestamp: now_millis(),
                next_id: AtomicU32::new(1),
                nodes: Mutex::new(nodes),
                queues: Mutex::new(queues),
                apps: DashMap::new(),
                executor,
                config,
            }),
        }
    }

    pub fn cluster_timestamp(&self) -> u64 {
        self.state.cluster_timestamp
    }

    /// Change a node's state, e.g. to take it out of service.
    pub async fn set_node_state(&self, id: &str, state: NodeState) -> Result<()> {
        let mut nodes = self.state.nodes.lock().await;
        let node = nodes
            .iter_mut()
            .find(|n| n.config.id == id)
            .ok_or_else(|| Error::SchedulerRejected(format!("unknown node `{id}`")))?;
        info!("Node {id}: {:?} -> {:?}", node.config.state, state);
        node.config.state = state;
        Ok(())
    }

    /// Change a queue's state. Stopped queues admit nothing new.
    pub async fn set_queue_state(&self, name: &str, state: QueueState) -> Result<()> {
        let mut queues = self.state.queues.lock().await;
        let queue = queues
            .iter_mut()
            .find(|q| q.config.name == name)
            .ok_or_else(|| Error::SchedulerRejected(format!("unknown queue `{name}`")))?;
        queue.config.state = state;
        Ok(())
    }
}

/// Round a request up to the minimum allocation.
fn normalize(request: Resource, min: Resource) -> Resource {
    Resource::new(
        request.memory_mb.max(min.memory_mb),
        request.vcores.max(min.vcores),
    )
}

fn place(kind: SchedulerKind, nodes: &[Node], request: &Resource) -> Option<usize> {
    let fitting = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.config.state == NodeState::Running && request.fits_within(&n.available()));
    match kind {
        SchedulerKind::Capacity => fitting.map(|(i, _)| i).next(),
        SchedulerKind::Fair => fitting
            .max_by_key(|(i, n)| (n.available().memory_mb, std::cmp::Reverse(*i)))
            .map(|(i, _)| i),
    }
}

impl ClusterState {
    fn update(&self, app: ApplicationId, f: impl FnOnce(&mut Application)) {
        if let Some(mut entry) = self.apps.get_mut(&app) {
            f(entry.value_mut());
        }
    }

    /// Wait for room on a node for the coordinating container. `None` if the
    /// application was killed while waiting.
    async fn allocate(
        &self,
        app: ApplicationId,
        request: Resource,
        cancel: &CancellationToken,
    ) -> Option<usize> {
        loop {
            {
                let mut nodes = self.nodes.lock().await;
                if let Some(i) = place(self.config.scheduler, &nodes, &request) {
                    let node = &mut nodes[i];
                    node.used = node.used.saturating_add(&request);
                    node.containers += 1;
                    debug!("{app}: container {request} on {}", node.config.id);
                    return Some(i);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = time::sleep(self.config.placement_interval) => {}
            }
        }
    }

    async fn release(&self, node: Option<usize>, queue: &str, request: Resource) {
        if let Some(i) = node {
            let mut nodes = self.nodes.lock().await;
            if let Some(node) = nodes.get_mut(i) {
                node.used = node.used.saturating_sub(&request);
                node.containers = node.containers.saturating_sub(1);
            }
        }
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.iter_mut().find(|q| q.config.name == queue) {
            q.running_apps = q.running_apps.saturating_sub(1);
            q.used = q.used.saturating_sub(&request);
        }
    }

    /// Everything that happens to an application after admission.
    async fn drive(
        self: Arc<Self>,
        app: ApplicationId,
        job: JobId,
        plan: Arc<JobPlan>,
        request: Resource,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) {
        let node = self.allocate(app, request, &cancel).await;
        let (outcome, failed_groups) = match node {
            None => (ExecutionOutcome::Cancelled, vec![]),
            Some(i) => {
                let node_id = self.nodes.lock().await[i].config.id.clone();
                self.update(app, |a| {
                    a.report.state = ApplicationState::Accepted;
                    a.report.am_node = Some(node_id);
                    a.report.allocated = request;
                });
                let report = self
                    .executor
                    .execute(job, plan.clone(), progress.clone(), cancel.clone())
                    .await;
                (report.outcome, report.failed_groups)
            }
        };
        self.release(node, plan.queue(), request).await;

        let (state, final_status, diagnostics) = match outcome {
            ExecutionOutcome::Succeeded if failed_groups.is_empty() => {
                (ApplicationState::Finished, FinalStatus::Succeeded, String::new())
            }
            ExecutionOutcome::Succeeded => (
                ApplicationState::Finished,
                FinalStatus::Succeeded,
                format!(
                    "reduce groups {failed_groups:?} failed, within tolerance {}",
                    plan.failure_tolerance()
                ),
            ),
            ExecutionOutcome::Failed(reason) => {
                (ApplicationState::Failed, FinalStatus::Failed, reason)
            }
            ExecutionOutcome::Cancelled => (
                ApplicationState::Killed,
                FinalStatus::Killed,
                "Application killed by user.".to_string(),
            ),
        };
        info!("{app} ({job}) {state} with final status {final_status}");
        self.update(app, |a| {
            if final_status == FinalStatus::Succeeded {
                a.report.progress = 1.0;
            } else {
                a.report.progress = a.progress.fraction();
            }
            a.report.counters = a.progress.counters.snapshot();
            a.report.state = state;
            a.report.final_status = final_status;
            a.report.diagnostics = diagnostics;
            a.report.finish_time = Some(now_millis());
        });
        self.evict_completed();
    }

    /// Forget the oldest finished applications beyond the retention limit.
    fn evict_completed(&self) {
        let mut completed: Vec<(u64, ApplicationId)> = self
            .apps
            .iter()
            .filter(|a| a.report.state.is_terminal())
            .map(|a| (a.report.finish_time.unwrap_or_default(), *a.key()))
            .collect();
        let Some(excess) = completed.len().checked_sub(self.config.max_completed_apps) else {
            return;
        };
        completed.sort_unstable();
        for (_, app) in completed.into_iter().take(excess) {
            debug!("Forgetting completed {app}");
            self.apps.remove(&app);
        }
    }
}

#[async_trait]
impl ClusterScheduler for LocalCluster {
    async fn submit_application(&self, job: JobId, plan: Arc<JobPlan>) -> Result<ApplicationId> {
        let state = &self.state;
        let max = state.config.max_allocation;
        if !plan.resources().fits_within(&max) {
            return Err(Error::SchedulerRejected(format!(
                "requested resource {} exceeds the maximum allocation {max}",
                plan.resources()
            )));
        }
        let request = normalize(plan.resources(), state.config.min_allocation);

        {
            let mut queues = state.queues.lock().await;
            let queue = queues
                .iter_mut()
                .find(|q| q.config.name == plan.queue())
                .ok_or_else(|| {
                    Error::SchedulerRejected(format!("unknown queue `{}`", plan.queue()))
                })?;
            if queue.config.state == QueueState::Stopped {
                return Err(Error::SchedulerRejected(format!(
                    "queue `{}` is stopped",
                    plan.queue()
                )));
            }
            if queue.running_apps >= queue.config.max_running_apps {
                return Err(Error::SchedulerRejected(format!(
                    "queue `{}` already has {} applications running",
                    plan.queue(),
                    queue.running_apps
                )));
            }
            queue.running_apps += 1;
            queue.used = queue.used.saturating_add(&request);
        }

        let app = ApplicationId {
            cluster_timestamp: state.cluster_timestamp,
            id: state.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let progress = Arc::new(Progress::new());
        let cancel = CancellationToken::new();
        state.apps.insert(
            app,
            Application {
                report: ApplicationReport {
                    id: app,
                    name: plan.name().to_string(),
                    queue: plan.queue().to_string(),
                    state: ApplicationState::Submitted,
                    final_status: FinalStatus::Undefined,
                    progress: 0.0,
                    diagnostics: String::new(),
                    counters: Default::default(),
                    start_time: now_millis(),
                    finish_time: None,
                    am_node: None,
                    allocated: Resource::default(),
                },
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(
            "Submitted {app} for {job} to queue `{}` with priority {}",
            plan.queue(),
            plan.priority()
        );

        tokio::spawn(state.clone().drive(app, job, plan, request, progress, cancel));
        Ok(app)
    }

    async fn get_application_report(&self, app: ApplicationId) -> Result<ApplicationReport> {
        let mut entry = self
            .state
            .apps
            .get_mut(&app)
            .ok_or_else(|| Error::UnknownApplication(app.to_string()))?;
        entry.refresh();
        Ok(entry.report.clone())
    }

    async fn kill_application(&self, app: ApplicationId) -> Result<()> {
        let entry = self
            .state
            .apps
            .get(&app)
            .ok_or_else(|| Error::UnknownApplication(app.to_string()))?;
        if entry.report.state.is_terminal() {
            debug!("{app} already {}, nothing to kill", entry.report.state);
            return Ok(());
        }
        info!("Killing {app}");
        entry.cancel.cancel();
        Ok(())
    }

    async fn get_node_reports(&self, states: &[NodeState]) -> Result<Vec<NodeReport>> {
        let nodes = self.state.nodes.lock().await;
        Ok(nodes
            .iter()
            .filter(|n| states.is_empty() || states.contains(&n.config.state))
            .map(Node::report)
            .collect())
    }

    async fn get_queues(&self) -> Result<Vec<QueueInfo>> {
        let total_memory: u64 = {
            let nodes = self.state.nodes.lock().await;
            nodes
                .iter()
                .filter(|n| n.config.state == NodeState::Running)
                .map(|n| n.config.capability.memory_mb)
                .sum()
        };
        let queues = self.state.queues.lock().await;
        Ok(queues
            .iter()
            .map(|q| {
                let guaranteed = total_memory as f32 * q.config.capacity / 100.0;
                let current_capacity = if guaranteed > 0.0 {
                    q.used.memory_mb as f32 / guaranteed * 100.0
                } else {
                    0.0
                };
                QueueInfo {
                    name: q.config.name.clone(),
                    capacity: q.config.capacity,
                    max_capacity: q.config.max_capacity,
                    current_capacity,
                    state: q.config.state,
                    running_apps: q.running_apps,
                    max_running_apps: q.config.max_running_apps,
                }
            })
            .collect())
    }

    async fn get_applications(&self) -> Result<Vec<ApplicationReport>> {
        let mut reports: Vec<ApplicationReport> = self
            .state
            .apps
            .iter_mut()
            .map(|mut entry| {
                entry.refresh();
                entry.report.clone()
            })
            .collect();
        reports.sort_by_key(|r| r.id);
        Ok(reports)
    }
}

impl Drop for ClusterState {
    fn drop(&mut self) {
        let live = self
            .apps
            .iter()
            .filter(|a| !a.report.state.is_terminal())
            .count();
        if live > 0 {
            warn!("Local cluster shutting down with {live} live applications");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(free: &[u64]) -> Vec<Node> {
        free.iter()
            .enumerate()
            .map(|(i, mb)| Node {
                config: NodeConfig::running(format!("n{i}"), Resource::new(*mb, 4)),
                used: Resource::default(),
                containers: 0,
            })
            .collect()
    }

    #[test]
    fn capacity_takes_first_fit() {
        let nodes = nodes(&[512, 2048, 4096]);
        let request = Resource::new(1024, 1);
        assert_eq!(place(SchedulerKind::Capacity, &nodes, &request), Some(1));
    }

    #[test]
    fn fair_takes_most_free_memory() {
        let nodes = nodes(&[512, 2048, 4096]);
        let request = Resource::new(1024, 1);
        assert_eq!(place(SchedulerKind::Fair, &nodes, &request), Some(2));
    }

    #[test]
    fn unhealthy_nodes_are_skipped() {
        let mut nodes = nodes(&[4096]);
        nodes[0].config.state = NodeState::Unhealthy;
        assert_eq!(
            place(SchedulerKind::Capacity, &nodes, &Resource::new(1024, 1)),
            None
        );
    }

    #[test]
    fn requests_round_up_to_minimum() {
        let min = Resource::new(1024, 1);
        assert_eq!(normalize(Resource::new(100, 0), min), min);
        assert_eq!(
            normalize(Resource::new(2048, 2), min),
            Resource::new(2048, 2)
        );
    }
}
