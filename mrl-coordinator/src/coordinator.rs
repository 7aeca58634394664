//! Submits plans to the cluster scheduler and tracks them until they end.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::storage::SharedStorage;
use common::{now_millis, Error, JobId, Result};
use mrl_engine::JobPlan;

use crate::config::CoordinatorConfig;
use crate::job::{JobExecution, JobState};
use crate::retry::with_retry;
use crate::scheduler::SharedScheduler;

/// How a wait for completion ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalState {
    Finished,
    Failed,
    Killed,

    /// The caller's timeout ran out first. The job keeps going.
    TimedOut,

    /// The caller's cancellation token fired first. The job keeps going.
    Cancelled,
}

impl TerminalState {
    fn of(state: JobState) -> Option<Self> {
        match state {
            JobState::Finished => Some(TerminalState::Finished),
            JobState::Failed => Some(TerminalState::Failed),
            JobState::Killed => Some(TerminalState::Killed),
            _ => None,
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::Finished => "FINISHED",
            TerminalState::Failed => "FAILED",
            TerminalState::Killed => "KILLED",
            TerminalState::TimedOut => "TIMED_OUT",
            TerminalState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

pub struct JobCoordinator {
    scheduler: SharedScheduler,
    storage: SharedStorage,
    config: CoordinatorConfig,
    cluster_timestamp: u64,
    next_sequence: AtomicU32,
    jobs: DashMap<JobId, JobExecution>,
}

impl JobCoordinator {
    pub fn new(scheduler: SharedScheduler, storage: SharedStorage, config: CoordinatorConfig) -> Self {
        Self {
            scheduler,
            storage,
            config,
            cluster_timestamp: now_millis(),
            next_sequence: AtomicU32::new(1),
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Validate `plan`, prepare its output directory and hand it to the
    /// scheduler.
    pub async fn submit(&self, plan: JobPlan) -> Result<JobExecution> {
        plan.validate(&self.config.max_allocation)?;

        if !self.storage.exists(plan.input()).await.map_err(Error::Storage)? {
            return Err(Error::InvalidPlan(format!(
                "input path `{}` does not exist",
                plan.input()
            )));
        }
        if self.storage.exists(plan.output()).await.map_err(Error::Storage)? {
            if !plan.overwrite_output() {
                return Err(Error::InvalidPlan(format!(
                    "output directory `{}` already exists",
                    plan.output()
                )));
            }
            info!("Deleting existing output directory `{}`", plan.output());
            self.storage
                .delete(plan.output(), true)
                .await
                .map_err(Error::Storage)?;
        }

        let id = JobId::new(
            self.cluster_timestamp,
            self.next_sequence.fetch_add(1, Ordering::SeqCst),
        );
        let plan = Arc::new(plan);
        let scheduler = &self.scheduler;
        let app = with_retry(
            "submit_application",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.submit_application(id, plan.clone()),
        )
        .await?;

        info!(
            "Submitted {id} as {app}: {} over `{}` -> `{}`, {} partitions, {} reduce groups, combiner {}",
            plan.workload(),
            plan.input(),
            plan.output(),
            plan.partition_count(),
            plan.reduce_groups(),
            if plan.combiner_enabled() { "on" } else { "off" },
        );
        let execution = JobExecution::new(id, app, plan);
        self.jobs.insert(id, execution.clone());
        Ok(execution)
    }

    /// Ask the scheduler where the job is and merge the answer into the
    /// coordinator's record. Returns the merged snapshot.
    pub async fn poll(&self, execution: &JobExecution) -> Result<JobExecution> {
        let current = self.execution(execution.id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let scheduler = &self.scheduler;
        let report = with_retry(
            "get_application_report",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.get_application_report(current.application),
        )
        .await?;

        let mut entry = self
            .jobs
            .get_mut(&execution.id)
            .ok_or(Error::UnknownJob(execution.id))?;
        entry.merge(&report);
        Ok(entry.clone())
    }

    /// Poll every `poll_interval` until the job ends, `timeout` runs out or
    /// `cancel` fires. Neither of the latter two touches the job.
    pub async fn await_completion(
        &self,
        execution: &JobExecution,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TerminalState> {
        if timeout.is_zero() {
            return Ok(TerminalState::TimedOut);
        }
        let deadline = Instant::now() + timeout;

        loop {
            let snapshot = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TerminalState::Cancelled),
                _ = time::sleep_until(deadline) => return Ok(TerminalState::TimedOut),
                snapshot = self.poll(execution) => snapshot?,
            };
            if let Some(state) = TerminalState::of(snapshot.state) {
                return Ok(state);
            }
            debug!(
                "{} is {} at {:.0}%",
                snapshot.id,
                snapshot.state,
                snapshot.progress * 100.0
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TerminalState::Cancelled),
                _ = time::sleep_until(deadline) => return Ok(TerminalState::TimedOut),
                _ = time::sleep(poll_interval) => {}
            }
        }
    }

    /// Ask the scheduler to stop the job. A job that has already ended is
    /// left alone. Output written so far stays where it is.
    pub async fn kill(&self, execution: &JobExecution) -> Result<JobExecution> {
        let current = self.execution(execution.id)?;
        if current.is_terminal() {
            debug!("{} is already {}, not killing", current.id, current.state);
            return Ok(current);
        }

        let scheduler = &self.scheduler;
        if let Err(e) = with_retry(
            "kill_application",
            &self.config.retry,
            self.config.rpc_timeout,
            || scheduler.kill_application(current.application),
        )
        .await
        {
            warn!("Failed to kill {} ({}): {e}", current.id, current.application);
        }

        match self.poll(execution).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!("Failed to refresh {} after kill: {e}", current.id);
                self.execution(execution.id)
            }
        }
    }

    /// Remove whatever a job left in its output directory, intermediate
    /// data included. Never done implicitly.
    pub async fn cleanup_output(&self, plan: &JobPlan) -> Result<bool> {
        let deleted = self
            .storage
            .delete(plan.output(), true)
            .await
            .map_err(Error::Storage)?;
        if deleted {
            info!("Removed output `{}`", plan.output());
        } else {
            debug!("Nothing to remove at `{}`", plan.output());
        }
        Ok(deleted)
    }

    pub fn execution(&self, id: JobId) -> Result<JobExecution> {
        self.jobs
            .get(&id)
            .map(|e| e.clone())
            .ok_or(Error::UnknownJob(id))
    }

    /// Every tracked job, oldest first.
    pub fn executions(&self) -> Vec<JobExecution> {
        let mut all: Vec<JobExecution> = self.jobs.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|e| e.id);
        all
    }

    /// Stop tracking a job that has ended, handing back its final record.
    pub fn archive(&self, id: JobId) -> Option<JobExecution> {
        self.jobs
            .remove_if(&id, |_, e| e.is_terminal())
            .map(|(_, e)| e)
    }
}
