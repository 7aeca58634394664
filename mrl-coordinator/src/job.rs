//! The coordinator's record of one submitted job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use common::{now_millis, JobId};
use mrl_engine::JobPlan;

use crate::scheduler::{ApplicationId, ApplicationReport, ApplicationState, FinalStatus};

/// `Submitted -> Accepted -> Running -> Finished | Failed | Killed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Killed)
    }

    /// Position in the lifecycle. Every terminal state shares the last rank.
    fn rank(&self) -> u8 {
        match self {
            JobState::Submitted => 0,
            JobState::Accepted => 1,
            JobState::Running => 2,
            JobState::Finished | JobState::Failed | JobState::Killed => 3,
        }
    }
}

impl From<ApplicationState> for JobState {
    fn from(state: ApplicationState) -> Self {
        match state {
            ApplicationState::New | ApplicationState::Submitted => JobState::Submitted,
            ApplicationState::Accepted => JobState::Accepted,
            ApplicationState::Running => JobState::Running,
            ApplicationState::Finished => JobState::Finished,
            ApplicationState::Failed => JobState::Failed,
            ApplicationState::Killed => JobState::Killed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Accepted => "ACCEPTED",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobExecution {
    pub id: JobId,
    pub application: ApplicationId,
    pub name: String,
    pub queue: String,
    pub state: JobState,
    pub final_status: FinalStatus,

    /// Never decreases.
    pub progress: f32,

    pub diagnostics: String,
    pub counters: BTreeMap<String, u64>,
    pub start_time: u64,
    pub finish_time: Option<u64>,
    pub last_polled: Option<u64>,

    #[serde(skip_serializing)]
    pub plan: Arc<JobPlan>,
}

impl JobExecution {
    pub fn new(id: JobId, application: ApplicationId, plan: Arc<JobPlan>) -> Self {
        Self {
            id,
            application,
            name: plan.name().to_string(),
            queue: plan.queue().to_string(),
            state: JobState::Submitted,
            final_status: FinalStatus::Undefined,
            progress: 0.0,
            diagnostics: String::new(),
            counters: BTreeMap::new(),
            start_time: now_millis(),
            finish_time: None,
            last_polled: None,
            plan,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or_default()
    }

    /// Fold a scheduler report into this record.
    ///
    /// Applying the same report twice changes nothing. State only moves
    /// forward, progress never drops, and counters only grow; anything that
    /// would go backwards is logged and ignored.
    pub fn merge(&mut self, report: &ApplicationReport) {
        self.last_polled = Some(now_millis());
        if self.state.is_terminal() {
            return;
        }

        let reported = JobState::from(report.state);
        if reported.rank() < self.state.rank() {
            warn!(
                "{}: scheduler reported {} after {}, ignoring",
                self.id, reported, self.state
            );
        } else if reported != self.state {
            info!("{} ({}): {} -> {}", self.id, self.application, self.state, reported);
            self.state = reported;
        }

        let progress = report.progress.clamp(0.0, 1.0);
        if progress < self.progress {
            warn!(
                "{}: progress went from {:.2} to {:.2}, keeping {:.2}",
                self.id, self.progress, progress, self.progress
            );
        } else {
            self.progress = progress;
        }

        if !report.diagnostics.is_empty() {
            self.diagnostics = report.diagnostics.clone();
        }

        for (name, value) in &report.counters {
            let entry = self.counters.entry(name.clone()).or_default();
            *entry = (*entry).max(*value);
        }

        if self.state.is_terminal() {
            self.final_status = report.final_status;
            self.finish_time = report.finish_time.or_else(|| Some(now_millis()));
        }
    }
}

impl fmt::Display for JobExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job: {} ({})", self.id, self.name)?;
        writeln!(f, "  Application: {}", self.application)?;
        writeln!(f, "  Queue: {}", self.queue)?;
        writeln!(f, "  State: {}", self.state)?;
        writeln!(f, "  Final status: {}", self.final_status)?;
        writeln!(f, "  Progress: {:.2}%", self.progress * 100.0)?;
        if let Some(finish) = self.finish_time {
            writeln!(
                f,
                "  Elapsed: {} ms",
                finish.saturating_sub(self.start_time)
            )?;
        }
        if !self.diagnostics.is_empty() {
            writeln!(f, "  Diagnostics: {}", self.diagnostics)?;
        }
        if !self.counters.is_empty() {
            writeln!(f, "  Counters:")?;
            for (name, value) in &self.counters {
                writeln!(f, "    {name}={value}")?;
            }
        }
        Ok(())
    }
}
