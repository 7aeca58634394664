use thiserror::Error;

use crate::JobId;

/// Failures surfaced by the execution core.
///
/// Job-level failure is not an error: a job that ends `FAILED` is reported
/// through its execution record. These variants cover the cases where the
/// caller's request itself could not be carried out.
#[derive(Error, Debug)]
pub enum Error {
    /// The plan is malformed. Never retried.
    #[error("Invalid job plan: {0}")]
    InvalidPlan(String),

    /// The cluster declined the submission (queue full, stopped queue,
    /// request above the maximum allocation).
    #[error("Scheduler rejected submission: {0}")]
    SchedulerRejected(String),

    /// Timeout or connection failure while talking to the scheduler.
    #[error("Transient scheduler error: {0}")]
    TransientScheduler(String),

    /// A map, combine or reduce task failed irrecoverably.
    #[error("Task {task} failed: {message}")]
    TaskExecution { task: String, message: String },

    /// A client-side wait ran out. Says nothing about the job itself.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    /// The scheduler has no record of the application.
    #[error("Application not found: {0}")]
    UnknownApplication(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl Error {
    pub fn task(task: impl ToString, message: impl ToString) -> Self {
        Error::TaskExecution {
            task: task.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientScheduler(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_scheduler_hiccups_are_transient() {
        assert!(Error::TransientScheduler("reset".into()).is_transient());
        assert!(Error::Timeout("rpc".into()).is_transient());
        assert!(!Error::InvalidPlan("no partitions".into()).is_transient());
        assert!(!Error::SchedulerRejected("queue full".into()).is_transient());
        assert!(!Error::task("map-0", "boom").is_transient());
    }

    #[test]
    fn task_error_message() {
        let err = Error::task("reduce-3", "key `x` failed");
        assert_eq!(err.to_string(), "Task reduce-3 failed: key `x` failed");
    }
}
