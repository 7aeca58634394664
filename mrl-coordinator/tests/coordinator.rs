use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::storage::{CreateOptions, MemoryStorage, SharedStorage, Storage};
use common::{Error, JobId, Resource, Result};
use mrl_coordinator::scheduler::{
    ApplicationId, ApplicationReport, ApplicationState, ClusterScheduler, FinalStatus, NodeReport,
    NodeState, QueueInfo,
};
use mrl_coordinator::{CoordinatorConfig, JobCoordinator, JobState, RetryPolicy, TerminalState};
use mrl_engine::JobPlan;
use workload::WorkloadKind;

#[derive(Clone, Copy, Debug)]
enum Step {
    Report(ApplicationState, f32),
    Transient,
}

/// A scheduler that replays a fixed script of report results. The last
/// report repeats once the script runs out.
#[derive(Default)]
struct ScriptedScheduler {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<(ApplicationState, f32)>>,
    reject_submit: bool,
    submits: AtomicU32,
    report_calls: AtomicU32,
    kills: AtomicU32,
}

impl ScriptedScheduler {
    fn new(steps: &[Step]) -> Self {
        Self {
            steps: Mutex::new(steps.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn rejecting() -> Self {
        Self {
            reject_submit: true,
            ..Default::default()
        }
    }
}

fn app_id() -> ApplicationId {
    ApplicationId {
        cluster_timestamp: 42,
        id: 1,
    }
}

fn report(state: ApplicationState, progress: f32) -> ApplicationReport {
    let final_status = match state {
        ApplicationState::Finished => FinalStatus::Succeeded,
        ApplicationState::Failed => FinalStatus::Failed,
        ApplicationState::Killed => FinalStatus::Killed,
        _ => FinalStatus::Undefined,
    };
    ApplicationReport {
        id: app_id(),
        name: "wc".into(),
        queue: "default".into(),
        state,
        final_status,
        progress,
        diagnostics: String::new(),
        counters: BTreeMap::new(),
        start_time: 0,
        finish_time: None,
        am_node: None,
        allocated: Resource::default(),
    }
}

#[async_trait]
impl ClusterScheduler for ScriptedScheduler {
    async fn submit_application(&self, _job: JobId, _plan: Arc<JobPlan>) -> Result<ApplicationId> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.reject_submit {
            return Err(Error::SchedulerRejected("queue `default` is full".into()));
        }
        Ok(app_id())
    }

    async fn get_application_report(&self, _app: ApplicationId) -> Result<ApplicationReport> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Transient) => Err(Error::TransientScheduler("connection reset".into())),
            Some(Step::Report(state, progress)) => {
                *self.last.lock().unwrap() = Some((state, progress));
                Ok(report(state, progress))
            }
            None => {
                let (state, progress) = self
                    .last
                    .lock()
                    .unwrap()
                    .unwrap_or((ApplicationState::Submitted, 0.0));
                Ok(report(state, progress))
            }
        }
    }

    async fn kill_application(&self, _app: ApplicationId) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_node_reports(&self, _states: &[NodeState]) -> Result<Vec<NodeReport>> {
        Ok(vec![])
    }

    async fn get_queues(&self) -> Result<Vec<QueueInfo>> {
        Ok(vec![])
    }

    async fn get_applications(&self) -> Result<Vec<ApplicationReport>> {
        Ok(vec![])
    }
}

async fn storage() -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage
        .create(
            "in/words.txt",
            CreateOptions::default(),
            Bytes::from("hello world\n"),
        )
        .await
        .unwrap();
    storage
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

async fn coordinator(scheduler: Arc<ScriptedScheduler>) -> (JobCoordinator, MemoryStorage) {
    let storage = storage().await;
    let shared: SharedStorage = Arc::new(storage.clone());
    (JobCoordinator::new(scheduler, shared, config()), storage)
}

fn plan() -> JobPlan {
    JobPlan::builder(WorkloadKind::WordCount, "in", "out").build()
}

#[tokio::test]
async fn poll_retries_transient_errors() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[
        Step::Transient,
        Step::Transient,
        Step::Report(ApplicationState::Running, 0.3),
    ]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();
    assert_eq!(exec.state, JobState::Submitted);

    let exec = coordinator.poll(&exec).await.unwrap();
    assert_eq!(exec.state, JobState::Running);
    assert_eq!(exec.progress, 0.3);
    assert_eq!(scheduler.report_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn poll_gives_up_after_the_retry_budget() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[Step::Transient; 4]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let err = coordinator.poll(&exec).await.unwrap_err();
    assert!(matches!(err, Error::TransientScheduler(_)));
    assert_eq!(coordinator.execution(exec.id).unwrap().state, JobState::Submitted);
}

#[tokio::test]
async fn progress_regression_is_tolerated() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[
        Step::Report(ApplicationState::Running, 0.6),
        Step::Report(ApplicationState::Running, 0.4),
    ]));
    let (coordinator, _) = coordinator(scheduler).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    coordinator.poll(&exec).await.unwrap();
    let exec = coordinator.poll(&exec).await.unwrap();
    assert_eq!(exec.state, JobState::Running);
    assert_eq!(exec.progress, 0.6);
}

#[tokio::test]
async fn concurrent_polls_merge_cleanly() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[
        Step::Report(ApplicationState::Running, 0.4),
        Step::Report(ApplicationState::Running, 0.7),
    ]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let (a, b) = tokio::join!(coordinator.poll(&exec), coordinator.poll(&exec));
    a.unwrap();
    b.unwrap();
    let merged = coordinator.execution(exec.id).unwrap();
    assert_eq!(merged.state, JobState::Running);
    assert_eq!(merged.progress, 0.7);

    // The last report repeats; merging it again changes nothing.
    let again = coordinator.poll(&exec).await.unwrap();
    assert_eq!(again.state, merged.state);
    assert_eq!(again.progress, merged.progress);
    assert_eq!(scheduler.report_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejection_is_surfaced_without_retry() {
    let scheduler = Arc::new(ScriptedScheduler::rejecting());
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let err = coordinator.submit(plan()).await.unwrap_err();
    assert!(matches!(err, Error::SchedulerRejected(_)));
    assert_eq!(scheduler.submits.load(Ordering::SeqCst), 1);
    assert!(coordinator.executions().is_empty());
}

#[tokio::test]
async fn invalid_plans_never_reach_the_scheduler() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;

    let zero = JobPlan::builder(WorkloadKind::WordCount, "in", "out")
        .partitions(0)
        .build();
    assert!(matches!(
        coordinator.submit(zero).await,
        Err(Error::InvalidPlan(_))
    ));

    let huge = JobPlan::builder(WorkloadKind::WordCount, "in", "out")
        .resources(Resource::new(1 << 20, 1))
        .build();
    assert!(matches!(
        coordinator.submit(huge).await,
        Err(Error::InvalidPlan(_))
    ));

    let missing = JobPlan::builder(WorkloadKind::WordCount, "nowhere", "out").build();
    assert!(matches!(
        coordinator.submit(missing).await,
        Err(Error::InvalidPlan(_))
    ));

    assert_eq!(scheduler.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn existing_output_needs_overwrite() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[]));
    let (coordinator, storage) = coordinator(scheduler).await;
    storage
        .create("out/mr-out-0", CreateOptions::default(), Bytes::from("old 1\n"))
        .await
        .unwrap();

    assert!(matches!(
        coordinator.submit(plan()).await,
        Err(Error::InvalidPlan(_))
    ));
    assert!(storage.exists("out/mr-out-0").await.unwrap());

    let overwrite = JobPlan::builder(WorkloadKind::WordCount, "in", "out")
        .overwrite_output(true)
        .build();
    coordinator.submit(overwrite).await.unwrap();
    assert!(!storage.exists("out/mr-out-0").await.unwrap());
}

#[tokio::test]
async fn kill_on_finished_job_is_a_noop() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[Step::Report(
        ApplicationState::Finished,
        1.0,
    )]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();
    let exec = coordinator.poll(&exec).await.unwrap();
    assert_eq!(exec.state, JobState::Finished);

    let after = coordinator.kill(&exec).await.unwrap();
    assert_eq!(after.state, JobState::Finished);
    assert_eq!(scheduler.kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn kill_running_job_reaches_the_scheduler() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[
        Step::Report(ApplicationState::Running, 0.2),
        Step::Report(ApplicationState::Killed, 0.2),
    ]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();
    coordinator.poll(&exec).await.unwrap();

    let after = coordinator.kill(&exec).await.unwrap();
    assert_eq!(scheduler.kills.load(Ordering::SeqCst), 1);
    assert_eq!(after.state, JobState::Killed);
    assert_eq!(after.final_status, FinalStatus::Killed);
}

#[tokio::test]
async fn zero_timeout_returns_immediately() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[Step::Report(
        ApplicationState::Running,
        0.1,
    )]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let state = coordinator
        .await_completion(
            &exec,
            Duration::from_millis(10),
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(state, TerminalState::TimedOut);
    assert_eq!(scheduler.report_calls.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.execution(exec.id).unwrap().state, JobState::Submitted);
}

#[tokio::test]
async fn await_follows_the_lifecycle_to_the_end() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[
        Step::Report(ApplicationState::Accepted, 0.0),
        Step::Transient,
        Step::Report(ApplicationState::Running, 0.5),
        Step::Report(ApplicationState::Finished, 1.0),
    ]));
    let (coordinator, _) = coordinator(scheduler).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let state = coordinator
        .await_completion(
            &exec,
            Duration::from_millis(1),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(state, TerminalState::Finished);

    let exec = coordinator.execution(exec.id).unwrap();
    assert_eq!(exec.progress, 1.0);
    assert_eq!(exec.final_status, FinalStatus::Succeeded);
    assert!(coordinator.archive(exec.id).is_some());
    assert!(coordinator.execution(exec.id).is_err());
}

#[tokio::test(start_paused = true)]
async fn client_timeout_does_not_kill_the_job() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[Step::Report(
        ApplicationState::Running,
        0.5,
    )]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let state = coordinator
        .await_completion(
            &exec,
            Duration::from_secs(1),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(state, TerminalState::TimedOut);
    assert_eq!(scheduler.kills.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.execution(exec.id).unwrap().state, JobState::Running);
    assert!(coordinator.archive(exec.id).is_none());
}

#[tokio::test]
async fn waiting_can_be_cancelled() {
    let scheduler = Arc::new(ScriptedScheduler::new(&[Step::Report(
        ApplicationState::Running,
        0.5,
    )]));
    let (coordinator, _) = coordinator(scheduler.clone()).await;
    let exec = coordinator.submit(plan()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let state = coordinator
        .await_completion(
            &exec,
            Duration::from_millis(5),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(state, TerminalState::Cancelled);
    assert_eq!(scheduler.kills.load(Ordering::SeqCst), 0);
}
