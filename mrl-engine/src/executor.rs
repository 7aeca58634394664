//! Drives one job from input to output: read partitions, run every map task,
//! wait at the barrier, then run every reduce group.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::{spawn_blocking, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::codec::encode_output;
use common::counters::{BYTES_READ, BYTES_WRITTEN};
use common::storage::{join, CreateOptions, SharedStorage};
use common::task::{Stage, TaskId};
use common::{Counters, Error, JobId, Result, TaskContext};

use crate::map::{run_map_task, MapOptions, MapTaskOutput};
use crate::partition::{Partition, PartitionReader};
use crate::plan::JobPlan;
use crate::reduce::{run_reduce_task, ReduceGroup, ReduceGroupState};
use crate::shuffle::{ShuffleReader, ShuffleWriter};

/// Written into the output directory once a job has committed.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

pub fn map_output_path(output: &str, partition: u32) -> String {
    join(output, &format!("mr-map-{partition}"))
}

pub fn reduce_output_path(output: &str, group: u32) -> String {
    join(output, &format!("mr-out-{group}"))
}

/////////////////////////////////////////////////////////////////////////////
// Progress
/////////////////////////////////////////////////////////////////////////////

/// Live view of a running execution, shared with whoever reports on it.
#[derive(Debug, Default)]
pub struct Progress {
    maps_total: AtomicU32,
    maps_done: AtomicU32,
    reduces_total: AtomicU32,
    reduces_done: AtomicU32,
    started: AtomicBool,

    /// Job counters. Map attempts are merged in only when they succeed.
    pub counters: Counters,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_totals(&self, maps: u32, reduces: u32) {
        self.maps_total.store(maps, Ordering::SeqCst);
        self.reduces_total.store(reduces, Ordering::SeqCst);
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Whether any task has started running.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn maps_done(&self) -> u32 {
        self.maps_done.load(Ordering::SeqCst)
    }

    pub fn reduces_done(&self) -> u32 {
        self.reduces_done.load(Ordering::SeqCst)
    }

    /// Half map, half reduce. A map-only job is all map.
    pub fn fraction(&self) -> f32 {
        let ratio = |done: &AtomicU32, total: &AtomicU32| {
            let total = total.load(Ordering::SeqCst);
            if total == 0 {
                return 0.0;
            }
            (done.load(Ordering::SeqCst) as f32 / total as f32).min(1.0)
        };
        let map = ratio(&self.maps_done, &self.maps_total);
        if self.reduces_total.load(Ordering::SeqCst) == 0 {
            return map;
        }
        0.5 * map + 0.5 * ratio(&self.reduces_done, &self.reduces_total)
    }
}

/////////////////////////////////////////////////////////////////////////////
// Reports
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Succeeded => f.write_str("SUCCEEDED"),
            ExecutionOutcome::Failed(reason) => write!(f, "FAILED ({reason})"),
            ExecutionOutcome::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub counters: Counters,

    /// Final state of every reduce group. Empty for map-only jobs.
    pub groups: Vec<ReduceGroupState>,
    pub failed_groups: Vec<u32>,

    /// Committed output files.
    pub output_files: Vec<String>,
}

impl ExecutionReport {
    fn new(counters: Counters) -> Self {
        Self {
            outcome: ExecutionOutcome::Succeeded,
            counters,
            groups: vec![],
            failed_groups: vec![],
            output_files: vec![],
        }
    }
}

/// Result of one reduce group, after every attempt it was given.
struct GroupResult {
    group: u32,
    counters: Counters,
    output: Option<String>,
    error: Option<String>,
}

impl GroupResult {
    fn failed(group: u32, counters: Counters, error: String) -> Self {
        Self {
            group,
            counters,
            output: None,
            error: Some(error),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Executor
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
pub struct Executor {
    storage: SharedStorage,

    /// Bounds the number of tasks running at once across every job.
    slots: Arc<Semaphore>,
}

impl Executor {
    pub fn new(storage: SharedStorage, task_slots: usize) -> Self {
        Self {
            storage,
            slots: Arc::new(Semaphore::new(task_slots.max(1))),
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Run `plan` to completion, failure or cancellation. Never errors:
    /// whatever goes wrong ends up in the report's outcome.
    pub async fn execute(
        &self,
        job: JobId,
        plan: Arc<JobPlan>,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::new(progress.counters.clone());
        info!("Executing {job} ({}) over `{}`", plan.name(), plan.input());

        let reader = PartitionReader::new(self.storage.clone(), plan.input());
        let partitions = match reader.partitions(job, plan.partition_count()).await {
            Ok((partitions, bytes_read)) => {
                progress.counters.incr(BYTES_READ, bytes_read);
                partitions
            }
            Err(e) => {
                error!("{job}: failed to read input: {e}");
                report.outcome = ExecutionOutcome::Failed(format!("reading input: {e}"));
                return report;
            }
        };
        progress.set_totals(plan.partition_count(), plan.reduce_groups());

        match self.run_maps(job, &plan, partitions, &progress, &cancel).await {
            ExecutionOutcome::Succeeded => {}
            outcome => {
                report.outcome = outcome;
                return report;
            }
        }

        if plan.is_map_only() {
            report.output_files = (0..plan.partition_count())
                .map(|p| map_output_path(plan.output(), p))
                .collect();
        } else {
            self.run_reduces(job, &plan, &progress, &cancel, &mut report)
                .await;
            if report.outcome != ExecutionOutcome::Succeeded {
                return report;
            }
        }

        self.commit(job, &plan).await;
        info!("{job} succeeded with {} output files", report.output_files.len());
        report
    }

    /// All map tasks, in parallel. Returns once every one has succeeded, or
    /// on the first one to exhaust its attempts.
    async fn run_maps(
        &self,
        job: JobId,
        plan: &Arc<JobPlan>,
        partitions: Vec<Partition>,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let mut tasks = JoinSet::new();
        for partition in partitions {
            let this = self.clone();
            let plan = plan.clone();
            let progress = progress.clone();
            tasks.spawn(async move { this.run_map(job, plan, partition, progress).await });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!("{job} cancelled during map phase");
                    return ExecutionOutcome::Cancelled;
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok(Ok(counters))) => {
                        progress.counters.merge(&counters);
                        progress.maps_done.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        error!("{job}: {e}");
                        return ExecutionOutcome::Failed(e.to_string());
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return ExecutionOutcome::Failed(format!("map task aborted: {e}"));
                    }
                }
            }
        }
        debug!("{job}: all {} map tasks done", plan.partition_count());
        ExecutionOutcome::Succeeded
    }

    async fn run_map(
        &self,
        job: JobId,
        plan: Arc<JobPlan>,
        partition: Partition,
        progress: Arc<Progress>,
    ) -> Result<Counters> {
        let index = partition.id.index;
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::task(format!("{job}/m{index}"), e))?;
        progress.mark_started();

        let workload = plan.workload().workload();
        let options = MapOptions {
            strict: plan.strict(),
            combiner: plan.combiner_enabled(),
            reduce_groups: plan.reduce_groups(),
        };
        let aux = Bytes::from(plan.aux().join(" "));

        let mut last_error = None;
        for attempt in 0..plan.map_attempts() {
            let task = TaskId {
                job,
                stage: Stage::Map,
                index,
                attempt,
            };
            let ctx = TaskContext::new(task, aux.clone());
            let input = partition.clone();
            let handle = spawn_blocking(move || run_map_task(input, &workload, ctx, &options));

            // A timed-out attempt keeps its thread; its result is dropped.
            let err = match time::timeout(plan.task_timeout(), handle).await {
                Ok(Ok(Ok(output))) => match self.commit_map(job, &plan, &output).await {
                    Ok(written) => {
                        output.counters.incr(BYTES_WRITTEN, written);
                        return Ok(output.counters);
                    }
                    Err(e) => e,
                },
                Ok(Ok(Err(e))) => e,
                Ok(Err(e)) => Error::task(task, format!("panicked: {e}")),
                Err(_) => Error::task(
                    task,
                    format!("no result within {:?}, treated as straggler", plan.task_timeout()),
                ),
            };
            warn!("Map attempt {task} failed: {err}");
            last_error = Some(err);
        }
        Err(last_error.unwrap_or_else(|| Error::task(format!("{job}/m{index}"), "never attempted")))
    }

    /// Map-only jobs write straight to the output directory.
    async fn commit_map(&self, job: JobId, plan: &JobPlan, output: &MapTaskOutput) -> Result<u64> {
        if plan.is_map_only() {
            let data = encode_output(output.buckets.iter().flatten());
            let len = data.len() as u64;
            self.storage
                .create(
                    &map_output_path(plan.output(), output.partition),
                    CreateOptions::overwrite(),
                    data,
                )
                .await
                .map_err(Error::Storage)?;
            return Ok(len);
        }
        ShuffleWriter::new(self.storage.clone(), plan.intermediate_dir(job))
            .write(output.partition, &output.buckets)
            .await
    }

    /// Every reduce group, in parallel. Only called once all maps are done.
    async fn run_reduces(
        &self,
        job: JobId,
        plan: &Arc<JobPlan>,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
        report: &mut ExecutionReport,
    ) {
        let mut groups: Vec<ReduceGroup> = (0..plan.reduce_groups()).map(ReduceGroup::new).collect();
        let mut tasks = JoinSet::new();
        for group in groups.iter_mut() {
            if let Err(e) = group.start() {
                report.outcome = ExecutionOutcome::Failed(e.to_string());
                return;
            }
            let this = self.clone();
            let plan = plan.clone();
            let progress = progress.clone();
            let index = group.index;
            tasks.spawn(async move { this.run_reduce(job, plan, index, progress).await });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!("{job} cancelled during reduce phase");
                    report.groups = groups.iter().map(ReduceGroup::state).collect();
                    report.outcome = ExecutionOutcome::Cancelled;
                    return;
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok(result)) => {
                        progress.counters.merge(&result.counters);
                        progress.reduces_done.fetch_add(1, Ordering::SeqCst);
                        let group = &mut groups[result.group as usize];
                        if let Err(e) = group.finish(result.error.is_none()) {
                            tasks.abort_all();
                            report.outcome = ExecutionOutcome::Failed(e.to_string());
                            report.groups = groups.iter().map(ReduceGroup::state).collect();
                            return;
                        }
                        match (result.output, result.error) {
                            (Some(path), None) => report.output_files.push(path),
                            (_, error) => {
                                warn!(
                                    "{job}: reduce group {} failed: {}",
                                    result.group,
                                    error.unwrap_or_default()
                                );
                                report.failed_groups.push(result.group);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        report.outcome = ExecutionOutcome::Failed(format!("reduce task aborted: {e}"));
                        report.groups = groups.iter().map(ReduceGroup::state).collect();
                        return;
                    }
                }
            }
        }

        report.groups = groups.iter().map(ReduceGroup::state).collect();
        report.output_files.sort();
        report.failed_groups.sort_unstable();

        let failed = report.failed_groups.len() as u32;
        if failed > plan.failure_tolerance() {
            report.outcome = ExecutionOutcome::Failed(format!(
                "{failed} reduce groups failed {:?}, tolerance is {}",
                report.failed_groups,
                plan.failure_tolerance()
            ));
        } else if failed > 0 {
            warn!(
                "{job}: {failed} reduce groups failed, within tolerance of {}",
                plan.failure_tolerance()
            );
        }
    }

    async fn run_reduce(
        &self,
        job: JobId,
        plan: Arc<JobPlan>,
        group: u32,
        progress: Arc<Progress>,
    ) -> GroupResult {
        match self.try_reduce(job, plan, group, progress).await {
            Ok(result) => result,
            Err(e) => GroupResult::failed(group, Counters::new(), e.to_string()),
        }
    }

    async fn try_reduce(
        &self,
        job: JobId,
        plan: Arc<JobPlan>,
        group: u32,
        progress: Arc<Progress>,
    ) -> Result<GroupResult> {
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::task(format!("{job}/r{group}"), e))?;
        progress.mark_started();

        let reader = ShuffleReader::new(
            self.storage.clone(),
            plan.intermediate_dir(job),
            plan.partition_count(),
        );
        let (input, bytes_read) = reader.fetch_group(group).await?;

        let workload = plan.workload().workload();
        let aux = Bytes::from(plan.aux().join(" "));
        let mut last = GroupResult::failed(group, Counters::new(), "never attempted".into());

        for attempt in 0..plan.reduce_attempts() {
            let task = TaskId {
                job,
                stage: Stage::Reduce,
                index: group,
                attempt,
            };
            let ctx = TaskContext::new(task, aux.clone());
            let input = input.clone();
            let handle =
                spawn_blocking(move || run_reduce_task(group, input, &workload, ctx));

            match time::timeout(plan.task_timeout(), handle).await {
                Ok(Ok(output)) if output.succeeded() => {
                    let path = reduce_output_path(plan.output(), group);
                    let data = encode_output(&output.records);
                    output.counters.incr(BYTES_READ, bytes_read);
                    output.counters.incr(BYTES_WRITTEN, data.len() as u64);
                    match self
                        .storage
                        .create(&path, CreateOptions::overwrite(), data)
                        .await
                    {
                        Ok(()) => {
                            return Ok(GroupResult {
                                group,
                                counters: output.counters,
                                output: Some(path),
                                error: None,
                            })
                        }
                        Err(e) => {
                            warn!("Reduce attempt {task} could not write `{path}`: {e}");
                            last = GroupResult::failed(
                                group,
                                Counters::new(),
                                format!("{task}: writing `{path}`: {e}"),
                            );
                        }
                    }
                }
                Ok(Ok(output)) => {
                    let reason = output.error.clone().unwrap_or_else(|| {
                        format!("{} keys failed to reduce", output.failed_keys.len())
                    });
                    warn!("Reduce attempt {task} failed: {reason}");
                    last = GroupResult::failed(group, output.counters, reason);
                }
                Ok(Err(e)) => {
                    last = GroupResult::failed(group, Counters::new(), format!("{task} panicked: {e}"));
                }
                Err(_) => {
                    warn!("Reduce attempt {task} is a straggler");
                    last = GroupResult::failed(
                        group,
                        Counters::new(),
                        format!("{task}: no result within {:?}", plan.task_timeout()),
                    );
                }
            }
        }
        Ok(last)
    }

    /// Drop the intermediate data and mark the output complete.
    async fn commit(&self, job: JobId, plan: &JobPlan) {
        let temporary = join(plan.output(), "_temporary");
        if let Err(e) = self.storage.delete(&temporary, true).await {
            warn!("{job}: failed to remove `{temporary}`: {e}");
        }
        let marker = join(plan.output(), SUCCESS_MARKER);
        if let Err(e) = self
            .storage
            .create(&marker, CreateOptions::overwrite(), Bytes::new())
            .await
        {
            warn!("{job}: failed to write `{marker}`: {e}");
        }
    }
}
