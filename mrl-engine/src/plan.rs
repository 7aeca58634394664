//! The immutable description of a submitted computation.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use common::storage::join;
use common::{Error, JobId, Resource, Result};
use workload::WorkloadKind;

/// Per-task resources asked for when nothing else is said.
pub const DEFAULT_TASK_RESOURCES: Resource = Resource::new(1024, 1);

/// How long a single task attempt may run before it is treated as a straggler.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum JobPriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPriority::VeryLow => "VERY_LOW",
            JobPriority::Low => "LOW",
            JobPriority::Normal => "NORMAL",
            JobPriority::High => "HIGH",
            JobPriority::VeryHigh => "VERY_HIGH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    name: String,
    workload: WorkloadKind,

    /// Input file or directory.
    input: String,

    /// Output directory. Intermediate data lives under `<output>/_temporary`.
    output: String,

    /// Auxiliary arguments to pass to the MapReduce application.
    aux: Vec<String>,

    partition_count: u32,

    /// Zero means a map-only job.
    reduce_groups: u32,

    /// Resolved: requested, and the workload's reducer declares itself
    /// associative and commutative.
    combiner: bool,

    resources: Resource,
    priority: JobPriority,
    queue: String,
    overwrite_output: bool,

    /// Fail the partition on the first malformed record instead of skipping it.
    strict: bool,

    /// Number of failed reduce groups a job may have and still finish.
    failure_tolerance: u32,

    map_attempts: u32,
    reduce_attempts: u32,
    task_timeout: Duration,
}

impl JobPlan {
    pub fn builder(
        workload: WorkloadKind,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> JobPlanBuilder {
        JobPlanBuilder::new(workload, input.into(), output.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workload(&self) -> WorkloadKind {
        self.workload
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn aux(&self) -> &[String] {
        &self.aux
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn reduce_groups(&self) -> u32 {
        self.reduce_groups
    }

    pub fn is_map_only(&self) -> bool {
        self.reduce_groups == 0
    }

    pub fn combiner_enabled(&self) -> bool {
        self.combiner
    }

    pub fn resources(&self) -> Resource {
        self.resources
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn overwrite_output(&self) -> bool {
        self.overwrite_output
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn failure_tolerance(&self) -> u32 {
        self.failure_tolerance
    }

    pub fn map_attempts(&self) -> u32 {
        self.map_attempts
    }

    pub fn reduce_attempts(&self) -> u32 {
        self.reduce_attempts
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Where the shuffle keeps map output for one job.
    pub fn intermediate_dir(&self, job: JobId) -> String {
        join(&self.output, &format!("_temporary/{job}"))
    }

    /// Structural checks, plus the per-task request against the largest
    /// allocation the cluster will hand out.
    pub fn validate(&self, max_allocation: &Resource) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidPlan(msg));

        if self.partition_count == 0 {
            return invalid("partition count must be greater than 0".into());
        }
        if self.input.trim().is_empty() {
            return invalid("no input path given".into());
        }
        if self.output.trim().is_empty() {
            return invalid("no output path given".into());
        }
        if self.input.trim_end_matches('/') == self.output.trim_end_matches('/') {
            return invalid(format!("input and output are both `{}`", self.output));
        }
        if self.queue.trim().is_empty() {
            return invalid("no queue given".into());
        }
        if self.resources.memory_mb == 0 || self.resources.vcores == 0 {
            return invalid(format!("empty resource request {}", self.resources));
        }
        if !self.resources.fits_within(max_allocation) {
            return invalid(format!(
                "resource request {} exceeds the maximum allocation {}",
                self.resources, max_allocation
            ));
        }
        if self.map_attempts == 0 || self.reduce_attempts == 0 {
            return invalid("tasks need at least one attempt".into());
        }
        if self.task_timeout.is_zero() {
            return invalid("task timeout must be positive".into());
        }
        Ok(())
    }
}

pub struct JobPlanBuilder {
    plan: JobPlan,
    combiner_requested: bool,
}

impl JobPlanBuilder {
    fn new(workload: WorkloadKind, input: String, output: String) -> Self {
        Self {
            plan: JobPlan {
                name: workload.name().to_string(),
                workload,
                input,
                output,
                aux: vec![],
                partition_count: 1,
                reduce_groups: 1,
                combiner: false,
                resources: DEFAULT_TASK_RESOURCES,
                priority: JobPriority::Normal,
                queue: "default".to_string(),
                overwrite_output: false,
                strict: false,
                failure_tolerance: 0,
                map_attempts: 2,
                reduce_attempts: 1,
                task_timeout: DEFAULT_TASK_TIMEOUT,
            },
            combiner_requested: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.plan.name = name.into();
        self
    }

    pub fn aux(mut self, aux: Vec<String>) -> Self {
        self.plan.aux = aux;
        self
    }

    pub fn partitions(mut self, n: u32) -> Self {
        self.plan.partition_count = n;
        self
    }

    pub fn reduce_groups(mut self, n: u32) -> Self {
        self.plan.reduce_groups = n;
        self
    }

    /// Ask for the combiner. Only honoured if the reducer allows it.
    pub fn combiner(mut self, enabled: bool) -> Self {
        self.combiner_requested = enabled;
        self
    }

    pub fn resources(mut self, resources: Resource) -> Self {
        self.plan.resources = resources;
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.plan.priority = priority;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.plan.queue = queue.into();
        self
    }

    pub fn overwrite_output(mut self, overwrite: bool) -> Self {
        self.plan.overwrite_output = overwrite;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.plan.strict = strict;
        self
    }

    pub fn failure_tolerance(mut self, groups: u32) -> Self {
        self.plan.failure_tolerance = groups;
        self
    }

    pub fn map_attempts(mut self, attempts: u32) -> Self {
        self.plan.map_attempts = attempts;
        self
    }

    pub fn reduce_attempts(mut self, attempts: u32) -> Self {
        self.plan.reduce_attempts = attempts;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.plan.task_timeout = timeout;
        self
    }

    pub fn build(mut self) -> JobPlan {
        let workload = self.plan.workload.workload();
        let allowed = workload.combine_fn.is_some() && workload.reduce_associative;
        if self.combiner_requested && !allowed && workload.combine_fn.is_some() {
            warn!(
                "workload `{}` does not declare an associative reducer, combiner disabled",
                workload.name
            );
        }
        self.plan.combiner = self.combiner_requested && allowed && !self.plan.is_map_only();
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Resource = Resource::new(8192, 8);

    #[test]
    fn defaults_follow_the_driver() {
        let plan = JobPlan::builder(WorkloadKind::WordCount, "in", "out").build();
        assert_eq!(plan.partition_count(), 1);
        assert_eq!(plan.reduce_groups(), 1);
        assert!(plan.combiner_enabled());
        assert_eq!(plan.resources(), Resource::new(1024, 1));
        assert_eq!(plan.priority(), JobPriority::Normal);
        assert_eq!(plan.queue(), "default");
        assert!(!plan.overwrite_output());
        assert!(plan.validate(&MAX).is_ok());
    }

    #[test]
    fn combiner_needs_associative_reducer() {
        let plan = JobPlan::builder(WorkloadKind::Distinct, "in", "out")
            .combiner(true)
            .build();
        assert!(!plan.combiner_enabled());

        let plan = JobPlan::builder(WorkloadKind::WordCount, "in", "out")
            .combiner(false)
            .build();
        assert!(!plan.combiner_enabled());
    }

    #[test]
    fn map_only_jobs_never_combine() {
        let plan = JobPlan::builder(WorkloadKind::WordCount, "in", "out")
            .reduce_groups(0)
            .build();
        assert!(plan.is_map_only());
        assert!(!plan.combiner_enabled());
        assert!(plan.validate(&MAX).is_ok());
    }

    #[test]
    fn invalid_plans_are_rejected() {
        let cases = [
            JobPlan::builder(WorkloadKind::WordCount, "in", "out").partitions(0),
            JobPlan::builder(WorkloadKind::WordCount, "", "out"),
            JobPlan::builder(WorkloadKind::WordCount, "data", "data/"),
            JobPlan::builder(WorkloadKind::WordCount, "in", "out").queue(""),
            JobPlan::builder(WorkloadKind::WordCount, "in", "out").resources(Resource::new(0, 1)),
            JobPlan::builder(WorkloadKind::WordCount, "in", "out")
                .resources(Resource::new(16384, 1)),
            JobPlan::builder(WorkloadKind::WordCount, "in", "out").map_attempts(0),
            JobPlan::builder(WorkloadKind::WordCount, "in", "out").task_timeout(Duration::ZERO),
        ];
        for builder in cases {
            let plan = builder.build();
            assert!(
                matches!(plan.validate(&MAX), Err(Error::InvalidPlan(_))),
                "{plan:?} should be invalid"
            );
        }
    }

    #[test]
    fn intermediate_dir_is_per_job() {
        let plan = JobPlan::builder(WorkloadKind::WordCount, "in", "out/").build();
        assert_eq!(
            plan.intermediate_dir(JobId::new(5, 2)),
            "out/_temporary/job_5_0002"
        );
    }
}
