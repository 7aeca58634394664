use std::fmt;

use bytes::Bytes;

use crate::{Counters, JobId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Map,
    Reduce,
}

/// Identity of one attempt of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub job: JobId,
    pub stage: Stage,
    /// Partition index for map tasks, reduce-group index for reduce tasks.
    pub index: u32,
    pub attempt: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Map => 'm',
            Stage::Reduce => 'r',
        };
        // attempt_<job>_m_000003_0, minus the "job_" prefix like Hadoop does it.
        let job = self.job.to_string();
        let job = job.trim_start_matches("job_");
        write!(
            f,
            "attempt_{}_{}_{:06}_{}",
            job, stage, self.index, self.attempt
        )
    }
}

/// Everything a user function may touch besides its input.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task: TaskId,

    /// Auxiliary arguments given at submission, space separated.
    pub aux: Bytes,

    /// Counters of this attempt. Merged into the job only if the attempt succeeds.
    pub counters: Counters,
}

impl TaskContext {
    pub fn new(task: TaskId, aux: Bytes) -> Self {
        Self {
            task,
            aux,
            counters: Counters::new(),
        }
    }

    pub fn incr(&self, counter: &str, by: u64) {
        self.counters.incr(counter, by);
    }

    /// The auxiliary arguments as a string, lossily decoded.
    pub fn aux_str(&self) -> String {
        String::from_utf8_lossy(&self.aux).into_owned()
    }
}
