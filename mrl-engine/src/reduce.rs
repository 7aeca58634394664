//! One reduce group: every key the partitioner routed to it, in key order.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use common::counters::{
    REDUCE_FAILED_KEYS, REDUCE_INPUT_GROUPS, REDUCE_INPUT_RECORDS, REDUCE_OUTPUT_RECORDS,
};
use common::{Counters, Error, KeyValue, Result, TaskContext, Workload};

use crate::shuffle::KeyGroup;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ReduceGroupState {
    Pending,
    Running,
    Done,
    Failed,
}

impl ReduceGroupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReduceGroupState::Done | ReduceGroupState::Failed)
    }
}

impl fmt::Display for ReduceGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReduceGroupState::Pending => "PENDING",
            ReduceGroupState::Running => "RUNNING",
            ReduceGroupState::Done => "DONE",
            ReduceGroupState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one group: `Pending -> Running -> Done | Failed`.
/// Retried attempts all happen inside `Running`.
#[derive(Clone, Debug)]
pub struct ReduceGroup {
    pub index: u32,
    state: ReduceGroupState,
}

impl ReduceGroup {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            state: ReduceGroupState::Pending,
        }
    }

    pub fn state(&self) -> ReduceGroupState {
        self.state
    }

    /// Only legal once the map barrier has been passed.
    pub fn start(&mut self) -> Result<()> {
        self.transition(ReduceGroupState::Pending, ReduceGroupState::Running)
    }

    pub fn finish(&mut self, ok: bool) -> Result<()> {
        let to = if ok {
            ReduceGroupState::Done
        } else {
            ReduceGroupState::Failed
        };
        self.transition(ReduceGroupState::Running, to)
    }

    fn transition(&mut self, from: ReduceGroupState, to: ReduceGroupState) -> Result<()> {
        if self.state != from {
            return Err(Error::task(
                format!("reduce-{}", self.index),
                format!("illegal transition {} -> {}", self.state, to),
            ));
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ReduceTaskOutput {
    pub group: u32,
    pub records: Vec<KeyValue>,

    /// Keys whose reduce call failed. Their output is missing from `records`.
    pub failed_keys: Vec<Bytes>,

    /// Set when a hook failed and the group produced nothing usable.
    pub error: Option<String>,

    pub counters: Counters,
}

impl ReduceTaskOutput {
    pub fn succeeded(&self) -> bool {
        self.failed_keys.is_empty() && self.error.is_none()
    }
}

/// Reduce every key of a group. A failing key does not stop the others, but
/// the group as a whole counts as failed.
pub fn run_reduce_task(
    group: u32,
    input: Vec<KeyGroup>,
    workload: &Workload,
    ctx: TaskContext,
) -> ReduceTaskOutput {
    let task = ctx.task;
    let mut output = ReduceTaskOutput {
        group,
        records: vec![],
        failed_keys: vec![],
        error: None,
        counters: ctx.counters.clone(),
    };

    if let Some(setup) = workload.setup_fn {
        if let Err(e) = setup(&ctx) {
            output.error = Some(format!("setup failed: {e}"));
            return output;
        }
    }

    for KeyGroup { key, values } in input {
        ctx.incr(REDUCE_INPUT_GROUPS, 1);
        ctx.incr(REDUCE_INPUT_RECORDS, values.len() as u64);
        match (workload.reduce_fn)(key.clone(), Box::new(values.into_iter()), &ctx) {
            Ok(records) => {
                ctx.incr(REDUCE_OUTPUT_RECORDS, records.len() as u64);
                output.records.extend(records);
            }
            Err(e) => {
                warn!(
                    "{task}: reduce failed for key `{}`: {e}",
                    String::from_utf8_lossy(&key)
                );
                ctx.incr(REDUCE_FAILED_KEYS, 1);
                output.failed_keys.push(key);
            }
        }
    }

    if let Some(cleanup) = workload.cleanup_fn {
        if let Err(e) = cleanup(&ctx) {
            output.error = Some(format!("cleanup failed: {e}"));
        }
    }

    info!(
        "Reduce task {task} done: {} keys, {} records out, {} failed keys",
        ctx.counters.get(REDUCE_INPUT_GROUPS),
        output.records.len(),
        output.failed_keys.len()
    );
    output
}

#[cfg(test)]
mod tests {
    use common::task::{Stage, TaskId};
    use common::JobId;
    use workload::WorkloadKind;

    use super::*;

    fn ctx() -> TaskContext {
        TaskContext::new(
            TaskId {
                job: JobId::new(1, 1),
                stage: Stage::Reduce,
                index: 0,
                attempt: 0,
            },
            Bytes::new(),
        )
    }

    fn group(key: &'static str, values: &[&'static str]) -> KeyGroup {
        KeyGroup {
            key: Bytes::from(key),
            values: values.iter().map(|v| Bytes::from(*v)).collect(),
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut g = ReduceGroup::new(0);
        assert!(g.finish(true).is_err());
        g.start().unwrap();
        assert!(g.start().is_err());
        g.finish(false).unwrap();
        assert_eq!(g.state(), ReduceGroupState::Failed);
        assert!(g.state().is_terminal());
        assert!(g.finish(true).is_err());
    }

    #[test]
    fn reduces_each_key() {
        let wl = WorkloadKind::WordCount.workload();
        let out = run_reduce_task(
            0,
            vec![group("a", &["1", "2"]), group("b", &["4"])],
            &wl,
            ctx(),
        );
        assert!(out.succeeded());
        assert_eq!(
            out.records,
            vec![KeyValue::new("a", "3"), KeyValue::new("b", "4")]
        );
        assert_eq!(out.counters.get(REDUCE_INPUT_GROUPS), 2);
        assert_eq!(out.counters.get(REDUCE_INPUT_RECORDS), 3);
    }

    #[test]
    fn failing_key_does_not_stop_the_rest() {
        let wl = WorkloadKind::WordCount.workload();
        let out = run_reduce_task(
            0,
            vec![
                group("a", &["1"]),
                group("bad", &["x"]),
                group("c", &["2"]),
            ],
            &wl,
            ctx(),
        );
        assert!(!out.succeeded());
        assert_eq!(out.failed_keys, vec![Bytes::from("bad")]);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.counters.get(REDUCE_FAILED_KEYS), 1);
    }
}
