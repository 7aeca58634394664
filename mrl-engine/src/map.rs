//! One map task: apply the map function to every record of a partition,
//! optionally combine, then bucket the output by reduce group.

use tracing::{debug, info};

use common::counters::{MALFORMED_INPUT, MAP_INPUT_RECORDS, MAP_OUTPUT_RECORDS};
use common::{Counters, Error, KeyValue, Result, TaskContext, Workload};

use crate::combine::combine;
use crate::partition::Partition;
use crate::shuffle::{bucket_pairs, HashPartitioner};

#[derive(Clone, Copy, Debug)]
pub struct MapOptions {
    pub strict: bool,
    pub combiner: bool,

    /// Zero for a map-only job: everything goes into a single bucket.
    pub reduce_groups: u32,
}

#[derive(Debug)]
pub struct MapTaskOutput {
    pub partition: u32,

    /// One bucket per reduce group, or a single bucket for a map-only job.
    pub buckets: Vec<Vec<KeyValue>>,

    pub counters: Counters,
}

/// Run the map function over one record. All pairs of a record are kept, or
/// none are.
fn map_record(
    workload: &Workload,
    record: common::Record,
    ctx: &TaskContext,
) -> anyhow::Result<Vec<KeyValue>> {
    (workload.map_fn)(record, ctx)?.collect()
}

pub fn run_map_task(
    partition: Partition,
    workload: &Workload,
    ctx: TaskContext,
    options: &MapOptions,
) -> Result<MapTaskOutput> {
    let task = ctx.task;
    debug!("Starting map task {task} over {} records", partition.len());

    if let Some(setup) = workload.setup_fn {
        setup(&ctx).map_err(|e| Error::task(task, format!("setup failed: {e}")))?;
    }

    let mut pairs = Vec::new();
    for record in partition.records {
        ctx.incr(MAP_INPUT_RECORDS, 1);
        let offset = record.offset;
        match map_record(workload, record, &ctx) {
            Ok(emitted) => {
                ctx.incr(MAP_OUTPUT_RECORDS, emitted.len() as u64);
                pairs.extend(emitted);
            }
            Err(e) if options.strict => {
                return Err(Error::task(
                    task,
                    format!("malformed record at offset {offset}: {e}"),
                ));
            }
            Err(e) => {
                debug!("{task}: skipping malformed record at offset {offset}: {e}");
                ctx.incr(MALFORMED_INPUT, 1);
            }
        }
    }

    if let Some(cleanup) = workload.cleanup_fn {
        cleanup(&ctx).map_err(|e| Error::task(task, format!("cleanup failed: {e}")))?;
    }

    if options.combiner {
        if let Some(combine_fn) = workload.combine_fn {
            pairs = combine(pairs, combine_fn, &ctx)?;
        }
    }

    let buckets = if options.reduce_groups == 0 {
        vec![pairs]
    } else {
        bucket_pairs(pairs, &HashPartitioner::new(options.reduce_groups)?)
    };

    info!(
        "Map task {task} done: {} in, {} out, {} malformed",
        ctx.counters.get(MAP_INPUT_RECORDS),
        ctx.counters.get(MAP_OUTPUT_RECORDS),
        ctx.counters.get(MALFORMED_INPUT)
    );

    Ok(MapTaskOutput {
        partition: partition.id.index,
        buckets,
        counters: ctx.counters,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use common::task::{Stage, TaskId};
    use common::{JobId, Record};
    use workload::WorkloadKind;

    use super::*;
    use crate::partition::PartitionId;

    fn ctx() -> TaskContext {
        TaskContext::new(
            TaskId {
                job: JobId::new(1, 1),
                stage: Stage::Map,
                index: 0,
                attempt: 0,
            },
            Bytes::new(),
        )
    }

    fn partition(lines: &[&'static str]) -> Partition {
        Partition {
            id: PartitionId {
                job: JobId::new(1, 1),
                index: 0,
            },
            records: lines
                .iter()
                .enumerate()
                .map(|(i, l)| Record::new(i as u64, Bytes::from_static(l.as_bytes())))
                .collect(),
        }
    }

    const OPTIONS: MapOptions = MapOptions {
        strict: false,
        combiner: false,
        reduce_groups: 2,
    };

    #[test]
    fn malformed_records_are_counted_and_skipped() {
        let wl = WorkloadKind::VertexDegree.workload();
        let out = run_map_task(partition(&["1 2", "oops", "3 4"]), &wl, ctx(), &OPTIONS).unwrap();
        assert_eq!(out.counters.get(MAP_INPUT_RECORDS), 3);
        assert_eq!(out.counters.get(MALFORMED_INPUT), 1);
        assert_eq!(out.counters.get(MAP_OUTPUT_RECORDS), 4);
        assert_eq!(out.buckets.iter().map(Vec::len).sum::<usize>(), 4);
    }

    #[test]
    fn strict_mode_fails_on_first_malformed_record() {
        let wl = WorkloadKind::VertexDegree.workload();
        let options = MapOptions {
            strict: true,
            ..OPTIONS
        };
        let res = run_map_task(partition(&["1 2", "oops"]), &wl, ctx(), &options);
        assert!(matches!(res, Err(Error::TaskExecution { .. })));
    }

    #[test]
    fn combiner_shrinks_output() {
        let wl = WorkloadKind::WordCount.workload();
        let options = MapOptions {
            combiner: true,
            ..OPTIONS
        };
        let out = run_map_task(partition(&["to be or", "not to be"]), &wl, ctx(), &options)
            .unwrap();
        let total: usize = out.buckets.iter().map(Vec::len).sum();
        assert_eq!(total, 4);
        assert_eq!(out.counters.get(MAP_OUTPUT_RECORDS), 6);
    }

    #[test]
    fn map_only_uses_one_bucket() {
        let wl = WorkloadKind::WordCount.workload();
        let options = MapOptions {
            reduce_groups: 0,
            ..OPTIONS
        };
        let out = run_map_task(partition(&["hello world"]), &wl, ctx(), &options).unwrap();
        assert_eq!(out.buckets.len(), 1);
        assert_eq!(out.buckets[0].len(), 2);
    }

    #[test]
    fn empty_partition_has_empty_buckets() {
        let wl = WorkloadKind::WordCount.workload();
        let out = run_map_task(partition(&[]), &wl, ctx(), &OPTIONS).unwrap();
        assert_eq!(out.buckets, vec![vec![], vec![]]);
    }
}
