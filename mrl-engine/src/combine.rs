use std::collections::BTreeMap;

use bytes::Bytes;

use common::counters::{COMBINE_INPUT_RECORDS, COMBINE_OUTPUT_RECORDS};
use common::{CombineFn, Error, KeyValue, Result, TaskContext};

/// Fold the pairs of one map task to a single pair per key.
///
/// Only called for workloads whose reducer is associative and commutative,
/// so the reduce result is the same whether this runs or not.
pub fn combine(
    pairs: Vec<KeyValue>,
    combine_fn: CombineFn,
    ctx: &TaskContext,
) -> Result<Vec<KeyValue>> {
    ctx.incr(COMBINE_INPUT_RECORDS, pairs.len() as u64);

    let mut grouped: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
    for kv in pairs {
        grouped.entry(kv.key).or_default().push(kv.value);
    }

    let mut out = Vec::with_capacity(grouped.len());
    for (key, values) in grouped {
        let value = combine_fn(&key, Box::new(values.into_iter()), ctx).map_err(|e| {
            Error::task(
                ctx.task,
                format!("combine failed for key `{}`: {e}", String::from_utf8_lossy(&key)),
            )
        })?;
        out.push(KeyValue::new(key, value));
    }

    ctx.incr(COMBINE_OUTPUT_RECORDS, out.len() as u64);
    Ok(out)
}
