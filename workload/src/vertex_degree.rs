//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

use common::utils::{string_from_bytes, sum_counts};
use common::{KeyValue, MapOutput, Record, TaskContext, Workload};

pub fn workload() -> Workload {
    Workload {
        name: "vertex-degree",
        map_fn: map,
        reduce_fn: reduce,
        combine_fn: Some(combine),
        setup_fn: None,
        cleanup_fn: None,
        reduce_associative: true,
    }
}

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

pub fn map(record: Record, _ctx: &TaskContext) -> MapOutput {
    let s = string_from_bytes(record.line)?;
    if s.trim().is_empty() || s.starts_with('#') {
        return Ok(Box::new(std::iter::empty::<Result<KeyValue>>()));
    }
    let (a, b) = parse_line(&s)?;

    let iter = [a, b].into_iter().map(|vertex| -> Result<KeyValue> {
        Ok(KeyValue {
            key: Bytes::from(vertex.to_string()),
            value: Bytes::from_static(b"1"),
        })
    });
    Ok(Box::new(iter))
}

fn degree(values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<u64> {
    sum_counts(values)
}

pub fn combine(
    _key: &Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Bytes> {
    Ok(Bytes::from(degree(values)?.to_string()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Vec<KeyValue>> {
    let count = degree(values)?;

    let mut value = BytesMut::with_capacity(24);
    value.put(format!("deg={}", count).as_bytes());
    Ok(vec![KeyValue::new(key, value.freeze())])
}
