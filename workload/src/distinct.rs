//! Distinct values per key, for `key value` lines.
//!
//! The reducer turns a bag of values into one comma-separated, sorted list.
//! Its output is not a value it could consume again, so it is declared
//! non-associative and never combined.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use bytes::Bytes;

use common::utils::string_from_bytes;
use common::{KeyValue, MapOutput, Record, TaskContext, Workload};

pub fn workload() -> Workload {
    Workload {
        name: "distinct",
        map_fn: map,
        reduce_fn: reduce,
        combine_fn: None,
        setup_fn: None,
        cleanup_fn: None,
        reduce_associative: false,
    }
}

pub fn map(record: Record, _ctx: &TaskContext) -> MapOutput {
    let line = string_from_bytes(record.line)?;
    let (key, value) = line
        .trim()
        .split_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("expected `key value`, got `{line}`"))?;
    let kv = KeyValue::new(key.to_string(), value.trim().to_string());
    Ok(Box::new(std::iter::once(Ok::<KeyValue, anyhow::Error>(kv))))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Vec<KeyValue>> {
    let distinct: BTreeSet<Bytes> = values.collect();
    let joined = distinct
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    Ok(vec![KeyValue::new(key, joined)])
}
