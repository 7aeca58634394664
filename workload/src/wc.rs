//! Word count.

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info};

use common::utils::{string_from_bytes, sum_counts};
use common::{KeyValue, MapOutput, Record, TaskContext, Workload};

/// Words at or above this count are logged by the reducer.
const HIGH_FREQUENCY: u64 = 100;

pub const PROCESSED_WORDS: &str = "wc.PROCESSED_WORDS";

pub fn workload() -> Workload {
    Workload {
        name: "wc",
        map_fn: map,
        reduce_fn: reduce,
        combine_fn: Some(combine),
        setup_fn: Some(setup),
        cleanup_fn: Some(cleanup),
        reduce_associative: true,
    }
}

/// Keep ASCII letters and digits only.
fn clean_word(word: &str) -> String {
    word.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

pub fn map(record: Record, _ctx: &TaskContext) -> MapOutput {
    let line = string_from_bytes(record.line)?.to_lowercase();

    let words: Vec<String> = line
        .split_whitespace()
        .map(clean_word)
        .filter(|w| w.len() >= 2)
        .collect();

    let iter = words
        .into_iter()
        .map(|word| -> Result<KeyValue> { Ok(KeyValue::new(word, Bytes::from_static(b"1"))) });
    Ok(Box::new(iter))
}

fn sum(values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<u64> {
    sum_counts(values)
}

pub fn combine(
    _key: &Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Bytes> {
    Ok(Bytes::from(sum(values)?.to_string()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &TaskContext,
) -> Result<Vec<KeyValue>> {
    let count = sum(values)?;
    ctx.incr(PROCESSED_WORDS, 1);

    if count >= HIGH_FREQUENCY {
        info!(
            "High frequency word found: {} -> count: {}",
            String::from_utf8_lossy(&key),
            count
        );
    } else {
        debug!("Reduced word: {} -> count: {}", String::from_utf8_lossy(&key), count);
    }

    Ok(vec![KeyValue::new(key, count.to_string())])
}

fn setup(ctx: &TaskContext) -> Result<()> {
    info!("word count started for task: {}", ctx.task);
    Ok(())
}

fn cleanup(ctx: &TaskContext) -> Result<()> {
    let processed = ctx.counters.get(PROCESSED_WORDS);
    if processed > 0 {
        info!(
            "word count completed for task: {}, processed {} unique words",
            ctx.task, processed
        );
    } else {
        info!("word count completed for task: {}", ctx.task);
    }
    Ok(())
}
