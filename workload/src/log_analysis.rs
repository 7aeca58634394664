//! Request statistics over Apache common-log-format access logs.
//!
//! Every parsed line contributes to `requests`, `bytes`, `ip:<addr>`,
//! `status:<code>` and `method:<verb>`. All values are summed.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use regex::Regex;

use common::utils::{string_from_bytes, sum_counts};
use common::{KeyValue, MapOutput, Record, TaskContext, Workload};

const LOG_PATTERN: &str =
    r#"^(\S+) \S+ \S+ \[([\w:/]+\s[+\-]\d{4})\] "(\S+) (\S+) (\S+)" (\d{3}) (\d+)"#;

pub fn workload() -> Workload {
    Workload {
        name: "log-analysis",
        map_fn: map,
        reduce_fn: reduce,
        combine_fn: Some(combine),
        setup_fn: None,
        cleanup_fn: None,
        reduce_associative: true,
    }
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(LOG_PATTERN).expect("log pattern is a valid regex"))
}

pub fn map(record: Record, _ctx: &TaskContext) -> MapOutput {
    let line = string_from_bytes(record.line)?;
    let caps = pattern()
        .captures(&line)
        .ok_or_else(|| anyhow!("not an access log line: {line}"))?;

    let pairs = vec![
        KeyValue::new("requests", "1"),
        KeyValue::new("bytes", caps[7].to_string()),
        KeyValue::new(format!("ip:{}", &caps[1]), "1"),
        KeyValue::new(format!("status:{}", &caps[6]), "1"),
        KeyValue::new(format!("method:{}", &caps[3]), "1"),
    ];
    Ok(Box::new(pairs.into_iter().map(Ok::<KeyValue, anyhow::Error>)))
}

fn total(values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<u64> {
    sum_counts(values)
}

pub fn combine(
    _key: &Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Bytes> {
    Ok(Bytes::from(total(values)?.to_string()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _ctx: &TaskContext,
) -> Result<Vec<KeyValue>> {
    Ok(vec![KeyValue::new(key, total(values)?.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::task::{Stage, TaskId};
    use common::JobId;

    fn ctx() -> TaskContext {
        let task = TaskId {
            job: JobId::new(1, 1),
            stage: Stage::Map,
            index: 0,
            attempt: 0,
        };
        TaskContext::new(task, Bytes::new())
    }

    #[test]
    fn parses_common_log_format() {
        let line = br#"192.168.1.100 - - [25/Dec/2023:10:00:01 +0800] "GET /index.html HTTP/1.1" 404 512"#;
        let out: Vec<KeyValue> = map(Record::new(0, Bytes::from_static(line)), &ctx())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(out.contains(&KeyValue::new("ip:192.168.1.100", "1")));
        assert!(out.contains(&KeyValue::new("status:404", "1")));
        assert!(out.contains(&KeyValue::new("method:GET", "1")));
        assert!(out.contains(&KeyValue::new("bytes", "512")));
        assert!(out.contains(&KeyValue::new("requests", "1")));
    }

    #[test]
    fn garbage_line_is_malformed() {
        assert!(map(Record::new(0, Bytes::from_static(b"hello")), &ctx()).is_err());
    }

    #[test]
    fn reduce_sums_bytes() {
        let values = vec![Bytes::from("100"), Bytes::from("28")];
        let out = reduce(Bytes::from("bytes"), Box::new(values.into_iter()), &ctx()).unwrap();
        assert_eq!(out, vec![KeyValue::new("bytes", "128")]);
    }

    #[test]
    fn reduce_fails_instead_of_wrapping() {
        let values = vec![Bytes::from(u64::MAX.to_string()), Bytes::from("1")];
        let err = reduce(Bytes::from("bytes"), Box::new(values.into_iter()), &ctx()).unwrap_err();
        assert!(err.to_string().contains("count overflow"));
    }
}
