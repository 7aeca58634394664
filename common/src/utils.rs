use anyhow::{anyhow, Result};
use bytes::Bytes;

use crate::Record;

pub fn string_from_bytes(bytes: Bytes) -> Result<String> {
    Ok(String::from_utf8(bytes.into())?)
}

/// Parse an ASCII decimal counter value.
pub fn u64_from_bytes(bytes: &[u8]) -> Result<u64> {
    Ok(std::str::from_utf8(bytes)?.trim().parse()?)
}

/// Sum decimal counter values, failing instead of wrapping past `u64::MAX`.
pub fn sum_counts<I>(values: I) -> Result<u64>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut total = 0u64;
    for value in values {
        total = total
            .checked_add(u64_from_bytes(value.as_ref())?)
            .ok_or_else(|| anyhow!("count overflow"))?;
    }
    Ok(total)
}

/// Split an object's contents into line records. A trailing `\r` is dropped
/// and the final line does not need a terminating newline.
pub fn split_records(data: &Bytes) -> Vec<Record> {
    let mut records = Vec::new();
    let mut start = 0usize;
    while start < data.len() {
        let end = data[start..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| start + i)
            .unwrap_or(data.len());
        let mut line_end = end;
        if line_end > start && data[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        records.push(Record::new(start as u64, data.slice(start..line_end)));
        start = end + 1;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_carry_offsets() {
        let data = Bytes::from_static(b"alpha\r\nbeta\n\ngamma");
        let records = split_records(&data);
        let lines: Vec<_> = records.iter().map(|r| &r.line[..]).collect();
        assert_eq!(lines, vec![&b"alpha"[..], b"beta", b"", b"gamma"]);
        assert_eq!(records[1].offset, 7);
        assert_eq!(records[3].offset, 13);
    }

    #[test]
    fn counter_values_parse() {
        assert_eq!(u64_from_bytes(b"42").unwrap(), 42);
        assert!(u64_from_bytes(b"forty-two").is_err());
    }

    #[test]
    fn sum_counts_refuses_to_wrap() {
        assert_eq!(sum_counts([&b"1"[..], b"2", b" 3"]).unwrap(), 6);
        let max = u64::MAX.to_string();
        let err = sum_counts([max.as_bytes(), b"1"]).unwrap_err();
        assert!(err.to_string().contains("count overflow"));
    }
}
