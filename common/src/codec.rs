//! Line codec for intermediate (shuffle) data.
//!
//! Every pair is one line, `base64(key) base64(value)\n`, using the URL-safe
//! alphabet so neither field can contain the separator or a newline.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use crate::KeyValue;

pub fn encode_pairs<'a>(pairs: impl IntoIterator<Item = &'a KeyValue>) -> Bytes {
    let mut buf = BytesMut::new();
    for kv in pairs {
        buf.put_slice(URL_SAFE.encode(&kv.key).as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(URL_SAFE.encode(&kv.value).as_bytes());
        buf.put_u8(b'\n');
    }
    buf.freeze()
}

pub fn decode_pairs(data: &[u8]) -> Result<Vec<KeyValue>> {
    let mut pairs = Vec::new();
    for (lineno, line) in data.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let sep = line
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| anyhow!("intermediate line {} has no separator", lineno + 1))?;
        let key = URL_SAFE
            .decode(&line[..sep])
            .map_err(|e| anyhow!("failed decode key on line {}: {e}", lineno + 1))?;
        let value = URL_SAFE
            .decode(&line[sep + 1..])
            .map_err(|e| anyhow!("failed decode value on line {}: {e}", lineno + 1))?;
        pairs.push(KeyValue::new(key, value));
    }
    Ok(pairs)
}

/// Final output lines, `key value\n`.
pub fn encode_output<'a>(records: impl IntoIterator<Item = &'a KeyValue>) -> Bytes {
    let mut buf = BytesMut::new();
    for kv in records {
        buf.put_slice(&kv.key);
        buf.put_u8(b' ');
        buf.put_slice(&kv.value);
        buf.put_u8(b'\n');
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_inside_fields_survive() {
        let pairs = vec![
            KeyValue::new("a key", "line one\nline two"),
            KeyValue::new(Bytes::from_static(&[0xff, 0x00]), ""),
        ];
        let encoded = encode_pairs(&pairs);
        assert_eq!(encoded.iter().filter(|b| **b == b'\n').count(), 2);
        assert_eq!(decode_pairs(&encoded).unwrap(), pairs);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_pairs(b"no-separator-here\n").is_err());
        assert!(decode_pairs(b"!!! ???\n").is_err());
        assert!(decode_pairs(b"").unwrap().is_empty());
    }

    #[test]
    fn output_is_plain_text() {
        let out = encode_output(&[KeyValue::new("hadoop", "200")]);
        assert_eq!(&out[..], b"hadoop 200\n");
    }
}
