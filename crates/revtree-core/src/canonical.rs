//! Canonical CBOR encoding for document bodies, and the per-document digest.
//!
//! Two peers must hash the same document to the same digest regardless of
//! how their storage happened to order map entries. The encoding follows
//! RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//!
//! Floats deviate from the preferred-serialization rule and are always
//! written as 64-bit, which is still deterministic.

use ciborium::value::Value;

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::types::RevisionId;

/// Domain separator for per-document digests.
pub const DOCUMENT_DOMAIN: &[u8] = b"revtree-doc-v1:";

/// Encode a CBOR value to canonical bytes.
pub fn canonical_value_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value)?;
    Ok(buf)
}

/// Digest of one document revision.
///
/// `BLAKE3(domain || rev (u64 BE) || len(key) (u64 BE) || key || canonical(body))`
pub fn document_digest(rev: RevisionId, key: &str, body: &Value) -> Result<Digest> {
    let body_bytes = canonical_value_bytes(body)?;
    Ok(document_digest_from_canonical(rev, key, &body_bytes))
}

/// Digest of one document revision whose body is already canonical.
pub fn document_digest_from_canonical(rev: RevisionId, key: &str, body: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DOCUMENT_DOMAIN);
    hasher.update(&rev.to_be_bytes());
    hasher.update(&(key.len() as u64).to_be_bytes());
    hasher.update(key.as_bytes());
    hasher.update(body);
    Digest(*hasher.finalize().as_bytes())
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr)?,
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner)?;
        }
        other => {
            return Err(CoreError::EncodingError(format!(
                "unsupported CBOR value: {other:?}"
            )))
        }
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) -> Result<()> {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item)?;
    }
    Ok(())
}

/// Encode a map with keys sorted by their encoded bytes.
///
/// Duplicate keys are rejected: they would make the digest depend on which
/// entry a reader keeps.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<()> {
    let mut pairs: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let mut key_buf = Vec::new();
        encode_value_to(&mut key_buf, k)?;
        pairs.push((key_buf, v));
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(CoreError::EncodingError("duplicate map key".into()));
    }

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();

        encode_uint(&mut buf, 0, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_integer(&mut buf, (-1i64).into());
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_order_does_not_matter() {
        let a = Value::Map(vec![
            (text("name"), text("User1")),
            (text("age"), Value::Integer(7.into())),
        ]);
        let b = Value::Map(vec![
            (text("age"), Value::Integer(7.into())),
            (text("name"), text("User1")),
        ]);
        assert_eq!(
            canonical_value_bytes(&a).unwrap(),
            canonical_value_bytes(&b).unwrap()
        );
    }

    #[test]
    fn test_map_key_ordering() {
        let entries = vec![
            (Value::Integer(8.into()), Value::Integer(80.into())),
            (Value::Integer(0.into()), Value::Integer(0.into())),
            (Value::Integer(5.into()), Value::Integer(50.into())),
        ];
        let bytes = canonical_value_bytes(&Value::Map(entries)).unwrap();

        assert_eq!(bytes[0], 0xa3);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[3], 0x05);
        assert_eq!(bytes[6], 0x08);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let value = Value::Map(vec![(text("a"), Value::Null), (text("a"), Value::Bool(true))]);
        assert!(canonical_value_bytes(&value).is_err());
    }

    #[test]
    fn test_float_is_eight_bytes() {
        let bytes = canonical_value_bytes(&Value::Float(1.5)).unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 0xfb);
    }

    #[test]
    fn test_digest_depends_on_rev_key_and_body() {
        let body = Value::Map(vec![(text("age"), Value::Integer(1.into()))]);
        let base = document_digest(RevisionId(10), "k", &body).unwrap();

        assert_eq!(base, document_digest(RevisionId(10), "k", &body).unwrap());
        assert_ne!(base, document_digest(RevisionId(11), "k", &body).unwrap());
        assert_ne!(base, document_digest(RevisionId(10), "j", &body).unwrap());

        let other = Value::Map(vec![(text("age"), Value::Integer(2.into()))]);
        assert_ne!(base, document_digest(RevisionId(10), "k", &other).unwrap());
    }
}
