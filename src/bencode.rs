//! Bencode codec: the four bencoded types (integer, byte string, list,
//! dictionary) encoded and decoded to/from a dynamic [`Value`].
//!
//! Unlike `serde_bencode`-style (de)serialization into fixed Rust
//! structs, KRPC envelopes mix shapes per message type and occasionally
//! mix string/byte dictionary keys, so the object model here stays a
//! tagged sum type that every consumer pattern-matches against.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Maximum nesting depth accepted by the decoder. Bounds the recursion
/// so an adversarial input (`llllll...`) can't blow the stack.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("unsupported type for bencode encoding")]
    EncodeTypeError,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed bencode at offset {0}")]
    Malformed(usize),
    #[error("trailing bytes after a complete bencode value")]
    TrailingBytes,
    #[error("nesting depth exceeded {0}")]
    DepthExceeded(usize),
}

/// Encodes a value. Total over every [`Value`] variant, so this never
/// actually fails today, but keeps the `Result` so a future variant
/// (e.g. floats) fails closed instead of panicking.
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes a complete bencode value from `input`. Fails with
/// [`DecodeError::TrailingBytes`] if any byte of `input` is left over.
pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let (value, consumed) = decode_prefix(input, 0)?;
    if consumed != input.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes one value starting at `pos`, returning the value and the
/// number of bytes consumed from the start of `input` (not from `pos`).
pub fn decode_prefix(input: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    decode_value(input, pos, 0)
}

fn decode_value(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::DepthExceeded(MAX_DEPTH));
    }
    let tag = *input.get(pos).ok_or(DecodeError::Malformed(pos))?;
    match tag {
        b'i' => decode_int(input, pos),
        b'0'..=b'9' => decode_bytes(input, pos),
        b'l' => decode_list(input, pos, depth),
        b'd' => decode_dict(input, pos, depth),
        _ => Err(DecodeError::Malformed(pos)),
    }
}

fn decode_int(input: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let start = pos + 1;
    let end = find(input, b'e', start).ok_or(DecodeError::Malformed(pos))?;
    let digits = &input[start..end];
    if digits.is_empty() {
        return Err(DecodeError::Malformed(pos));
    }
    let s = std::str::from_utf8(digits).map_err(|_| DecodeError::Malformed(pos))?;
    let i: i64 = s.parse().map_err(|_| DecodeError::Malformed(pos))?;
    Ok((Value::Int(i), end + 1))
}

fn decode_bytes(input: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let sep = find(input, b':', pos).ok_or(DecodeError::Malformed(pos))?;
    let len_str =
        std::str::from_utf8(&input[pos..sep]).map_err(|_| DecodeError::Malformed(pos))?;
    let len: usize = len_str.parse().map_err(|_| DecodeError::Malformed(pos))?;
    let start = sep + 1;
    let end = start.checked_add(len).ok_or(DecodeError::Malformed(pos))?;
    if end > input.len() {
        return Err(DecodeError::Malformed(pos));
    }
    Ok((Value::Bytes(input[start..end].to_vec()), end))
}

fn decode_list(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    let mut items = Vec::new();
    let mut cur = pos + 1;
    loop {
        match input.get(cur) {
            None => return Err(DecodeError::Malformed(cur)),
            Some(b'e') => return Ok((Value::List(items), cur + 1)),
            Some(_) => {
                let (item, next) = decode_value(input, cur, depth + 1)?;
                items.push(item);
                cur = next;
            }
        }
    }
}

fn decode_dict(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    let mut map = BTreeMap::new();
    let mut cur = pos + 1;
    loop {
        match input.get(cur) {
            None => return Err(DecodeError::Malformed(cur)),
            Some(b'e') => return Ok((Value::Dict(map), cur + 1)),
            Some(_) => {
                let (key, next) = decode_value(input, cur, depth + 1)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => return Err(DecodeError::Malformed(cur)),
                };
                let (val, next) = decode_value(input, next, depth + 1)?;
                map.insert(key, val);
                cur = next;
            }
        }
    }
}

fn find(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..].iter().position(|&b| b == needle).map(|i| i + from)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match encode(self) {
            Ok(bytes) => write!(f, "{}", String::from_utf8_lossy(&bytes)),
            Err(_) => write!(f, "<unencodable bencode value>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dict(pairs: &[(&[u8], Value)]) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_vec(), v.clone());
        }
        Value::Dict(map)
    }

    #[test]
    fn round_trip_int() {
        let v = Value::Int(-42);
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes, b"i-42e");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn round_trip_bytes() {
        let v = Value::bytes(*b"spam");
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes, b"4:spam");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn round_trip_list() {
        let v = Value::List(vec![Value::Int(1), Value::bytes(*b"x")]);
        let bytes = encode(&v).unwrap();
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn scenario_encode_nested_dict() {
        // encode({b"a": 1, b"b": [2, b"xx"]}) == b"d1:ai1e1:bli2e2:xxee"
        let v = dict(&[
            (b"a", Value::Int(1)),
            (b"b", Value::List(vec![Value::Int(2), Value::bytes(*b"xx")])),
        ]);
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes, b"d1:ai1e1:bli2e2:xxee");
    }

    #[test]
    fn negative_int_round_trip() {
        let bytes = encode(&Value::Int(-42)).unwrap();
        assert_eq!(bytes, b"i-42e");
        let decoded = decode(b"i-42e").unwrap();
        assert_eq!(decoded, Value::Int(-42));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let err = decode(b"i1eX").unwrap_err();
        assert_eq!(err, DecodeError::TrailingBytes);
    }

    #[test]
    fn rejects_malformed_with_offset() {
        let err = decode(b"li1e").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut nested = Vec::new();
        for _ in 0..(MAX_DEPTH + 10) {
            nested.push(b'l');
        }
        for _ in 0..(MAX_DEPTH + 10) {
            nested.push(b'e');
        }
        let err = decode(&nested).unwrap_err();
        assert!(matches!(err, DecodeError::DepthExceeded(_)));
    }

    #[test]
    fn dict_keys_sort_lexicographically_on_encode() {
        let v = dict(&[(b"b", Value::Int(2)), (b"a", Value::Int(1))]);
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes, b"d1:ai1e1:bi2ee");
    }
}
