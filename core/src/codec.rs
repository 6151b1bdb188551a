//! Wire formats for persisted records.
//!
//! Everything in the store is length-prefixed with unsigned LEB128 varints.
//! The node record layout is:
//!
//! ```text
//! varint(has_value)                      -- 0 or 1
//! if has_value: varint(len) || value_digest
//! varint(child_count)
//! for each child, token ascending:
//!     varint(token)
//!     varint(compressed_key.token_length) || packed_bytes
//!     child_id (32 bytes)
//!     byte(child_has_value)
//! ```
//!
//! Decoding is strict: trailing bytes, overlong varints, and out-of-range
//! tokens are all errors. A record that fails to decode indicates a corrupt
//! store, never a recoverable condition.

use crate::key::{byte_count, Key};
use crate::node::{Child, ChildTable, Node, NodeId};
use std::fmt;

/// Why a persisted record failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended in the middle of a field.
    UnexpectedEnd,
    /// A varint was longer than 10 bytes or did not fit in 64 bits.
    InvalidVarint,
    /// Bytes remained after the last field.
    TrailingBytes,
    /// A child token was outside the branch factor's alphabet.
    InvalidToken,
    /// A flag byte held something other than 0 or 1.
    InvalidBool,
    /// A length prefix was implausibly large for its field.
    InvalidLength,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            DecodeError::UnexpectedEnd => "unexpected end of record",
            DecodeError::InvalidVarint => "invalid varint",
            DecodeError::TrailingBytes => "trailing bytes after record",
            DecodeError::InvalidToken => "child token out of range",
            DecodeError::InvalidBool => "invalid boolean byte",
            DecodeError::InvalidLength => "implausible length prefix",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DecodeError {}

/// Append `x` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push(x as u8 | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

/// Read an unsigned LEB128 varint at `*pos`, advancing it.
pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(DecodeError::UnexpectedEnd)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(DecodeError::InvalidVarint);
        }
        x |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(x);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::InvalidVarint);
        }
    }
}

/// Append a key: `varint(token_length) || packed_bytes`.
pub fn put_key(buf: &mut Vec<u8>, key: &Key) {
    put_uvarint(buf, key.len() as u64);
    buf.extend_from_slice(key.bytes());
}

/// Read a key written by [`put_key`].
pub fn read_key(buf: &[u8], pos: &mut usize, token_size: usize) -> Result<Key, DecodeError> {
    let tokens = read_uvarint(buf, pos)?;
    let tokens = usize::try_from(tokens).map_err(|_| DecodeError::InvalidLength)?;
    let nbytes = byte_count(tokens, token_size);
    let packed = buf
        .get(*pos..*pos + nbytes)
        .ok_or(DecodeError::UnexpectedEnd)?;
    *pos += nbytes;
    let mut key = Key::from_bytes(packed, token_size);
    // from_bytes spans whole bytes; shorten to the recorded token count.
    if key.len() < tokens {
        return Err(DecodeError::InvalidLength);
    }
    key = key.take(tokens, token_size);
    Ok(key)
}

fn read_bool(buf: &[u8], pos: &mut usize) -> Result<bool, DecodeError> {
    match buf.get(*pos) {
        Some(0) => {
            *pos += 1;
            Ok(false)
        }
        Some(1) => {
            *pos += 1;
            Ok(true)
        }
        Some(_) => Err(DecodeError::InvalidBool),
        None => Err(DecodeError::UnexpectedEnd),
    }
}

fn read_id(buf: &[u8], pos: &mut usize) -> Result<NodeId, DecodeError> {
    let bytes = buf
        .get(*pos..*pos + 32)
        .ok_or(DecodeError::UnexpectedEnd)?;
    *pos += 32;
    // UNWRAP: the slice is exactly 32 bytes long.
    Ok(bytes.try_into().unwrap())
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, DecodeError> {
    let len = read_uvarint(buf, pos)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
    let bytes = buf
        .get(*pos..*pos + len)
        .ok_or(DecodeError::UnexpectedEnd)?;
    *pos += len;
    Ok(bytes.to_vec())
}

fn put_maybe_bytes(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            buf.push(1);
            put_bytes(buf, bytes);
        }
        None => buf.push(0),
    }
}

fn read_maybe_bytes(buf: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, DecodeError> {
    if read_bool(buf, pos)? {
        Ok(Some(read_bytes(buf, pos)?))
    } else {
        Ok(None)
    }
}

/// Encode a node record. Every child id must be concrete.
pub fn encode_node(node: &Node) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + node.children.len() * 48);
    match &node.value_digest {
        Some(digest) => {
            put_uvarint(&mut buf, 1);
            put_bytes(&mut buf, digest);
        }
        None => put_uvarint(&mut buf, 0),
    }
    put_uvarint(&mut buf, node.children.len() as u64);
    for (token, child) in &node.children {
        put_uvarint(&mut buf, *token as u64);
        put_key(&mut buf, &child.compressed_key);
        // UNWRAP: nodes are persisted only after id calculation.
        buf.extend_from_slice(child.id.as_ref().unwrap());
        buf.push(child.has_value as u8);
    }
    buf
}

/// Decode a node record written by [`encode_node`].
pub fn decode_node(buf: &[u8], token_size: usize) -> Result<Node, DecodeError> {
    let mut pos = 0;
    let value_digest = match read_uvarint(buf, &mut pos)? {
        0 => None,
        1 => {
            let digest = read_bytes(buf, &mut pos)?;
            if digest.len() > 32 {
                return Err(DecodeError::InvalidLength);
            }
            Some(digest)
        }
        _ => return Err(DecodeError::InvalidBool),
    };

    let child_count = read_uvarint(buf, &mut pos)?;
    if child_count > 1 << 8 {
        return Err(DecodeError::InvalidLength);
    }
    let mut children = ChildTable::new();
    let mut prev_token: Option<u8> = None;
    for _ in 0..child_count {
        let token = read_uvarint(buf, &mut pos)?;
        if token >> token_size != 0 {
            return Err(DecodeError::InvalidToken);
        }
        let token = token as u8;
        // enforce the ascending, duplicate-free order the encoder writes
        if prev_token.map_or(false, |prev| prev >= token) {
            return Err(DecodeError::InvalidToken);
        }
        prev_token = Some(token);
        let compressed_key = read_key(buf, &mut pos, token_size)?;
        let id = read_id(buf, &mut pos)?;
        let has_value = read_bool(buf, &mut pos)?;
        children.insert(
            token,
            Child {
                compressed_key,
                id: Some(id),
                has_value,
            },
        );
    }

    if pos != buf.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(Node {
        value_digest,
        children,
    })
}

/// One key's before/after record inside a change summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    /// The key whose value changed.
    pub key: Key,
    /// The value before the commit, if any.
    pub before: Option<Vec<u8>>,
    /// The value after the commit, if any.
    pub after: Option<Vec<u8>>,
}

/// Encode a change summary: the root it produced plus its value deltas.
pub fn encode_summary(root_id: &NodeId, entries: &[SummaryEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40 + entries.len() * 24);
    buf.extend_from_slice(root_id);
    put_uvarint(&mut buf, entries.len() as u64);
    for entry in entries {
        put_key(&mut buf, &entry.key);
        put_maybe_bytes(&mut buf, entry.before.as_deref());
        put_maybe_bytes(&mut buf, entry.after.as_deref());
    }
    buf
}

/// Decode a change summary written by [`encode_summary`].
pub fn decode_summary(
    buf: &[u8],
    token_size: usize,
) -> Result<(NodeId, Vec<SummaryEntry>), DecodeError> {
    let mut pos = 0;
    let root_id = read_id(buf, &mut pos)?;
    let count = read_uvarint(buf, &mut pos)?;
    let count = usize::try_from(count).map_err(|_| DecodeError::InvalidLength)?;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = read_key(buf, &mut pos, token_size)?;
        let before = read_maybe_bytes(buf, &mut pos)?;
        let after = read_maybe_bytes(buf, &mut pos)?;
        entries.push(SummaryEntry { key, before, after });
    }
    if pos != buf.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok((root_id, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    const TS: usize = 4;

    #[test]
    fn uvarint_round_trip() {
        for x in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, x);
            let mut pos = 0;
            assert_eq!(read_uvarint(&buf, &mut pos), Ok(x));
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn uvarint_rejects_truncation_and_overflow() {
        let mut pos = 0;
        assert_eq!(
            read_uvarint(&[0x80, 0x80], &mut pos),
            Err(DecodeError::UnexpectedEnd)
        );
        let mut pos = 0;
        assert_eq!(
            read_uvarint(&[0xff; 11], &mut pos),
            Err(DecodeError::InvalidVarint)
        );
        // u64::MAX + 1 in LEB128: ten bytes ending with 2
        let mut pos = 0;
        let mut buf = vec![0xffu8; 9];
        buf.push(0x02);
        assert_eq!(read_uvarint(&buf, &mut pos), Err(DecodeError::InvalidVarint));
    }

    quickcheck! {
        fn uvarint_any_value_round_trips(x: u64) -> bool {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, x);
            let mut pos = 0;
            read_uvarint(&buf, &mut pos) == Ok(x) && pos == buf.len()
        }
    }

    #[test]
    fn key_round_trip_partial_byte() {
        let key = Key::from_bytes(&[0xab, 0xcd], TS).take(3, TS);
        let mut buf = Vec::new();
        put_key(&mut buf, &key);
        let mut pos = 0;
        assert_eq!(read_key(&buf, &mut pos, TS), Ok(key));
        assert_eq!(pos, buf.len());
    }

    fn sample_node() -> Node {
        let mut children = ChildTable::new();
        children.insert(
            0x2,
            Child {
                compressed_key: Key::from_bytes(&[0x5a], TS).take(1, TS),
                id: Some([3; 32]),
                has_value: true,
            },
        );
        children.insert(
            0xf,
            Child {
                compressed_key: Key::empty(),
                id: Some([9; 32]),
                has_value: false,
            },
        );
        Node {
            value_digest: Some(b"short".to_vec()),
            children,
        }
    }

    #[test]
    fn node_round_trip() {
        let node = sample_node();
        let encoded = encode_node(&node);
        assert_eq!(decode_node(&encoded, TS), Ok(node));

        let empty = Node::default();
        assert_eq!(decode_node(&encode_node(&empty), TS), Ok(empty));
    }

    #[test]
    fn node_decode_rejects_malformed() {
        let node = sample_node();
        let encoded = encode_node(&node);

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert_eq!(decode_node(&trailing, TS), Err(DecodeError::TrailingBytes));

        let truncated = &encoded[..encoded.len() - 1];
        assert!(decode_node(truncated, TS).is_err());

        // a token outside the nibble alphabet
        assert_eq!(
            decode_node(&encoded, 1).unwrap_err(),
            DecodeError::InvalidToken,
        );
    }

    #[test]
    fn summary_round_trip() {
        let entries = vec![
            SummaryEntry {
                key: Key::from_bytes(b"ab", TS),
                before: None,
                after: Some(b"1".to_vec()),
            },
            SummaryEntry {
                key: Key::from_bytes(b"cd", TS),
                before: Some(b"2".to_vec()),
                after: None,
            },
        ];
        let encoded = encode_summary(&[7; 32], &entries);
        assert_eq!(decode_summary(&encoded, TS), Ok(([7; 32], entries)));
    }
}
