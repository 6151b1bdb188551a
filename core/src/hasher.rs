//! Deterministic subtree hashing.
//!
//! The id of a node is the SHA-256 of a canonical encoding of its key, its
//! value digest, and its child table in ascending token order:
//!
//! ```text
//! sha256(
//!     varint(child_count)
//!     for each child, token ascending:
//!         varint(token) || key(compressed_key) || id || byte(has_value)
//!     byte(value_present) || [ varint(len(digest)) || digest ]
//!     key(node_key)
//! )
//! ```
//!
//! where `key(k)` is `varint(token_length) || packed_bytes`. Any two
//! implementations producing the same `(key, value, children)` triple must
//! produce byte-identical hash input.

use crate::codec;
use crate::key::Key;
use crate::node::{ChildTable, NodeId};
use sha2::{Digest, Sha256};

/// Values shorter than this many bytes stand in for their own digest.
pub const MAX_INLINE_VALUE_LEN: usize = 32;

/// The digest of a value as it appears in node hashes and proof nodes: the
/// raw bytes if shorter than 32, otherwise the SHA-256 of the value. Proof
/// nodes can therefore omit long values without losing authenticity.
pub fn value_digest(value: &[u8]) -> Vec<u8> {
    if value.len() < MAX_INLINE_VALUE_LEN {
        value.to_vec()
    } else {
        Sha256::digest(value).to_vec()
    }
}

/// Compute the id of the node at `key` with the given value digest and
/// child table. All child ids must be concrete.
pub fn hash_node(key: &Key, value_digest: Option<&[u8]>, children: &ChildTable) -> NodeId {
    let mut buf = Vec::with_capacity(64 + children.len() * 48);

    codec::put_uvarint(&mut buf, children.len() as u64);
    for (token, child) in children {
        codec::put_uvarint(&mut buf, *token as u64);
        codec::put_key(&mut buf, &child.compressed_key);
        // UNWRAP: callers resolve every child id before hashing.
        buf.extend_from_slice(child.id.as_ref().unwrap());
        buf.push(child.has_value as u8);
    }

    match value_digest {
        Some(digest) => {
            buf.push(1);
            codec::put_uvarint(&mut buf, digest.len() as u64);
            buf.extend_from_slice(digest);
        }
        None => buf.push(0),
    }

    codec::put_key(&mut buf, key);
    Sha256::digest(&buf).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Child;

    const TS: usize = 4;

    #[test]
    fn short_values_are_their_own_digest() {
        assert_eq!(value_digest(b"abc"), b"abc".to_vec());
        assert_eq!(value_digest(&[]), Vec::<u8>::new());
        let long = vec![7u8; 32];
        let digest = value_digest(&long);
        assert_eq!(digest.len(), 32);
        assert_ne!(digest, long);
        assert_eq!(value_digest(&vec![7u8; 31]), vec![7u8; 31]);
    }

    #[test]
    fn hash_depends_on_every_field() {
        let key = Key::from_bytes(&[0xab], TS);
        let mut children = ChildTable::new();
        children.insert(
            3,
            Child {
                compressed_key: Key::from_bytes(&[0xcd], TS),
                id: Some([1; 32]),
                has_value: false,
            },
        );

        let base = hash_node(&key, Some(b"v"), &children);

        assert_ne!(base, hash_node(&key, Some(b"w"), &children));
        assert_ne!(base, hash_node(&key, None, &children));
        assert_ne!(base, hash_node(&Key::from_bytes(&[0xac], TS), Some(b"v"), &children));

        let mut tampered = children.clone();
        tampered.get_mut(&3).unwrap().id = Some([2; 32]);
        assert_ne!(base, hash_node(&key, Some(b"v"), &tampered));

        let mut tampered = children.clone();
        tampered.get_mut(&3).unwrap().has_value = true;
        assert_ne!(base, hash_node(&key, Some(b"v"), &tampered));

        let mut tampered = children.clone();
        tampered.get_mut(&3).unwrap().compressed_key = Key::from_bytes(&[0xce], TS);
        assert_ne!(base, hash_node(&key, Some(b"v"), &tampered));
    }

    #[test]
    fn partial_and_whole_byte_keys_hash_differently() {
        // 0xa0 as one token vs. two: same packed bytes, different lengths.
        let one = Key::from_bytes(&[0xa0], TS).take(1, TS);
        let two = Key::from_bytes(&[0xa0], TS);
        let children = ChildTable::new();
        assert_ne!(hash_node(&one, None, &children), hash_node(&two, None, &children));
    }
}
