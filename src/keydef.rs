// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::cmp::Ordering;

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use xxhash_rust::xxh3::xxh3_64;

const FIELD_UINT: u8 = 0;
const FIELD_STR: u8 = 1;

/// A single typed field of a statement or a search key.
///
/// Fields order by type tag first, then by value, so runs written with
/// mixed-type keys still sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Uint(u64),
    Str(Bytes),
}

impl Field {
    fn tag(&self) -> u8 {
        match self {
            | Field::Uint(_) => FIELD_UINT,
            | Field::Str(_) => FIELD_STR,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            | Field::Uint(v) => buf.put_u64_le(*v),
            | Field::Str(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s);
            },
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Option<Field> {
        if buf.remaining() < 1 {
            return None;
        }
        match buf.get_u8() {
            | FIELD_UINT => {
                if buf.remaining() < size_of::<u64>() {
                    return None;
                }
                Some(Field::Uint(buf.get_u64_le()))
            },
            | FIELD_STR => {
                if buf.remaining() < size_of::<u32>() {
                    return None;
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return None;
                }
                Some(Field::Str(buf.copy_to_bytes(len)))
            },
            | _ => None,
        }
    }
}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            | (Field::Uint(a), Field::Uint(b)) => a.cmp(b),
            | (Field::Str(a), Field::Str(b)) => a.as_ref().cmp(b.as_ref()),
            | (a, b) => a.tag().cmp(&b.tag()),
        }
    }
}

/// Encode a key (a field sequence) into its canonical byte form:
/// a one-byte part count followed by the encoded parts.
///
/// The canonical form is what min/max keys and slice bounds look like on
/// disk, and what the bloom filter hashes.
pub fn encode_key(parts: &[Field]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(parts.len() as u8);
    for part in parts {
        part.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode a canonical key. Returns `None` on any truncation or unknown
/// field tag; callers map that to a corruption error with file context.
pub fn decode_key(mut raw: Bytes) -> Option<Vec<Field>> {
    if raw.remaining() < 1 {
        return None;
    }
    let count = raw.get_u8() as usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        parts.push(Field::decode(&mut raw)?);
    }
    if raw.has_remaining() {
        return None;
    }
    Some(parts)
}

/// An injected key comparator: how many leading fields of a statement
/// form the key, and how to order two keys.
///
/// Two instances usually travel together: the index comparator (which
/// includes tie-breaking parts) and the user-visible one (which drives
/// bloom hashing and EQ termination). A key with fewer parts than
/// `part_count` is a prefix and compares as a range boundary: only the
/// common prefix participates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    part_count: usize,
}

impl KeyDef {
    pub fn new(part_count: usize) -> Self {
        assert!(part_count > 0, "a key needs at least one part");
        KeyDef { part_count }
    }

    #[inline]
    pub fn part_count(&self) -> usize {
        self.part_count
    }

    /// Compare two keys, either of which may be a prefix.
    pub fn compare_keys(&self, a: &[Field], b: &[Field]) -> Ordering {
        let n = self.part_count.min(a.len()).min(b.len());
        for i in 0..n {
            match a[i].cmp(&b[i]) {
                | Ordering::Equal => continue,
                | other => return other,
            }
        }
        Ordering::Equal
    }

    /// Compare the key projections of two full statements.
    pub fn compare(&self, a: &[Field], b: &[Field]) -> Ordering {
        debug_assert!(a.len() >= self.part_count && b.len() >= self.part_count);
        self.compare_keys(a, b)
    }

    /// True when `key` carries every part this definition orders by.
    #[inline]
    pub fn is_complete(&self, key: &[Field]) -> bool {
        key.len() >= self.part_count
    }

    /// Hash the key projection of `fields` for bloom probes. Tuples and
    /// select keys normalise through the same canonical encoding, so a
    /// key hashed at query time matches the hash stored at write time.
    pub fn hash_key(&self, fields: &[Field]) -> u64 {
        debug_assert!(self.is_complete(fields));
        xxh3_64(&encode_key(&fields[..self.part_count]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uints(vals: &[u64]) -> Vec<Field> {
        vals.iter().map(|v| Field::Uint(*v)).collect()
    }

    #[test]
    fn test_field_ordering() {
        assert!(Field::Uint(1) < Field::Uint(2));
        assert!(Field::Str(Bytes::from("a")) < Field::Str(Bytes::from("b")));
        // uints order before strings
        assert!(Field::Uint(u64::MAX) < Field::Str(Bytes::from("")));
    }

    #[test]
    fn test_key_roundtrip() {
        let key = vec![
            Field::Uint(42),
            Field::Str(Bytes::from("answer")),
            Field::Uint(0),
        ];
        let encoded = encode_key(&key);
        assert_eq!(decode_key(encoded).unwrap(), key);
    }

    #[test]
    fn test_key_decode_rejects_truncation() {
        let key = vec![Field::Uint(7), Field::Str(Bytes::from("tail"))];
        let encoded = encode_key(&key);
        for cut in 1..encoded.len() {
            assert!(decode_key(encoded.slice(..cut)).is_none());
        }
    }

    #[test]
    fn test_key_decode_rejects_trailing_bytes() {
        let mut raw = BytesMut::from(encode_key(&uints(&[1])).as_ref());
        raw.put_u8(0xff);
        assert!(decode_key(raw.freeze()).is_none());
    }

    #[test]
    fn test_prefix_compare() {
        let def = KeyDef::new(3);
        // a prefix matches every key sharing it
        assert_eq!(
            def.compare_keys(&uints(&[1]), &uints(&[1, 2, 3])),
            Ordering::Equal
        );
        assert_eq!(
            def.compare_keys(&uints(&[1, 2]), &uints(&[1, 3, 0])),
            Ordering::Less
        );
        // parts beyond part_count never participate
        assert_eq!(
            def.compare_keys(&uints(&[1, 2, 3, 4]), &uints(&[1, 2, 3, 9])),
            Ordering::Equal
        );
    }

    #[test]
    fn test_hash_matches_between_tuple_and_select_key() {
        let def = KeyDef::new(2);
        let tuple = uints(&[10, 20, 30]);
        let select = uints(&[10, 20]);
        assert_eq!(def.hash_key(&tuple), def.hash_key(&select));
    }
}
