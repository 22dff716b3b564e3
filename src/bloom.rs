// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Fixed-size bloom filter over a run's key space.
//!
//! The filter accelerates exact-match lookups only: an `EQ` search with
//! a complete key probes the filter before touching any page. The error
//! is one-sided — a negative answer proves the key is absent.

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

use crate::errs::{
    Result,
    RunError,
};

/// Bump when the probe sequence or table layout changes. A mismatch on
/// decode is a hard error: probing with the wrong sequence would turn
/// the one-sided error into silent lost reads.
pub(crate) const BLOOM_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bloom {
    /// Table size in bits.
    table_size: u64,
    hash_count: u32,
    table: Box<[u8]>,
}

impl Bloom {
    /// Size a filter for an expected item count and false positive rate.
    pub fn for_items(count: u64, fpr: f64) -> Bloom {
        let count = count.max(1);
        let fpr = fpr.clamp(1e-6, 0.5);
        // m = -n * ln(p) / ln(2)^2, k = m/n * ln(2)
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(count as f64) * fpr.ln() / (ln2 * ln2)).ceil().max(64.0);
        let table_size = (bits as u64).next_multiple_of(8);
        let hash_count = ((table_size as f64 / count as f64) * ln2).round().max(1.0) as u32;
        Bloom {
            table_size,
            hash_count,
            table: vec![0u8; (table_size / 8) as usize].into_boxed_slice(),
        }
    }

    #[inline]
    fn probes(&self, hash: u64) -> impl Iterator<Item = u64> + '_ {
        // double hashing: the low and high halves of one 64-bit hash
        // seed the probe sequence
        let h1 = hash;
        let h2 = (hash >> 32) | 1;
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.table_size)
    }

    pub fn add(&mut self, hash: u64) {
        let h1 = hash;
        let h2 = (hash >> 32) | 1;
        for i in 0..self.hash_count as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.table_size;
            self.table[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// True if the key behind `hash` may be present; false proves it is
    /// not.
    pub fn possibly_has(&self, hash: u64) -> bool {
        self.probes(hash)
            .all(|bit| self.table[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Serialised form: a 4-element array
    /// `[version, table_size_bits, hash_count, table_blob]`.
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 4 + 8 + 4 + 4 + self.table.len());
        buf.put_u8(4);
        buf.put_u32_le(BLOOM_VERSION);
        buf.put_u64_le(self.table_size);
        buf.put_u32_le(self.hash_count);
        buf.put_u32_le(self.table.len() as u32);
        buf.put_slice(&self.table);
        buf.freeze()
    }

    pub(crate) fn decode(mut raw: Bytes) -> Result<Bloom> {
        let corrupt = |reason: &str| RunError::invalid_run("<bloom>", reason);

        if raw.remaining() < 1 {
            return Err(corrupt("truncated bloom meta"));
        }
        let array_size = raw.get_u8();
        if array_size != 4 {
            return Err(corrupt(&format!(
                "wrong bloom array size (expected 4, got {array_size})"
            )));
        }
        if raw.remaining() < 4 + 8 + 4 + 4 {
            return Err(corrupt("truncated bloom meta"));
        }
        let version = raw.get_u32_le();
        if version != BLOOM_VERSION {
            return Err(corrupt(&format!(
                "wrong bloom version (expected {BLOOM_VERSION}, got {version})"
            )));
        }
        let table_size = raw.get_u64_le();
        let hash_count = raw.get_u32_le();
        let blob_len = raw.get_u32_le() as usize;
        if table_size == 0 || table_size % 8 != 0 || hash_count == 0 {
            return Err(corrupt("malformed bloom geometry"));
        }
        if blob_len as u64 != table_size / 8 || raw.remaining() != blob_len {
            return Err(corrupt(&format!(
                "wrong bloom table size (expected {}, got {blob_len})",
                table_size / 8
            )));
        }

        let mut table = Vec::new();
        table
            .try_reserve_exact(blob_len)
            .map_err(|_| RunError::OutOfMemory {
                size: blob_len,
                context: "bloom table",
            })?;
        table.extend_from_slice(&raw);
        Ok(Bloom {
            table_size,
            hash_count,
            table: table.into_boxed_slice(),
        })
    }
}
