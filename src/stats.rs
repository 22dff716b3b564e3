// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::{
    atomic::AtomicU64,
    LazyLock,
};

pub static STATS: LazyLock<Stats> = LazyLock::new(Stats::default);

/// Process-wide read-path counters. Purely advisory; readers never
/// synchronise through them.
#[derive(Debug, Default)]
pub struct Stats {
    /// Iterator seeks that reached the page search.
    pub lookup_count: AtomicU64,
    /// Position advances across all iterators.
    pub step_count: AtomicU64,
    /// Point lookups rejected by a bloom filter.
    pub bloom_reflections: AtomicU64,
    /// Pages materialised from disk (cache misses).
    pub pages_read: AtomicU64,
}
