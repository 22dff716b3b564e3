// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The on-disk run reader of the RubidiumDB LSM engine.
//!
//! A *run* is an immutable, sorted, zstd-compressed file of keyed
//! statements produced by memtable flushes and compactions, indexed by
//! a sibling metadata file and fronted by a bloom filter. A *slice* is
//! the half-open key window `[begin, end)` over a run that an LSM range
//! currently exposes. This crate decodes run files into metadata,
//! materialises pages on demand, and serves ordered, MVCC-filtered
//! iterators and linear compaction streams over slices.
//!
//! The write path of the engine (flush, compaction scheduling, the
//! in-memory tree, WAL) lives elsewhere; the reader only consumes what
//! it produced.

/// Probabilistic point-membership filter over a run's key set.
pub mod bloom;
/// Thread-local decompression state and the off-thread read pool.
pub mod env;
/// Fault-injection hooks for the read path.
#[cfg(any(test, feature = "errinj"))]
pub mod errinj;
pub mod errs;
/// Seek-by-key iterator over a slice.
pub mod iterator;
/// Typed fields and the injected key comparator.
pub mod keydef;
/// Run and page metadata with their on-disk codecs.
pub mod meta;
/// Materialised pages and the page read path.
pub mod page;
/// MVCC snapshot handle.
pub mod readview;
/// Parsing run and index files into open runs.
pub mod recovery;
pub mod run;
pub mod slice;
/// Process-wide read counters.
pub mod stats;
/// Reference-counted statements.
pub mod stmt;
/// Linear compaction scan over a slice.
pub mod stream;

mod xlog;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use bloom::Bloom;
pub use env::{
    RunEnv,
    RunEnvRef,
};
pub use errs::{
    Result,
    RunError,
};
pub use iterator::{
    IteratorType,
    Restore,
    RunIterator,
};
pub use keydef::{
    Field,
    KeyDef,
};
pub use meta::{
    PageInfo,
    RunInfo,
};
pub use page::Page;
pub use readview::ReadView;
pub use run::{
    Run,
    RunRef,
};
pub use slice::{
    Slice,
    SliceRef,
};
pub use stmt::{
    Statement,
    StmtKind,
    StmtRef,
};
pub use stream::SliceStream;
