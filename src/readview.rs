// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

/// An MVCC snapshot cutoff handed in by the transaction manager: a read
/// through this view must only observe statements with `lsn <= vlsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    vlsn: i64,
}

impl ReadView {
    /// A view that sees every committed version.
    pub const MAX: ReadView = ReadView { vlsn: i64::MAX };

    pub fn new(vlsn: i64) -> Self {
        ReadView { vlsn }
    }

    #[inline]
    pub fn vlsn(&self) -> i64 {
        self.vlsn
    }
}
