// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    fs::File,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use tracing::trace;

use crate::{
    errs::{
        Result,
        RunError,
    },
    meta::{
        PageInfo,
        RunInfo,
    },
};

/// An open, immutable run: the data-file descriptor plus its decoded
/// metadata.
///
/// Runs are shared: every slice over the run holds a reference, and the
/// engine's level structure holds one while the run is live. The data
/// file is closed when the last reference drops; the slice pin protocol
/// guarantees no worker still reads from it by then.
#[derive(Debug)]
pub struct Run {
    id: i64,
    path: Arc<PathBuf>,
    info: RunInfo,
    file: Option<File>,
}

pub type RunRef = Arc<Run>;

impl Run {
    pub(crate) fn new(id: i64, path: PathBuf, info: RunInfo, file: Option<File>) -> RunRef {
        Arc::new(Run {
            id,
            path: Arc::new(path),
            info,
            file,
        })
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Path of the data file, for error reporting.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn path_handle(&self) -> Arc<PathBuf> {
        self.path.clone()
    }

    #[inline]
    pub fn page_info(&self, page_no: u32) -> &PageInfo {
        self.info.page(page_no)
    }

    pub(crate) fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            RunError::invalid_run(self.path.as_ref(), "run data file is not open")
        })
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        trace!(run_id = self.id, "closing run");
    }
}
