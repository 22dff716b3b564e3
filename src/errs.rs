// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    io,
    path::PathBuf,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("os i/o error")]
    Io(#[from] io::Error),
    #[error("{path}: invalid run: {reason}")]
    InvalidRun { path: PathBuf, reason: String },
    #[error("out of memory: failed to allocate {size} bytes for {context}")]
    OutOfMemory { size: usize, context: &'static str },
    #[error("read task pool: {0}")]
    TaskPool(&'static str),
    #[error("error injection: {0}")]
    Injected(&'static str),
}

impl RunError {
    pub(crate) fn invalid_run(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RunError::InvalidRun {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
