// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Fault-injection points for the read path. Flags are scoped to the
//! calling thread so a test exercising a failure cannot trip reads
//! running elsewhere in the process.

use std::cell::Cell;

use crate::errs::{
    Result,
    RunError,
};

#[derive(Debug, Clone, Copy)]
pub enum ErrInj {
    /// Fail a page read after it fully completed.
    ReadPage = 0,
    /// Stall a page read to widen race windows.
    ReadPageDelay = 1,
}

const FLAG_COUNT: usize = 2;

thread_local! {
    static FLAGS: Cell<[bool; FLAG_COUNT]> = const { Cell::new([false; FLAG_COUNT]) };
}

pub fn set(which: ErrInj, on: bool) {
    FLAGS.with(|flags| {
        let mut current = flags.get();
        current[which as usize] = on;
        flags.set(current);
    });
}

fn is_set(which: ErrInj) -> bool {
    FLAGS.with(|flags| flags.get()[which as usize])
}

pub(crate) fn maybe_fail(which: ErrInj, what: &'static str) -> Result<()> {
    if is_set(which) {
        return Err(RunError::Injected(what));
    }
    Ok(())
}

pub(crate) fn maybe_delay(which: ErrInj) {
    if is_set(which) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}
