// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Process-local run-reading environment: thread-local decompression
//! state and the fixed-size pool of off-thread read tasks.

use std::{
    cell::RefCell,
    io,
    sync::Arc,
    thread,
    thread::JoinHandle,
};

use crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
    TrySendError,
};
use parking_lot::Mutex;
use tracing::debug;
use zstd::bulk::Decompressor;

use crate::{
    errs::{
        Result,
        RunError,
    },
    meta::PageInfo,
    page::Page,
    slice::{
        PinGuard,
        SliceRef,
    },
};

/// Workers draining the read queue. Reads are short and the queue is
/// the backpressure mechanism, so a small pool is enough.
const DEFAULT_READ_THREADS: usize = 2;
/// Capacity of the task queue; a full queue means the pool is
/// exhausted and the submit fails rather than blocks.
const DEFAULT_TASK_POOL_SIZE: usize = 128;

thread_local! {
    /// One streaming decompression context per thread, built on first
    /// use. The bulk API resets stream state on every call, so the
    /// context is safely reused across pages.
    static ZDCTX: RefCell<Option<Decompressor<'static>>> = const { RefCell::new(None) };
    /// Scratch for the compressed page frame; wound back after each
    /// read so page loads do not allocate staging memory on the heap.
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Allocate a payload buffer, surfacing allocation failure as an error
/// instead of an abort.
pub(crate) fn alloc_buf(size: usize, context: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| RunError::OutOfMemory { size, context })?;
    Ok(buf)
}

/// Decompress `src` into the spare capacity of `dst` using the calling
/// thread's context. Returns the number of bytes written.
pub(crate) fn decompress_into(src: &[u8], dst: &mut Vec<u8>) -> io::Result<usize> {
    ZDCTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(Decompressor::new()?);
        }
        slot.as_mut().unwrap().decompress_to_buffer(src, dst)
    })
}

/// Run `f` with the thread's staging buffer, winding it back afterward.
pub(crate) fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|cell| {
        let mut buf = cell.borrow_mut();
        let result = f(&mut buf);
        buf.clear();
        result
    })
}

struct ReadTask {
    /// Keeps the slice (and so the run's descriptor) alive for the
    /// whole worker-side read, released when the task is destroyed.
    pin: PinGuard,
    page_no: u32,
    /// Copied by value: the worker never touches shared metadata.
    info: PageInfo,
    reply: Sender<Result<Page>>,
}

/// The run environment: a pool of read workers fed through a bounded
/// queue. Iterators on a transaction thread submit page reads here
/// instead of blocking the whole thread on disk.
pub struct RunEnv {
    tx: Option<Sender<ReadTask>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub type RunEnvRef = Arc<RunEnv>;

impl RunEnv {
    pub fn new() -> RunEnvRef {
        Self::with_options(DEFAULT_READ_THREADS, DEFAULT_TASK_POOL_SIZE)
    }

    pub fn with_options(threads: usize, task_pool_size: usize) -> RunEnvRef {
        let (tx, rx) = bounded::<ReadTask>(task_pool_size);
        let mut workers = Vec::with_capacity(threads);
        for no in 0..threads.max(1) {
            let rx = rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("run-read-{no}"))
                    .spawn(move || read_worker(rx))
                    .expect("failed to spawn read worker"),
            );
        }
        Arc::new(RunEnv {
            tx: Some(tx),
            workers: Mutex::new(workers),
        })
    }

    /// Read a page through the worker pool. The caller blocks on the
    /// reply channel (the suspension point); the slice stays pinned
    /// until the worker is done with the descriptor, even if the read
    /// fails.
    pub(crate) fn submit_read(&self, slice: &SliceRef, page_no: u32) -> Result<Page> {
        let info = slice.run().page_info(page_no).clone();
        let (reply_tx, reply_rx) = bounded(1);
        let task = ReadTask {
            pin: PinGuard::new(slice.clone()),
            page_no,
            info,
            reply: reply_tx,
        };
        let tx = self
            .tx
            .as_ref()
            .ok_or(RunError::TaskPool("pool is shut down"))?;
        tx.try_send(task).map_err(|err| match err {
            | TrySendError::Full(_) => RunError::TaskPool("task pool exhausted"),
            | TrySendError::Disconnected(_) => RunError::TaskPool("pool is shut down"),
        })?;
        reply_rx
            .recv()
            .map_err(|_| RunError::TaskPool("read worker died"))?
    }
}

impl Drop for RunEnv {
    fn drop(&mut self) {
        self.tx = None; // close the queue, workers drain and exit
        for worker in self.workers.get_mut().drain(..) {
            let _ = worker.join();
        }
    }
}

fn read_worker(rx: Receiver<ReadTask>) {
    while let Ok(task) = rx.recv() {
        let result = Page::read(task.page_no, &task.info, task.pin.slice().run());
        if task.reply.send(result).is_err() {
            // requester was cancelled mid-read; the page is dropped and
            // the pin released with the task
            debug!(page_no = task.page_no, "read task cancelled");
        }
    }
}
