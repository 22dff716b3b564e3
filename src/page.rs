// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Materialised pages: the decompressed payload of one run frame plus
//! the per-record offset table decoded from its trailing `PAGE_INDEX`
//! row. Records themselves stay encoded until a position is read.

use std::{
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::{
        atomic::Ordering::Relaxed,
        Arc,
    },
};

use bytes::Bytes;

use crate::{
    env,
    errs::{
        Result,
        RunError,
    },
    meta::PageInfo,
    run::Run,
    stats::STATS,
    stmt::{
        Statement,
        StmtRef,
    },
    xlog::{
        read_map,
        row_at,
        ROW_PAGE_INDEX,
        TX_HEADER_SIZE,
    },
};

/// The single body code of a `PAGE_INDEX` row: the offset blob.
pub(crate) const PAGE_INDEX_INDEX: u8 = 1;

#[derive(Debug)]
pub struct Page {
    page_no: u32,
    row_count: u32,
    data: Bytes,
    /// Byte position of record `i` within `data`, ascending; the end of
    /// the last record is `index_offset`.
    offsets: Vec<u32>,
    index_offset: u32,
    path: Arc<PathBuf>,
}

impl Page {
    /// Read and decode one page: positional read of the whole frame,
    /// checksum verification, streaming decompression into an exact
    /// `unpacked_size` buffer, then the offset-table row.
    ///
    /// Nothing is cached on failure; a partially read page never
    /// escapes.
    pub(crate) fn read(page_no: u32, info: &PageInfo, run: &Run) -> Result<Page> {
        let path = run.path_handle();
        let file = run.file()?;
        let corrupt = |reason: String| RunError::invalid_run(path.as_ref(), reason);

        let (data, index_offset) = env::with_scratch(|scratch| {
            scratch.resize(info.size() as usize, 0);
            file.read_exact_at(scratch, info.offset()).map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    corrupt("unexpected EOF".to_string())
                } else {
                    RunError::Io(err)
                }
            })?;

            #[cfg(any(test, feature = "errinj"))]
            crate::errinj::maybe_delay(crate::errinj::ErrInj::ReadPageDelay);

            if scratch.len() < TX_HEADER_SIZE {
                return Err(corrupt("truncated page frame".to_string()));
            }
            let compressed_size =
                u32::from_le_bytes(scratch[0..4].try_into().unwrap()) as usize;
            let unpacked_size =
                u32::from_le_bytes(scratch[4..8].try_into().unwrap()) as u64;
            let crc = u32::from_le_bytes(scratch[8..12].try_into().unwrap());

            if TX_HEADER_SIZE + compressed_size != info.size() as usize {
                return Err(corrupt("page frame size mismatch".to_string()));
            }
            if unpacked_size != info.unpacked_size() {
                return Err(corrupt("page unpacked size mismatch".to_string()));
            }
            let compressed = &scratch[TX_HEADER_SIZE..];
            if crc32fast::hash(compressed) != crc {
                return Err(corrupt("page checksum mismatch".to_string()));
            }

            let mut data = env::alloc_buf(unpacked_size as usize, "page data")?;
            let written = env::decompress_into(compressed, &mut data)
                .map_err(|_| corrupt("page decompression failed".to_string()))?;
            if written as u64 != unpacked_size {
                return Err(corrupt("page unpacked size mismatch".to_string()));
            }
            Ok((Bytes::from(data), info.page_index_offset() as u32))
        })?;

        let offsets = decode_page_index(&data, index_offset, info.row_count(), &corrupt)?;

        #[cfg(any(test, feature = "errinj"))]
        crate::errinj::maybe_fail(crate::errinj::ErrInj::ReadPage, "page read")?;

        STATS.pages_read.fetch_add(1, Relaxed);
        Ok(Page {
            page_no,
            row_count: info.row_count(),
            data,
            offsets,
            index_offset,
            path,
        })
    }

    #[inline]
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    #[inline]
    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// Decode the statement at `pos`.
    pub fn stmt(&self, pos: u32, is_primary: bool) -> Result<StmtRef> {
        assert!(pos < self.row_count);
        let start = self.offsets[pos as usize] as usize;
        let end = if pos + 1 < self.row_count {
            self.offsets[pos as usize + 1] as usize
        } else {
            self.index_offset as usize
        };

        let (ty, body, next) = row_at(&self.data, start).ok_or_else(|| {
            RunError::invalid_run(self.path.as_ref(), "truncated statement row")
        })?;
        if next > end {
            return Err(RunError::invalid_run(
                self.path.as_ref(),
                "statement row crosses its offset slot",
            ));
        }
        Statement::decode_row(ty, body, is_primary)
            .map(Arc::new)
            .map_err(|reason| RunError::invalid_run(self.path.as_ref(), reason))
    }
}

fn decode_page_index(
    data: &Bytes,
    index_offset: u32,
    row_count: u32,
    corrupt: &impl Fn(String) -> RunError,
) -> Result<Vec<u32>> {
    let (ty, body, _) = row_at(data, index_offset as usize)
        .ok_or_else(|| corrupt("truncated page index row".to_string()))?;
    if ty != ROW_PAGE_INDEX {
        return Err(corrupt(format!(
            "wrong page index type (expected {ROW_PAGE_INDEX}, got {ty})"
        )));
    }

    let mut blob = None;
    for entry in read_map(body).ok_or_else(|| corrupt("truncated page index".to_string()))? {
        if entry.code == PAGE_INDEX_INDEX {
            blob = Some(entry.value);
        }
    }
    let blob = blob.ok_or_else(|| corrupt("page index missing INDEX blob".to_string()))?;
    let expected = row_count as usize * size_of::<u32>();
    if blob.len() != expected {
        return Err(corrupt(format!(
            "wrong page index size (expected {expected}, got {})",
            blob.len()
        )));
    }

    let mut offsets = Vec::with_capacity(row_count as usize);
    for chunk in blob.chunks_exact(size_of::<u32>()) {
        offsets.push(u32::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keydef::KeyDef,
        stmt::StmtKind,
        testutil::{
            uint_stmt,
            RunFixture,
        },
    };

    #[test]
    fn test_read_page_and_decode_rows() {
        let fixture = RunFixture::builder()
            .rows_per_page(5)
            .stmts((0..10).map(|i| uint_stmt(&[i], 100 + i as i64)))
            .build();
        let run = fixture.recover();

        let page = Page::read(0, run.page_info(0), &run).unwrap();
        assert_eq!(page.row_count(), 5);

        let def = KeyDef::new(1);
        for pos in 0..5 {
            let stmt = page.stmt(pos, true).unwrap();
            assert_eq!(stmt.kind(), StmtKind::Replace);
            assert_eq!(stmt.key(&def), uint_stmt(&[pos as u64], 0).key(&def));
            assert_eq!(stmt.lsn(), 100 + pos as i64);
        }
    }

    #[test]
    fn test_short_read_is_invalid_run() {
        let fixture = RunFixture::builder()
            .rows_per_page(4)
            .stmts((0..4).map(|i| uint_stmt(&[i], 1)))
            .build();
        let run = fixture.recover();

        // lie about the frame location so the read runs off the file
        let mut info = run.page_info(0).clone();
        info = PageInfo::new(
            info.offset() + 10_000,
            info.size(),
            info.row_count(),
            info.unpacked_size(),
            info.page_index_offset(),
            info.min_key().clone(),
        );
        let err = Page::read(0, &info, &run).unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[test]
    fn test_injected_read_failure() {
        use crate::errinj::{
            set,
            ErrInj,
        };

        let fixture = RunFixture::builder()
            .rows_per_page(2)
            .stmts((0..2).map(|i| uint_stmt(&[i], 1)))
            .build();
        let run = fixture.recover();

        set(ErrInj::ReadPage, true);
        let err = Page::read(0, run.page_info(0), &run).unwrap_err();
        set(ErrInj::ReadPage, false);
        assert!(matches!(err, RunError::Injected(_)));

        Page::read(0, run.page_info(0), &run).unwrap();
    }
}
