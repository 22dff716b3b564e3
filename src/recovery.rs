// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Loading a run from disk: parse the sibling index file into run and
//! page metadata, then adopt the verified data-file descriptor.

use std::path::Path;

use tracing::{
    debug,
    instrument,
};

use crate::{
    errs::{
        Result,
        RunError,
    },
    meta::{
        PageInfo,
        RunInfo,
    },
    run::{
        Run,
        RunRef,
    },
    xlog::{
        FileType,
        XlogCursor,
        ROW_PAGE_INFO,
        ROW_RUN_INFO,
    },
};

/// Parse `index_path` and `run_path` into an open [`Run`].
///
/// The index file must hold a single transaction: one `RUN_INFO` row
/// followed by exactly `PAGE_COUNT` `PAGE_INFO` rows. On a decode error
/// mid-table the page count is capped at the rows parsed so far, so the
/// partially built metadata unwinds without touching uninitialised
/// entries; the error still propagates and no descriptor leaks.
#[instrument(skip(index_path, run_path), fields(index = %index_path.display()))]
pub fn recover(id: i64, index_path: &Path, run_path: &Path) -> Result<RunRef> {
    let mut cursor = XlogCursor::open(index_path, FileType::Index)?;

    let eof = || RunError::invalid_run(index_path, "unexpected EOF");
    if !cursor.next_tx()? {
        return Err(eof());
    }
    let (ty, body) = cursor.next_row()?.ok_or_else(eof)?;
    if ty != ROW_RUN_INFO {
        return Err(RunError::invalid_run(
            index_path,
            format!("wrong row type (expected {ROW_RUN_INFO}, got {ty})"),
        ));
    }
    let (mut info, page_count) = RunInfo::decode_body(body, index_path)?;

    for page_no in 0..page_count {
        let (ty, body) = match cursor.next_row()? {
            | Some(row) => row,
            | None => {
                // too few pages in the file; info already holds only
                // the pages parsed so far
                debug!(page_no, page_count, "index file truncated mid page table");
                return Err(eof());
            },
        };
        if ty != ROW_PAGE_INFO {
            return Err(RunError::invalid_run(
                index_path,
                format!("wrong row type (expected {ROW_PAGE_INFO}, got {ty})"),
            ));
        }
        info.push_page(PageInfo::decode_body(body, index_path)?);
    }

    // the metadata file is done; drop its cursor before touching the
    // data file
    drop(cursor);

    let cursor = XlogCursor::open(run_path, FileType::Run)?;
    let file = cursor.into_file();

    debug!(
        run_id = id,
        pages = info.page_count(),
        keys = info.keys(),
        "recovered run"
    );
    Ok(Run::new(id, run_path.to_path_buf(), info, Some(file)))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testutil::{
        uint_stmt,
        RunFixture,
    };

    #[test]
    fn test_recover_roundtrip() {
        let fixture = RunFixture::builder()
            .rows_per_page(4)
            .bloom(0.01)
            .stmts((0..20).map(|i| uint_stmt(&[i], 50 + i as i64)))
            .build();

        let run = recover(7, fixture.index_path(), fixture.run_path()).unwrap();
        assert_eq!(run.id(), 7);
        assert_eq!(run.info().page_count(), 5);
        assert_eq!(run.info().keys(), 20);
        assert_eq!(run.info().min_lsn(), 50);
        assert_eq!(run.info().max_lsn(), 69);
        assert!(run.info().bloom().is_some());

        // metadata round-trip: what the fixture wrote is what came back
        assert_eq!(run.info(), fixture.info());
    }

    #[test]
    fn test_recover_rejects_wrong_filetype() {
        let fixture = RunFixture::builder()
            .stmts((0..4).map(|i| uint_stmt(&[i], 1)))
            .build();
        // swap the two paths
        let err = recover(1, fixture.run_path(), fixture.index_path()).unwrap_err();
        assert!(err.to_string().contains("wrong file type"));
    }

    #[test]
    fn test_truncated_index_fails_without_leaking() {
        let fixture = RunFixture::builder()
            .rows_per_page(2)
            .stmts((0..10).map(|i| uint_stmt(&[i], 1)))
            .build();

        // truncate the index mid-frame
        let len = fs::metadata(fixture.index_path()).unwrap().len();
        let file = fs::OpenOptions::new()
            .write(true)
            .open(fixture.index_path())
            .unwrap();
        file.set_len(len - 7).unwrap();
        drop(file);

        let err = recover(1, fixture.index_path(), fixture.run_path()).unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[test]
    fn test_missing_mandatory_key_is_named() {
        use crate::xlog::{
            encode_row,
            FileType,
            MapWriter,
            XlogWriter,
        };
        use bytes::BytesMut;

        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("00001.index");
        let run_path = dir.path().join("00001.run");

        // a run-info row without MAX_LSN
        let mut map = MapWriter::new();
        map.put_bytes(1, &crate::keydef::encode_key(&[]));
        map.put_bytes(2, &crate::keydef::encode_key(&[]));
        map.put_i64(3, 0);
        map.put_u64(5, 0);
        let mut payload = BytesMut::new();
        encode_row(ROW_RUN_INFO, &map.finish(), &mut payload);

        let mut writer = XlogWriter::create(&index_path, FileType::Index).unwrap();
        writer.append_tx(&payload).unwrap();
        writer.sync().unwrap();
        XlogWriter::create(&run_path, FileType::Run)
            .unwrap()
            .sync()
            .unwrap();

        let err = recover(1, &index_path, &run_path).unwrap_err();
        assert!(err.to_string().contains("missing mandatory key MAX_LSN"));
    }
}
