// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Linear forward scan over a slice, used by compaction to feed the
//! merge. One page resident at a time, no cache, no MVCC filtering:
//! compaction wants every version.

use std::{
    cmp::Ordering,
    sync::Arc,
};

use crate::{
    errs::Result,
    keydef::KeyDef,
    page::Page,
    slice::SliceRef,
    stmt::StmtRef,
};

pub struct SliceStream {
    slice: SliceRef,
    key_def: Arc<KeyDef>,
    is_primary: bool,
    page_no: u32,
    pos_in_page: u32,
    page: Option<Page>,
    stmt: Option<StmtRef>,
    started: bool,
}

impl SliceStream {
    pub fn open(slice: SliceRef, key_def: Arc<KeyDef>, is_primary: bool) -> SliceStream {
        SliceStream {
            page_no: slice.first_page_no(),
            pos_in_page: 0,
            page: None,
            stmt: None,
            started: false,
            slice,
            key_def,
            is_primary,
        }
    }

    fn read_page(&mut self) -> Result<()> {
        debug_assert!(self.page.is_none());
        let run = self.slice.run();
        self.page = Some(Page::read(
            self.page_no,
            run.page_info(self.page_no),
            run,
        )?);
        Ok(())
    }

    /// First-call positioning: find the first record `>= slice.begin`
    /// in the first page. A landing past the last record means the
    /// window starts at the head of the next page.
    fn search(&mut self) -> Result<()> {
        if self.slice.is_empty() || self.slice.begin().is_none() {
            return Ok(());
        }
        self.read_page()?;
        let page = self.page.as_ref().unwrap();
        let begin = self.slice.begin().unwrap();

        let mut beg = 0u32;
        let mut end = page.row_count();
        while beg != end {
            let mid = beg + (end - beg) / 2;
            let stmt = page.stmt(mid, self.is_primary)?;
            if self.key_def.compare_keys(stmt.fields(), begin) == Ordering::Less {
                beg = mid + 1;
            } else {
                end = mid;
            }
        }
        self.pos_in_page = end;

        if self.pos_in_page == page.row_count() {
            self.page = None;
            self.page_no += 1;
            self.pos_in_page = 0;
        }
        Ok(())
    }

    /// The next statement of the scan, or `None` at the end of the
    /// slice.
    pub fn next(&mut self) -> Result<Option<StmtRef>> {
        if !self.started {
            self.started = true;
            self.search()?;
        }

        if self.slice.is_empty() || self.page_no > self.slice.last_page_no() {
            return Ok(None);
        }

        if self.page.is_none() {
            self.read_page()?;
        }
        let tuple = self
            .page
            .as_ref()
            .unwrap()
            .stmt(self.pos_in_page, self.is_primary)?;

        // the end bound can only cut inside the last page; anything
        // beyond it was excluded by the page span
        let past_end = self.slice.end().is_some_and(|end| {
            self.page_no == self.slice.last_page_no()
                && self.key_def.compare_keys(tuple.fields(), end) != Ordering::Less
        });
        if past_end {
            return Ok(None);
        }

        self.stmt = Some(tuple.clone());

        self.pos_in_page += 1;
        if self.pos_in_page >= self.slice.run().page_info(self.page_no).row_count() {
            self.page = None;
            self.page_no += 1;
            self.pos_in_page = 0;
        }

        Ok(Some(tuple))
    }

    /// Drop the resident page and the stashed statement.
    pub fn close(&mut self) {
        self.page = None;
        self.stmt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        slice::Slice,
        stmt::StmtKind,
        testutil::{
            uint_delete,
            uint_key,
            uint_stmt,
            RunFixture,
        },
    };

    fn key_def() -> Arc<KeyDef> {
        Arc::new(KeyDef::new(1))
    }

    /// Keys 0..20, one version each, 4 rows per page.
    fn plain_fixture() -> RunFixture {
        RunFixture::builder()
            .rows_per_page(4)
            .stmts((0..20).map(|i| uint_stmt(&[i], 100 + i as i64)))
            .build()
    }

    fn collect(mut stream: SliceStream) -> Vec<StmtRef> {
        let mut out = Vec::new();
        while let Some(stmt) = stream.next().unwrap() {
            out.push(stmt);
        }
        stream.close();
        out
    }

    #[test]
    fn test_full_scan_is_ordered_and_complete() {
        let def = key_def();
        let run = plain_fixture().recover();
        let slice = Slice::new(1, run, None, None, &def);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 20);
        for (i, stmt) in all.iter().enumerate() {
            assert_eq!(stmt.fields(), &uint_key(&[i as u64])[..]);
        }
    }

    #[test]
    fn test_versions_come_newest_first() {
        let def = key_def();
        // two keys, three versions each, written newest first
        let fixture = RunFixture::builder()
            .rows_per_page(2)
            .stmts([
                uint_stmt(&[1], 30),
                uint_stmt(&[1], 20),
                uint_stmt(&[1], 10),
                uint_stmt(&[2], 25),
                uint_stmt(&[2], 15),
                uint_stmt(&[2], 5),
            ])
            .build();
        let slice = Slice::new(1, fixture.recover(), None, None, &def);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 6);
        // non-decreasing user keys; strictly decreasing lsn within a key
        for pair in all.windows(2) {
            let ord = def.compare(pair[0].fields(), pair[1].fields());
            assert!(ord != std::cmp::Ordering::Greater);
            if ord == std::cmp::Ordering::Equal {
                assert!(pair[0].lsn() > pair[1].lsn());
            }
        }
    }

    #[test]
    fn test_begin_bound_lands_mid_page() {
        let def = key_def();
        let run = plain_fixture().recover();
        let slice = Slice::new(1, run, Some(uint_key(&[6])), None, &def);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 14);
        assert_eq!(all[0].fields(), &uint_key(&[6])[..]);
    }

    #[test]
    fn test_begin_bound_lands_on_page_boundary() {
        let def = key_def();
        let run = plain_fixture().recover();
        // pages hold 4 rows; first page of the slice is [4..8) and the
        // begin search in it lands past its last record
        let slice = Slice::new(1, run, Some(uint_key(&[8])), None, &def);
        assert_eq!(slice.first_page_no(), 1);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all[0].fields(), &uint_key(&[8])[..]);
        assert_eq!(all.len(), 12);
    }

    #[test]
    fn test_end_bound_cuts_last_page() {
        let def = key_def();
        let run = plain_fixture().recover();
        let slice = Slice::new(1, run, None, Some(uint_key(&[10])), &def);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 10);
        assert_eq!(all.last().unwrap().fields(), &uint_key(&[9])[..]);
    }

    #[test]
    fn test_bounded_window() {
        let def = key_def();
        let run = plain_fixture().recover();
        let slice = Slice::new(
            1,
            run,
            Some(uint_key(&[3])),
            Some(uint_key(&[17])),
            &def,
        );

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 14);
        assert_eq!(all[0].fields(), &uint_key(&[3])[..]);
        assert_eq!(all.last().unwrap().fields(), &uint_key(&[16])[..]);
    }

    #[test]
    fn test_empty_slice_is_eof() {
        let def = key_def();
        let fixture = RunFixture::builder()
            .rows_per_page(4)
            .stmts((10..30).map(|i| uint_stmt(&[i], 1)))
            .build();
        // end below every key
        let slice = Slice::new(1, fixture.recover(), None, Some(uint_key(&[5])), &def);
        assert!(slice.is_empty());

        let mut stream = SliceStream::open(slice, def.clone(), true);
        assert!(stream.next().unwrap().is_none());
        stream.close();
    }

    #[test]
    fn test_tombstones_flow_through() {
        let def = key_def();
        // compaction must see deletes, not resolve them
        let fixture = RunFixture::builder()
            .rows_per_page(3)
            .stmts([
                uint_stmt(&[1], 10),
                uint_delete(&[2], 12),
                uint_stmt(&[2], 8),
                uint_stmt(&[3], 9),
            ])
            .build();
        let slice = Slice::new(1, fixture.recover(), None, None, &def);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].kind(), StmtKind::Delete);
        assert_eq!(all[1].lsn(), 12);
        assert_eq!(all[2].kind(), StmtKind::Replace);
    }

    #[test]
    fn test_end_bound_between_pages_stops_the_scan() {
        let def = key_def();
        let fixture = RunFixture::builder()
            .rows_per_page(4)
            .stmts([0, 1, 2, 3, 10, 11, 12, 13].map(|i| uint_stmt(&[i], 1)))
            .build();
        // every key of the last in-window page is below the bound, so
        // the cut never fires inside it; the page span must stop the
        // scan instead
        let slice = Slice::new(1, fixture.recover(), None, Some(uint_key(&[7])), &def);
        assert_eq!(slice.last_page_no(), 0);

        let all = collect(SliceStream::open(slice, def.clone(), true));
        assert_eq!(all.len(), 4);
        assert_eq!(all.last().unwrap().fields(), &uint_key(&[3])[..]);
    }
}
