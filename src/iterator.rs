// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Point/range iterator over a slice: bloom-probed, binary-searched,
//! MVCC-filtered, with a two-slot page cache and optional off-thread
//! page I/O.

use std::{
    cmp::Ordering,
    sync::{
        atomic::Ordering::Relaxed,
        Arc,
    },
};

use crate::{
    env::RunEnvRef,
    errs::Result,
    keydef::{
        Field,
        KeyDef,
    },
    page::Page,
    readview::ReadView,
    slice::SliceRef,
    stats::STATS,
    stmt::StmtRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl IteratorType {
    #[inline]
    fn is_reverse(self) -> bool {
        matches!(self, IteratorType::Le | IteratorType::Lt)
    }
}

/// A position in a run: page number and record index within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    page_no: u32,
    pos_in_page: u32,
}

/// Result of [`RunIterator::restore`].
#[derive(Debug)]
pub struct Restore {
    /// True when the iterator now stands on a different statement than
    /// the one the caller last saw.
    pub changed: bool,
    pub stmt: Option<StmtRef>,
}

/// Seek-by-key iterator over one slice.
///
/// The iterator is owned by a single task; it moves one way through
/// `fresh -> running -> ended` and holds at most two decompressed pages
/// at a time. Two slots are the minimum for the boundary case where a
/// key comparison needs the anchor page while the walk briefly loads
/// the adjacent one.
pub struct RunIterator {
    env: RunEnvRef,
    slice: SliceRef,
    iterator_type: IteratorType,
    key: Arc<[Field]>,
    read_view: ReadView,
    /// Index order, including tie-breaking parts.
    key_def: Arc<KeyDef>,
    /// User-visible key prefix; drives bloom probes and EQ termination.
    user_key_def: Arc<KeyDef>,
    is_primary: bool,
    /// Offload page reads to the environment's worker pool. Set on the
    /// transaction thread once recovery is over; direct reads otherwise.
    coio_read: bool,

    curr_pos: Pos,
    /// Memo of the statement at `curr_stmt_pos`: re-reading an
    /// unchanged position costs nothing.
    curr_stmt: Option<StmtRef>,
    curr_stmt_pos: Option<Pos>,
    /// Two-slot LRU page cache.
    curr_page: Option<Arc<Page>>,
    prev_page: Option<Arc<Page>>,

    search_started: bool,
    search_ended: bool,
}

impl RunIterator {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        env: RunEnvRef,
        slice: SliceRef,
        iterator_type: IteratorType,
        key: Vec<Field>,
        read_view: ReadView,
        key_def: Arc<KeyDef>,
        user_key_def: Arc<KeyDef>,
        is_primary: bool,
        coio_read: bool,
    ) -> RunIterator {
        // an empty key has no direction of its own; normalise to a full
        // scan in the requested direction
        let iterator_type = if key.is_empty() {
            if iterator_type.is_reverse() {
                IteratorType::Le
            } else {
                IteratorType::Ge
            }
        } else {
            iterator_type
        };

        let page_count = slice.run().info().page_count();
        RunIterator {
            env,
            slice,
            iterator_type,
            key: Arc::from(key),
            read_view,
            key_def,
            user_key_def,
            is_primary,
            coio_read,
            curr_pos: Pos {
                page_no: page_count,
                pos_in_page: 0,
            },
            curr_stmt: None,
            curr_stmt_pos: None,
            curr_page: None,
            prev_page: None,
            search_started: false,
            search_ended: false,
        }
    }

    /* {{{ page cache */

    fn cache_get(&mut self, page_no: u32) -> Option<Arc<Page>> {
        if let Some(curr) = &self.curr_page {
            if curr.page_no() == page_no {
                return self.curr_page.clone();
            }
            if let Some(prev) = &self.prev_page {
                if prev.page_no() == page_no {
                    std::mem::swap(&mut self.curr_page, &mut self.prev_page);
                    return self.curr_page.clone();
                }
            }
        }
        None
    }

    /// Promote `page_no` to the most recent slot so the next load does
    /// not evict it.
    fn cache_touch(&mut self, page_no: u32) {
        let page = self.cache_get(page_no);
        debug_assert!(page.is_some(), "touched page must be cached");
    }

    fn cache_put(&mut self, page: Arc<Page>) {
        self.prev_page = self.curr_page.take();
        self.curr_page = Some(page);
    }

    fn cache_clean(&mut self) {
        self.curr_stmt = None;
        self.curr_stmt_pos = None;
        self.curr_page = None;
        self.prev_page = None;
    }

    /* }}} page cache */

    /// Fetch a page from the cache or materialise it from disk, either
    /// directly or through the read pool.
    fn load_page(&mut self, page_no: u32) -> Result<Arc<Page>> {
        if let Some(page) = self.cache_get(page_no) {
            return Ok(page);
        }

        let page = if self.coio_read {
            self.env.submit_read(&self.slice, page_no)?
        } else {
            let run = self.slice.run();
            Page::read(page_no, run.page_info(page_no), run)?
        };
        let page = Arc::new(page);
        self.cache_put(page.clone());
        Ok(page)
    }

    fn read_stmt(&mut self, pos: Pos) -> Result<StmtRef> {
        let page = self.load_page(pos.page_no)?;
        page.stmt(pos.pos_in_page, self.is_primary)
    }

    /// Binary search over the page table. Lower bound for EQ/GE/LT,
    /// upper bound for GT/LE (equality coerced to "less"). Returns the
    /// insertion point and whether any page min key equalled `key`.
    fn search_page(&self, ty: IteratorType, key: &[Field]) -> (u32, bool) {
        let run = self.slice.run();
        let upper_bound = matches!(ty, IteratorType::Gt | IteratorType::Le);
        let mut beg = 0u32;
        let mut end = run.info().page_count();
        let mut equal = false;
        while beg != end {
            let mid = beg + (end - beg) / 2;
            let mut cmp = self
                .key_def
                .compare_keys(run.page_info(mid).min_key(), key);
            if cmp == Ordering::Equal && upper_bound {
                cmp = Ordering::Less;
            }
            equal = equal || cmp == Ordering::Equal;
            if cmp == Ordering::Less {
                beg = mid + 1;
            } else {
                end = mid;
            }
        }
        (end, equal)
    }

    /// Same bound semantics as [`Self::search_page`], inside one page.
    fn search_in_page(
        &self,
        ty: IteratorType,
        key: &[Field],
        page: &Page,
    ) -> Result<(u32, bool)> {
        let upper_bound = matches!(ty, IteratorType::Gt | IteratorType::Le);
        let mut beg = 0u32;
        let mut end = page.row_count();
        let mut equal = false;
        while beg != end {
            let mid = beg + (end - beg) / 2;
            let stmt = page.stmt(mid, self.is_primary)?;
            let mut cmp = self.key_def.compare_keys(stmt.fields(), key);
            if cmp == Ordering::Equal && upper_bound {
                cmp = Ordering::Less;
            }
            equal = equal || cmp == Ordering::Equal;
            if cmp == Ordering::Less {
                beg = mid + 1;
            } else {
                end = mid;
            }
        }
        Ok((end, equal))
    }

    /// Locate `key` in the run: page table first, then within the
    /// candidate page. A landing past the last record of the candidate
    /// rolls over to the head of the next page.
    fn search(&mut self, ty: IteratorType, key: &[Field]) -> Result<(Pos, bool)> {
        let (page_no, mut equal) = self.search_page(ty, key);
        if page_no == 0 {
            return Ok((
                Pos {
                    page_no: 0,
                    pos_in_page: 0,
                },
                equal,
            ));
        }
        let page_no = page_no - 1;
        let page = self.load_page(page_no)?;
        let (pos_in_page, equal_in_page) = self.search_in_page(ty, key, &page)?;
        if pos_in_page == page.row_count() {
            Ok((
                Pos {
                    page_no: page_no + 1,
                    pos_in_page: 0,
                },
                equal,
            ))
        } else {
            equal = equal_in_page;
            Ok((
                Pos {
                    page_no,
                    pos_in_page,
                },
                equal,
            ))
        }
    }

    /// Step `curr_pos` one record in the iterator's direction. `None`
    /// at the end of the run.
    fn next_pos(&self, ty: IteratorType) -> Option<Pos> {
        let info = self.slice.run().info();
        STATS.step_count.fetch_add(1, Relaxed);
        let mut pos = self.curr_pos;
        debug_assert!(pos.page_no < info.page_count());
        if ty.is_reverse() {
            if pos.pos_in_page > 0 {
                pos.pos_in_page -= 1;
            } else {
                if pos.page_no == 0 {
                    return None;
                }
                pos.page_no -= 1;
                let row_count = info.page(pos.page_no).row_count();
                debug_assert!(row_count > 0);
                pos.pos_in_page = row_count - 1;
            }
        } else {
            let row_count = info.page(pos.page_no).row_count();
            debug_assert!(row_count > 0);
            pos.pos_in_page += 1;
            if pos.pos_in_page >= row_count {
                pos.page_no += 1;
                pos.pos_in_page = 0;
                if pos.page_no == info.page_count() {
                    return None;
                }
            }
        }
        Some(pos)
    }

    /// The statement at the current position, memoised.
    fn get_cur(&mut self) -> Result<Option<StmtRef>> {
        debug_assert!(self.search_started);
        if self.search_ended {
            return Ok(None);
        }
        if let Some(stmt) = &self.curr_stmt {
            if self.curr_stmt_pos == Some(self.curr_pos) {
                return Ok(Some(stmt.clone()));
            }
        }
        let stmt = self.read_stmt(self.curr_pos)?;
        self.curr_stmt_pos = Some(self.curr_pos);
        self.curr_stmt = Some(stmt.clone());
        Ok(Some(stmt))
    }

    /// Skip versions newer than the read view. The current position
    /// must stand at the first record of a key series in the iterator's
    /// direction. For reverse iteration, additionally walk to the
    /// oldest visible version of the key. Ends the search if the
    /// surviving statement falls outside the slice bounds.
    fn find_lsn(&mut self, ty: IteratorType, key: &[Field]) -> Result<Option<StmtRef>> {
        let vlsn = self.read_view.vlsn();
        let mut stmt = self.read_stmt(self.curr_pos)?;
        while stmt.lsn() > vlsn {
            match self.next_pos(ty) {
                | Some(pos) => self.curr_pos = pos,
                | None => {
                    self.cache_clean();
                    self.search_ended = true;
                    return Ok(None);
                },
            }
            stmt = self.read_stmt(self.curr_pos)?;
            if ty == IteratorType::Eq
                && self.key_def.compare_keys(stmt.fields(), key) != Ordering::Equal
            {
                self.cache_clean();
                self.search_ended = true;
                return Ok(None);
            }
        }
        if ty.is_reverse() {
            // walking backwards we met the newest visible version
            // first; keep stepping to the oldest visible one of the
            // same key
            let cur_key_page_no = self.curr_pos.page_no;
            while let Some(test_pos) = self.next_pos(ty) {
                // keep the anchor page hot across the boundary read
                self.cache_touch(cur_key_page_no);
                let test_stmt = self.read_stmt(test_pos)?;
                if test_stmt.lsn() > vlsn
                    || self.key_def.compare(stmt.fields(), test_stmt.fields())
                        != Ordering::Equal
                {
                    break;
                }
                self.curr_pos = test_pos;
                self.cache_touch(cur_key_page_no);
            }
        }
        let Some(result) = self.get_cur()? else {
            return Ok(None);
        };
        // the landing must still lie inside the slice window
        let out_of_bounds = if ty.is_reverse() {
            self.slice.begin().is_some_and(|begin| {
                self.key_def.compare_keys(result.fields(), begin) == Ordering::Less
            })
        } else {
            self.slice.end().is_some_and(|end| {
                self.key_def.compare_keys(result.fields(), end) != Ordering::Less
            })
        };
        if out_of_bounds {
            self.cache_clean();
            self.search_ended = true;
            return Ok(None);
        }
        Ok(Some(result))
    }

    /// Position on the requested key, ignoring slice bounds (the caller
    /// clamps first).
    fn start_from(&mut self, ty: IteratorType, key: &[Field]) -> Result<Option<StmtRef>> {
        debug_assert!(!self.search_started);
        self.search_started = true;

        if self.slice.is_empty() {
            self.search_ended = true;
            return Ok(None);
        }

        let page_count = self.slice.run().info().page_count();
        if ty == IteratorType::Eq && self.user_key_def.is_complete(key) {
            if let Some(bloom) = self.slice.run().info().bloom() {
                if !bloom.possibly_has(self.user_key_def.hash_key(key)) {
                    self.search_ended = true;
                    STATS.bloom_reflections.fetch_add(1, Relaxed);
                    return Ok(None);
                }
            }
        }

        STATS.lookup_count.fetch_add(1, Relaxed);

        if page_count == 1 {
            // a bootstrap run may consist of one empty page
            if self.slice.run().page_info(0).row_count() == 0 {
                self.cache_clean();
                self.search_ended = true;
                return Ok(None);
            }
            self.load_page(0)?;
        } else if page_count == 0 {
            self.cache_clean();
            self.search_ended = true;
            return Ok(None);
        }

        let end_pos = Pos {
            page_no: page_count,
            pos_in_page: 0,
        };
        let mut equal_found = false;
        if !key.is_empty() {
            let (pos, equal) = self.search(ty, key)?;
            self.curr_pos = pos;
            equal_found = equal;
        } else if ty == IteratorType::Le {
            self.curr_pos = end_pos;
        } else {
            debug_assert_eq!(ty, IteratorType::Ge);
            self.curr_pos = Pos {
                page_no: 0,
                pos_in_page: 0,
            };
        }
        if ty == IteratorType::Eq && !equal_found {
            self.cache_clean();
            self.search_ended = true;
            return Ok(None);
        }
        if !ty.is_reverse() && self.curr_pos.page_no == end_pos.page_no {
            self.cache_clean();
            self.search_ended = true;
            return Ok(None);
        }
        if ty.is_reverse() {
            // we landed on the first record >= the key (or > for LE);
            // step back once to get behind it
            self.next_key()
        } else {
            // positioned at the newest record of the key series; skip
            // to the visible version
            self.find_lsn(ty, key)
        }
    }

    /// First seek: clamp the requested key and direction against the
    /// slice bounds, then run the search.
    ///
    /// ```text
    ///    original   |     start         |    original   |    start
    /// --------------+-------+-----------+---------------+------+----
    ///   KEY   | DIR |  KEY  | DIR       |   KEY   | DIR | KEY  | DIR
    /// --------+-----+-------+-----------+---------+-----+------+----
    /// > begin | *   | key   | *         | < end   | *   | key  | *
    /// = begin | gt  | key   | gt        | = end   | lt  | key  | lt
    ///         | ge  | begin | ge        |         | le  | end  | lt
    ///         | eq  | begin | ge        | > end   | lt  | end  | lt
    /// < begin | gt  | begin | ge        |         | le  | end  | lt
    ///         | ge  | begin | ge        |
    ///         | eq  |    stop           |
    /// ```
    fn start(&mut self) -> Result<Option<StmtRef>> {
        let mut ty = self.iterator_type;
        let mut key = self.key.clone();

        let begin = self.slice.begin().map(<[Field]>::to_vec);
        let end = self.slice.end().map(<[Field]>::to_vec);

        if let Some(begin) = begin {
            if matches!(
                ty,
                IteratorType::Gt | IteratorType::Ge | IteratorType::Eq
            ) {
                let cmp = self.key_def.compare_keys(&key, &begin);
                if cmp == Ordering::Less && ty == IteratorType::Eq {
                    self.cache_clean();
                    self.search_started = true;
                    self.search_ended = true;
                    return Ok(None);
                }
                if cmp == Ordering::Less
                    || (cmp == Ordering::Equal && ty != IteratorType::Gt)
                {
                    ty = IteratorType::Ge;
                    key = Arc::from(begin);
                }
            }
        }

        if let Some(end) = end {
            if ty.is_reverse() {
                let cmp = self.key_def.compare_keys(&key, &end);
                if cmp == Ordering::Greater
                    || (cmp == Ordering::Equal && ty != IteratorType::Lt)
                {
                    ty = IteratorType::Lt;
                    key = Arc::from(end);
                }
            }
        }

        self.start_from(ty, &key)
    }

    /// Advance to the first visible version of the next key (the first
    /// key, if the search has not started yet).
    pub fn next_key(&mut self) -> Result<Option<StmtRef>> {
        if self.search_ended {
            return Ok(None);
        }
        if !self.search_started {
            return self.start();
        }
        let end_page = self.slice.run().info().page_count();
        debug_assert!(self.curr_pos.page_no <= end_page);

        if self.iterator_type.is_reverse() {
            if self.curr_pos.page_no == 0 && self.curr_pos.pos_in_page == 0 {
                self.cache_clean();
                self.search_ended = true;
                return Ok(None);
            }
            if self.curr_pos.page_no == end_page {
                // a reverse scan started past the last record
                let page_no = end_page - 1;
                let page = self.load_page(page_no)?;
                if page.row_count() == 0 {
                    self.cache_clean();
                    self.search_ended = true;
                    return Ok(None);
                }
                self.curr_pos = Pos {
                    page_no,
                    pos_in_page: page.row_count() - 1,
                };
                let key = self.key.clone();
                return self.find_lsn(self.iterator_type, &key);
            }
        }
        debug_assert!(self.curr_pos.page_no < end_page);

        let cur_key = self.read_stmt(self.curr_pos)?;
        let cur_key_page_no = self.curr_pos.page_no;

        let next_key = loop {
            match self.next_pos(self.iterator_type) {
                | Some(pos) => self.curr_pos = pos,
                | None => {
                    self.cache_clean();
                    self.search_ended = true;
                    return Ok(None);
                },
            }

            // keep cur_key's page hot while the walk crosses into the
            // neighbour page
            self.cache_touch(cur_key_page_no);
            let next_key = self.read_stmt(self.curr_pos)?;
            self.cache_touch(cur_key_page_no);

            if self.key_def.compare(cur_key.fields(), next_key.fields())
                != Ordering::Equal
            {
                break next_key;
            }
        };

        let key = self.key.clone();
        if self.iterator_type == IteratorType::Eq
            && self.key_def.compare_keys(next_key.fields(), &key) != Ordering::Equal
        {
            self.cache_clean();
            self.search_ended = true;
            return Ok(None);
        }
        self.find_lsn(self.iterator_type, &key)
    }

    /// Advance to the next (older) version of the current key. EOF
    /// without moving when the current key has no older version.
    pub fn next_lsn(&mut self) -> Result<Option<StmtRef>> {
        if self.search_ended {
            return Ok(None);
        }
        if !self.search_started {
            return self.start();
        }
        debug_assert!(self.curr_pos.page_no < self.slice.run().info().page_count());

        let Some(next_pos) = self.next_pos(IteratorType::Ge) else {
            return Ok(None);
        };

        let cur_key = self.read_stmt(self.curr_pos)?;
        let next_key = self.read_stmt(next_pos)?;

        // no lsn filter here: the caller explicitly asks for the next
        // older version
        if self.key_def.compare(cur_key.fields(), next_key.fields()) == Ordering::Equal {
            self.curr_pos = next_pos;
            self.get_cur()
        } else {
            Ok(None)
        }
    }

    /// Re-seek after the slice set changed under the iterator. With no
    /// prior position this is an ordinary start; otherwise the search
    /// key is the last statement the caller saw, the direction is
    /// relaxed to include it, and anything at or below its version is
    /// walked over.
    pub fn restore(&mut self, last_stmt: Option<&StmtRef>) -> Result<Restore> {
        if self.search_started || last_stmt.is_none() {
            let stmt = if !self.search_started {
                self.start()?
            } else {
                self.get_cur()?
            };
            return Ok(Restore {
                changed: false,
                stmt,
            });
        }
        let last_stmt = last_stmt.unwrap();

        // restoration is a relaxed first search
        let ty = match self.iterator_type {
            | IteratorType::Gt | IteratorType::Eq => IteratorType::Ge,
            | IteratorType::Lt => IteratorType::Le,
            | other => other,
        };
        let mut next = self.start_from(ty, last_stmt.fields())?;
        let Some(found) = next.clone() else {
            return Ok(Restore {
                changed: false,
                stmt: None,
            });
        };

        let mut changed = true;
        if self.key_def.compare(found.fields(), last_stmt.fields()) == Ordering::Equal {
            changed = false;
            if found.lsn() >= last_stmt.lsn() {
                // the same statement or a newer version of it: walk to
                // a strictly newer position
                loop {
                    next = self.next_lsn()?;
                    match &next {
                        | None => {
                            next = self.next_key()?;
                            break;
                        },
                        | Some(stmt) if stmt.lsn() < last_stmt.lsn() => break,
                        | Some(_) => {},
                    }
                }
                if next.is_some() {
                    changed = true;
                }
            }
        } else if self.iterator_type == IteratorType::Eq {
            let key = self.key.clone();
            if self.key_def.compare_keys(found.fields(), &key) != Ordering::Equal {
                self.search_ended = true;
                self.cache_clean();
                return Ok(Restore {
                    changed,
                    stmt: None,
                });
            }
        }
        Ok(Restore {
            changed,
            stmt: next,
        })
    }

    /// Release page cache and the stashed statement. Split from drop so
    /// a worker thread can free its resources before the object travels
    /// back to the owner for destruction.
    pub fn cleanup(&mut self) {
        self.cache_clean();
    }

    /// Final teardown; `cleanup` must have run.
    pub fn close(self) {
        debug_assert!(
            self.curr_stmt.is_none() && self.curr_page.is_none(),
            "cleanup() must run before close()"
        );
    }
}
