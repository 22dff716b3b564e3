// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use parking_lot::{
    Condvar,
    Mutex,
};

use crate::{
    keydef::{
        Field,
        KeyDef,
    },
    run::RunRef,
};

/// A logical window over a run: the half-open key interval
/// `[begin, end)` the owning range currently exposes. Many slices may
/// reference the same run.
///
/// Construction precomputes the inclusive page span
/// `[first_page_no, last_page_no]` and throws away a `begin` bound that
/// no page can precede, so the hot iterator path never re-derives
/// either.
#[derive(Debug)]
pub struct Slice {
    id: i64,
    run: RunRef,
    begin: Option<Vec<Field>>,
    end: Option<Vec<Field>>,
    first_page_no: u32,
    last_page_no: u32,
    /// Set when no page intersects the interval. `last_page_no == 0` is
    /// otherwise indistinguishable from a one-page slice.
    empty: bool,
    keys_est: u64,
    size_est: u64,
    pin_count: Mutex<u32>,
    pin_cond: Condvar,
}

pub type SliceRef = Arc<Slice>;

impl Slice {
    pub fn new(
        id: i64,
        run: RunRef,
        begin: Option<Vec<Field>>,
        end: Option<Vec<Field>>,
        key_def: &KeyDef,
    ) -> SliceRef {
        let mut slice = Slice {
            id,
            run,
            begin,
            end,
            first_page_no: 0,
            last_page_no: 0,
            empty: false,
            keys_est: 0,
            size_est: 0,
            pin_count: Mutex::new(0),
            pin_cond: Condvar::new(),
        };
        slice.set_up_beginning(key_def);
        slice.set_up_end(key_def);

        let info = slice.run.info();
        if !slice.empty && info.page_count() > 0 {
            debug_assert!(slice.first_page_no <= slice.last_page_no);
            let count = (slice.last_page_no - slice.first_page_no + 1) as u64;
            slice.keys_est = (info.keys() * count).div_ceil(info.page_count() as u64);
            slice.size_est = (info.size() * count).div_ceil(info.page_count() as u64);
        }
        Arc::new(slice)
    }

    /// Find the highest page whose `min_key` is strictly below `begin`;
    /// a key equal to a page's `min_key` may still continue from the
    /// previous page. When every page starts at or after `begin`, the
    /// bound is redundant and dropped.
    fn set_up_beginning(&mut self, key_def: &KeyDef) {
        let info = self.run.info();
        if info.page_count() == 0 {
            self.empty = true;
            self.first_page_no = 0;
            return;
        }
        let Some(begin) = &self.begin else {
            self.first_page_no = 0;
            return;
        };

        let mut beg = 0u32;
        let mut end = info.page_count();
        while beg != end {
            let mid = beg + (end - beg) / 2;
            if key_def
                .compare_keys(info.page(mid).min_key(), begin)
                .is_lt()
            {
                beg = mid + 1;
            } else {
                end = mid;
            }
        }
        if end == 0 {
            // the first page's min key is already >= begin
            self.begin = None;
            self.first_page_no = 0;
        } else {
            self.first_page_no = end - 1;
        }
    }

    /// Find the highest page whose `min_key` is `<= end` (`<=`, not `<`:
    /// the bounding key may spread into the page that starts with it).
    fn set_up_end(&mut self, key_def: &KeyDef) {
        let info = self.run.info();
        if info.page_count() == 0 {
            self.last_page_no = 0;
            return;
        }
        let Some(bound) = &self.end else {
            self.last_page_no = info.page_count() - 1;
            return;
        };

        let mut beg = 0u32;
        let mut end = info.page_count();
        while beg != end {
            let mid = beg + (end - beg) / 2;
            if key_def
                .compare_keys(info.page(mid).min_key(), bound)
                .is_le()
            {
                beg = mid + 1;
            } else {
                end = mid;
            }
        }
        if end == 0 {
            // even the first page starts past `end`
            debug_assert_eq!(self.first_page_no, 0);
            debug_assert!(self.begin.is_none());
            self.last_page_no = 0;
            self.empty = true;
        } else {
            self.last_page_no = end - 1;
        }
    }

    /// Intersect this slice with `[begin, end)` and build a new slice
    /// over the same run with the tightened bounds. `None` when the
    /// intersection is empty.
    pub fn cut(
        &self,
        id: i64,
        begin: Option<&[Field]>,
        end: Option<&[Field]>,
        key_def: &KeyDef,
    ) -> Option<SliceRef> {
        if let (Some(begin), Some(self_end)) = (begin, &self.end) {
            if key_def.compare_keys(begin, self_end).is_ge() {
                return None; // begin >= slice.end
            }
        }
        if let (Some(end), Some(self_begin)) = (end, &self.begin) {
            if key_def.compare_keys(end, self_begin).is_le() {
                return None; // end <= slice.begin
            }
        }

        // begin = max(begin, slice.begin)
        let begin = match (&self.begin, begin) {
            | (Some(own), Some(given)) if key_def.compare_keys(given, own).is_lt() => {
                Some(own.clone())
            },
            | (Some(own), None) => Some(own.clone()),
            | (_, given) => given.map(<[Field]>::to_vec),
        };
        // end = min(end, slice.end)
        let end = match (&self.end, end) {
            | (Some(own), Some(given)) if key_def.compare_keys(given, own).is_gt() => {
                Some(own.clone())
            },
            | (Some(own), None) => Some(own.clone()),
            | (_, given) => given.map(<[Field]>::to_vec),
        };

        Some(Slice::new(id, self.run.clone(), begin, end, key_def))
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn run(&self) -> &RunRef {
        &self.run
    }

    #[inline]
    pub fn begin(&self) -> Option<&[Field]> {
        self.begin.as_deref()
    }

    #[inline]
    pub fn end(&self) -> Option<&[Field]> {
        self.end.as_deref()
    }

    #[inline]
    pub fn first_page_no(&self) -> u32 {
        self.first_page_no
    }

    #[inline]
    pub fn last_page_no(&self) -> u32 {
        self.last_page_no
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    #[inline]
    pub fn keys_est(&self) -> u64 {
        self.keys_est
    }

    #[inline]
    pub fn size_est(&self) -> u64 {
        self.size_est
    }

    /// Block the run's data file from being torn down while a worker
    /// reads against it.
    pub fn pin(&self) {
        *self.pin_count.lock() += 1;
    }

    pub fn unpin(&self) {
        let mut count = self.pin_count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.pin_cond.notify_all();
        }
    }

    pub fn pin_count(&self) -> u32 {
        *self.pin_count.lock()
    }

    /// Wait until no in-flight read holds this slice. Must be called
    /// before the owner drops its last reference.
    pub fn wait_pinned(&self) {
        let mut count = self.pin_count.lock();
        while *count > 0 {
            self.pin_cond.wait(&mut count);
        }
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        debug_assert_eq!(*self.pin_count.lock(), 0, "dropping a pinned slice");
    }
}

/// RAII pin held by an off-thread read task; releasing on the worker
/// side keeps the data file open for the whole read even when the
/// requester bails out early.
pub(crate) struct PinGuard {
    slice: SliceRef,
}

impl PinGuard {
    pub(crate) fn new(slice: SliceRef) -> Self {
        slice.pin();
        PinGuard { slice }
    }

    pub(crate) fn slice(&self) -> &SliceRef {
        &self.slice
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.slice.unpin();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        keydef::Field,
        meta::{
            PageInfo,
            RunInfo,
        },
        run::Run,
    };

    fn key(vals: &[u64]) -> Vec<Field> {
        vals.iter().map(|v| Field::Uint(*v)).collect()
    }

    /// A run with the given page min keys; 10 rows and 512 bytes per
    /// page.
    fn run_with_min_keys(mins: &[u64]) -> RunRef {
        let mut info = RunInfo::new(
            key(&[mins[0]]),
            key(&[mins[mins.len() - 1] + 9]),
            0,
            100,
            None,
        );
        for (i, min) in mins.iter().enumerate() {
            info.push_page(PageInfo::new(
                16 + i as u64 * 512,
                512,
                10,
                4096,
                3800,
                key(&[*min]),
            ));
        }
        Run::new(1, PathBuf::from("00001.run"), info, None)
    }

    fn empty_run() -> RunRef {
        let info = RunInfo::new(key(&[]), key(&[]), 0, 0, None);
        Run::new(1, PathBuf::from("00001.run"), info, None)
    }

    #[test]
    fn test_unbounded_slice_covers_all_pages() {
        let def = KeyDef::new(1);
        let slice = Slice::new(1, run_with_min_keys(&[10, 20, 30]), None, None, &def);
        assert!(!slice.is_empty());
        assert_eq!(slice.first_page_no(), 0);
        assert_eq!(slice.last_page_no(), 2);
        assert_eq!(slice.keys_est(), 30);
        assert_eq!(slice.size_est(), 1536);
    }

    #[test]
    fn test_redundant_begin_is_dropped() {
        let def = KeyDef::new(1);
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            Some(key(&[5])),
            None,
            &def,
        );
        assert!(slice.begin().is_none());
        assert_eq!(slice.first_page_no(), 0);
    }

    #[test]
    fn test_begin_lands_on_preceding_page() {
        let def = KeyDef::new(1);
        // key 25 may continue from the page starting at 20
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            Some(key(&[25])),
            None,
            &def,
        );
        assert_eq!(slice.first_page_no(), 1);
        assert!(slice.begin().is_some());

        // begin equal to a min key also keeps the previous page
        let slice = Slice::new(
            2,
            run_with_min_keys(&[10, 20, 30]),
            Some(key(&[20])),
            None,
            &def,
        );
        assert_eq!(slice.first_page_no(), 0);
    }

    #[test]
    fn test_end_bound_page_span() {
        let def = KeyDef::new(1);
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            None,
            Some(key(&[20])),
            &def,
        );
        // min_key == end still qualifies: the bounding key may spread
        // into that page
        assert_eq!(slice.last_page_no(), 1);
        assert_eq!(slice.keys_est(), 20);
    }

    #[test]
    fn test_end_before_first_page_is_empty() {
        let def = KeyDef::new(1);
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            None,
            Some(key(&[5])),
            &def,
        );
        assert!(slice.is_empty());
        assert_eq!(slice.keys_est(), 0);
    }

    #[test]
    fn test_empty_run_yields_empty_slice() {
        let def = KeyDef::new(1);
        let slice = Slice::new(1, empty_run(), None, None, &def);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_cut_no_intersection() {
        let def = KeyDef::new(1);
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            Some(key(&[15])),
            Some(key(&[25])),
            &def,
        );
        assert!(slice.cut(2, Some(&key(&[25])), None, &def).is_none());
        assert!(slice.cut(2, None, Some(&key(&[15])), &def).is_none());
    }

    #[test]
    fn test_cut_tightens_bounds() {
        let def = KeyDef::new(1);
        let slice = Slice::new(
            1,
            run_with_min_keys(&[10, 20, 30]),
            Some(key(&[15])),
            Some(key(&[35])),
            &def,
        );
        let cut = slice
            .cut(2, Some(&key(&[12])), Some(&key(&[25])), &def)
            .unwrap();
        // begin = max(12, 15), end = min(25, 35)
        assert_eq!(cut.begin(), Some(&key(&[15])[..]));
        assert_eq!(cut.end(), Some(&key(&[25])[..]));
    }

    #[test]
    fn test_cut_is_idempotent() {
        let def = KeyDef::new(1);
        let slice = Slice::new(1, run_with_min_keys(&[10, 20, 30]), None, None, &def);
        let interval = (Some(key(&[12])), Some(key(&[28])));

        let once = slice
            .cut(2, interval.0.as_deref(), interval.1.as_deref(), &def)
            .unwrap();
        let twice = once
            .cut(3, interval.0.as_deref(), interval.1.as_deref(), &def)
            .unwrap();

        assert_eq!(once.begin(), twice.begin());
        assert_eq!(once.end(), twice.end());
        assert_eq!(once.first_page_no(), twice.first_page_no());
        assert_eq!(once.last_page_no(), twice.last_page_no());
    }

    #[test]
    fn test_pin_blocks_wait() {
        let def = KeyDef::new(1);
        let slice = Slice::new(1, run_with_min_keys(&[10]), None, None, &def);

        slice.pin();
        slice.pin();
        assert_eq!(slice.pin_count(), 2);

        let waiter = {
            let slice = slice.clone();
            std::thread::spawn(move || {
                slice.wait_pinned();
                slice.pin_count()
            })
        };
        slice.unpin();
        slice.unpin();
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
