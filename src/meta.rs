// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Decoded run metadata: the run-level header and the per-page table
//! that the sibling index file carries.

use std::path::Path;

use bytes::Bytes;
use getset::{
    CopyGetters,
    Getters,
};

use crate::{
    bloom::Bloom,
    errs::{
        Result,
        RunError,
    },
    keydef::{
        decode_key,
        encode_key,
        Field,
    },
    xlog::{
        read_map,
        MapWriter,
    },
};

const RUN_INFO_MIN_KEY: u8 = 1;
const RUN_INFO_MAX_KEY: u8 = 2;
const RUN_INFO_MIN_LSN: u8 = 3;
const RUN_INFO_MAX_LSN: u8 = 4;
const RUN_INFO_PAGE_COUNT: u8 = 5;
const RUN_INFO_BLOOM: u8 = 6;

/// All run-info keys but BLOOM are mandatory.
const RUN_INFO_KEY_MAP: u64 = (1 << RUN_INFO_MIN_KEY)
    | (1 << RUN_INFO_MAX_KEY)
    | (1 << RUN_INFO_MIN_LSN)
    | (1 << RUN_INFO_MAX_LSN)
    | (1 << RUN_INFO_PAGE_COUNT);

const PAGE_INFO_OFFSET: u8 = 1;
const PAGE_INFO_SIZE: u8 = 2;
const PAGE_INFO_ROW_COUNT: u8 = 3;
const PAGE_INFO_MIN_KEY: u8 = 4;
const PAGE_INFO_UNPACKED_SIZE: u8 = 5;
const PAGE_INFO_PAGE_INDEX_OFFSET: u8 = 6;

const PAGE_INFO_KEY_MAP: u64 = (1 << PAGE_INFO_OFFSET)
    | (1 << PAGE_INFO_SIZE)
    | (1 << PAGE_INFO_ROW_COUNT)
    | (1 << PAGE_INFO_MIN_KEY)
    | (1 << PAGE_INFO_UNPACKED_SIZE)
    | (1 << PAGE_INFO_PAGE_INDEX_OFFSET);

fn run_info_key_name(code: u8) -> &'static str {
    match code {
        | RUN_INFO_MIN_KEY => "MIN_KEY",
        | RUN_INFO_MAX_KEY => "MAX_KEY",
        | RUN_INFO_MIN_LSN => "MIN_LSN",
        | RUN_INFO_MAX_LSN => "MAX_LSN",
        | RUN_INFO_PAGE_COUNT => "PAGE_COUNT",
        | _ => "?",
    }
}

fn page_info_key_name(code: u8) -> &'static str {
    match code {
        | PAGE_INFO_OFFSET => "OFFSET",
        | PAGE_INFO_SIZE => "SIZE",
        | PAGE_INFO_ROW_COUNT => "ROW_COUNT",
        | PAGE_INFO_MIN_KEY => "MIN_KEY",
        | PAGE_INFO_UNPACKED_SIZE => "UNPACKED_SIZE",
        | PAGE_INFO_PAGE_INDEX_OFFSET => "PAGE_INDEX_OFFSET",
        | _ => "?",
    }
}

fn missing_key(key_map: u64, name: fn(u8) -> &'static str) -> &'static str {
    name(key_map.trailing_zeros() as u8)
}

/// On-disk description of one compressed page.
///
/// `offset`/`size` locate the page's frame in the data file;
/// `unpacked_size` is the exact decompressed payload length and
/// `page_index_offset` points at the offset-table row inside it.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct PageInfo {
    #[getset(get_copy = "pub")]
    offset: u64,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    row_count: u32,
    #[getset(get_copy = "pub")]
    unpacked_size: u64,
    #[getset(get_copy = "pub")]
    page_index_offset: u64,
    /// Smallest key stored in the page.
    #[getset(get = "pub")]
    min_key: Vec<Field>,
}

impl PageInfo {
    pub(crate) fn new(
        offset: u64,
        size: u64,
        row_count: u32,
        unpacked_size: u64,
        page_index_offset: u64,
        min_key: Vec<Field>,
    ) -> Self {
        debug_assert!(page_index_offset < unpacked_size);
        PageInfo {
            offset,
            size,
            row_count,
            unpacked_size,
            page_index_offset,
            min_key,
        }
    }

    pub(crate) fn encode_body(&self) -> Bytes {
        let mut map = MapWriter::new();
        map.put_u64(PAGE_INFO_OFFSET, self.offset);
        map.put_u64(PAGE_INFO_SIZE, self.size);
        map.put_u64(PAGE_INFO_ROW_COUNT, self.row_count as u64);
        map.put_bytes(PAGE_INFO_MIN_KEY, &encode_key(&self.min_key));
        map.put_u64(PAGE_INFO_UNPACKED_SIZE, self.unpacked_size);
        map.put_u64(PAGE_INFO_PAGE_INDEX_OFFSET, self.page_index_offset);
        map.finish()
    }

    pub(crate) fn decode_body(body: Bytes, path: &Path) -> Result<PageInfo> {
        let corrupt =
            |reason: String| RunError::invalid_run(path, format!("can't decode page info: {reason}"));

        let mut key_map = PAGE_INFO_KEY_MAP;
        let mut offset = 0u64;
        let mut size = 0u64;
        let mut row_count = 0u32;
        let mut unpacked_size = 0u64;
        let mut page_index_offset = 0u64;
        let mut min_key = Vec::new();

        let entries =
            read_map(body).ok_or_else(|| corrupt("truncated row body".to_string()))?;
        for entry in entries {
            key_map &= !(1u64 << entry.code);
            match entry.code {
                | PAGE_INFO_OFFSET => {
                    offset = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed OFFSET".to_string()))?;
                },
                | PAGE_INFO_SIZE => {
                    size = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed SIZE".to_string()))?;
                },
                | PAGE_INFO_ROW_COUNT => {
                    row_count = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed ROW_COUNT".to_string()))?
                        as u32;
                },
                | PAGE_INFO_MIN_KEY => {
                    min_key = decode_key(entry.value)
                        .ok_or_else(|| corrupt("malformed MIN_KEY".to_string()))?;
                },
                | PAGE_INFO_UNPACKED_SIZE => {
                    unpacked_size = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed UNPACKED_SIZE".to_string()))?;
                },
                | PAGE_INFO_PAGE_INDEX_OFFSET => {
                    page_index_offset = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed PAGE_INDEX_OFFSET".to_string()))?;
                },
                | _ => {},
            }
        }
        if key_map != 0 {
            return Err(corrupt(format!(
                "missing mandatory key {}",
                missing_key(key_map, page_info_key_name)
            )));
        }
        if page_index_offset >= unpacked_size {
            return Err(corrupt("page index offset out of bounds".to_string()));
        }
        Ok(PageInfo {
            offset,
            size,
            row_count,
            unpacked_size,
            page_index_offset,
            min_key,
        })
    }
}

/// Decoded run metadata: key/LSN ranges, per-page table and the optional
/// bloom filter. `size`/`keys` are running totals over the page table.
#[derive(Debug, PartialEq, Getters, CopyGetters)]
pub struct RunInfo {
    #[getset(get = "pub")]
    min_key: Vec<Field>,
    #[getset(get = "pub")]
    max_key: Vec<Field>,
    #[getset(get_copy = "pub")]
    min_lsn: i64,
    #[getset(get_copy = "pub")]
    max_lsn: i64,
    pages: Vec<PageInfo>,
    bloom: Option<Bloom>,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    keys: u64,
}

impl RunInfo {
    pub(crate) fn new(
        min_key: Vec<Field>,
        max_key: Vec<Field>,
        min_lsn: i64,
        max_lsn: i64,
        bloom: Option<Bloom>,
    ) -> Self {
        RunInfo {
            min_key,
            max_key,
            min_lsn,
            max_lsn,
            pages: Vec::new(),
            bloom,
            size: 0,
            keys: 0,
        }
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    #[inline]
    pub fn pages(&self) -> &[PageInfo] {
        &self.pages
    }

    #[inline]
    pub fn page(&self, page_no: u32) -> &PageInfo {
        &self.pages[page_no as usize]
    }

    #[inline]
    pub fn bloom(&self) -> Option<&Bloom> {
        self.bloom.as_ref()
    }

    /// Append a decoded page, keeping the running totals current.
    pub(crate) fn push_page(&mut self, page: PageInfo) {
        self.size += page.size();
        self.keys += page.row_count() as u64;
        self.pages.push(page);
    }

    /// Encode the run-info row body. The page table is not part of this
    /// row; pages follow as separate `PAGE_INFO` rows.
    pub(crate) fn encode_body(&self) -> Bytes {
        let mut map = MapWriter::new();
        map.put_bytes(RUN_INFO_MIN_KEY, &encode_key(&self.min_key));
        map.put_bytes(RUN_INFO_MAX_KEY, &encode_key(&self.max_key));
        map.put_i64(RUN_INFO_MIN_LSN, self.min_lsn);
        map.put_i64(RUN_INFO_MAX_LSN, self.max_lsn);
        map.put_u64(RUN_INFO_PAGE_COUNT, self.pages.len() as u64);
        if let Some(bloom) = &self.bloom {
            map.put_bytes(RUN_INFO_BLOOM, &bloom.encode());
        }
        map.finish()
    }

    /// Decode a run-info row. Returns the header (with an empty page
    /// table) and the declared page count the caller must read.
    pub(crate) fn decode_body(body: Bytes, path: &Path) -> Result<(RunInfo, u32)> {
        let corrupt =
            |reason: String| RunError::invalid_run(path, format!("can't decode run info: {reason}"));

        let mut key_map = RUN_INFO_KEY_MAP;
        let mut min_key = Vec::new();
        let mut max_key = Vec::new();
        let mut min_lsn = 0i64;
        let mut max_lsn = 0i64;
        let mut page_count = 0u32;
        let mut bloom = None;

        let entries =
            read_map(body).ok_or_else(|| corrupt("truncated row body".to_string()))?;
        for entry in entries {
            key_map &= !(1u64 << entry.code);
            match entry.code {
                | RUN_INFO_MIN_KEY => {
                    min_key = decode_key(entry.value)
                        .ok_or_else(|| corrupt("malformed MIN_KEY".to_string()))?;
                },
                | RUN_INFO_MAX_KEY => {
                    max_key = decode_key(entry.value)
                        .ok_or_else(|| corrupt("malformed MAX_KEY".to_string()))?;
                },
                | RUN_INFO_MIN_LSN => {
                    min_lsn = entry
                        .as_i64()
                        .ok_or_else(|| corrupt("malformed MIN_LSN".to_string()))?;
                },
                | RUN_INFO_MAX_LSN => {
                    max_lsn = entry
                        .as_i64()
                        .ok_or_else(|| corrupt("malformed MAX_LSN".to_string()))?;
                },
                | RUN_INFO_PAGE_COUNT => {
                    page_count = entry
                        .as_u64()
                        .ok_or_else(|| corrupt("malformed PAGE_COUNT".to_string()))?
                        as u32;
                },
                | RUN_INFO_BLOOM => {
                    bloom = Some(Bloom::decode(entry.value).map_err(|e| {
                        RunError::invalid_run(path, format!("can't decode run info: {e}"))
                    })?);
                },
                | _ => {},
            }
        }
        if key_map != 0 {
            return Err(corrupt(format!(
                "missing mandatory key {}",
                missing_key(key_map, run_info_key_name)
            )));
        }

        Ok((
            RunInfo {
                min_key,
                max_key,
                min_lsn,
                max_lsn,
                pages: Vec::new(),
                bloom,
                size: 0,
                keys: 0,
            },
            page_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydef::Field;

    fn key(vals: &[u64]) -> Vec<Field> {
        vals.iter().map(|v| Field::Uint(*v)).collect()
    }

    fn sample_page(offset: u64, min: u64) -> PageInfo {
        PageInfo::new(offset, 512, 10, 4096, 3800, key(&[min]))
    }

    #[test]
    fn test_page_info_roundtrip() {
        let page = sample_page(16, 7);
        let decoded = PageInfo::decode_body(page.encode_body(), Path::new("x.index")).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_page_info_missing_mandatory_key() {
        let mut map = MapWriter::new();
        map.put_u64(PAGE_INFO_OFFSET, 0);
        map.put_u64(PAGE_INFO_SIZE, 10);
        map.put_u64(PAGE_INFO_ROW_COUNT, 1);
        map.put_u64(PAGE_INFO_UNPACKED_SIZE, 100);
        map.put_u64(PAGE_INFO_PAGE_INDEX_OFFSET, 90);
        // MIN_KEY deliberately absent
        let err =
            PageInfo::decode_body(map.finish(), Path::new("x.index")).unwrap_err();
        assert!(err.to_string().contains("missing mandatory key MIN_KEY"));
    }

    #[test]
    fn test_page_info_rejects_index_offset_out_of_bounds() {
        let page = PageInfo {
            offset: 0,
            size: 64,
            row_count: 1,
            unpacked_size: 100,
            page_index_offset: 100,
            min_key: key(&[1]),
        };
        assert!(PageInfo::decode_body(page.encode_body(), Path::new("x.index")).is_err());
    }

    #[test]
    fn test_run_info_roundtrip() {
        let mut info = RunInfo::new(key(&[1]), key(&[30]), 4, 90, None);
        info.push_page(sample_page(16, 1));
        info.push_page(sample_page(600, 11));

        let (mut decoded, count) =
            RunInfo::decode_body(info.encode_body(), Path::new("x.index")).unwrap();
        assert_eq!(count, 2);
        for page in info.pages() {
            let body = page.encode_body();
            decoded.push_page(PageInfo::decode_body(body, Path::new("x.index")).unwrap());
        }
        assert_eq!(decoded, info);
        assert_eq!(decoded.size(), 1024);
        assert_eq!(decoded.keys(), 20);
    }

    #[test]
    fn test_run_info_with_bloom_roundtrip() {
        let mut bloom = Bloom::for_items(10, 0.01);
        bloom.add(0xdead_beef);
        let info = RunInfo::new(key(&[1]), key(&[2]), 0, 1, Some(bloom));
        let (decoded, _) =
            RunInfo::decode_body(info.encode_body(), Path::new("x.index")).unwrap();
        assert_eq!(decoded.bloom(), info.bloom());
    }

    #[test]
    fn test_run_info_missing_mandatory_key_names_it() {
        let mut map = MapWriter::new();
        map.put_bytes(RUN_INFO_MIN_KEY, &encode_key(&key(&[1])));
        map.put_i64(RUN_INFO_MIN_LSN, 0);
        map.put_i64(RUN_INFO_MAX_LSN, 5);
        map.put_u64(RUN_INFO_PAGE_COUNT, 0);
        let err = RunInfo::decode_body(map.finish(), Path::new("x.index")).unwrap_err();
        assert!(err.to_string().contains("missing mandatory key MAX_KEY"));
    }
}
