// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Run fixtures for tests and benches: build a valid run/index file
//! pair from an ordered statement list, the same shape the engine's
//! write path produces.

use std::path::{
    Path,
    PathBuf,
};

use bytes::BytesMut;
use tempfile::TempDir;

use crate::{
    bloom::Bloom,
    keydef::{
        Field,
        KeyDef,
    },
    meta::{
        PageInfo,
        RunInfo,
    },
    page::PAGE_INDEX_INDEX,
    recovery,
    run::RunRef,
    stmt::{
        Statement,
        StmtRef,
    },
    xlog::{
        encode_row,
        FileType,
        MapWriter,
        XlogWriter,
        ROW_PAGE_INDEX,
        ROW_PAGE_INFO,
        ROW_RUN_INFO,
    },
};

/// A REPLACE statement with unsigned key fields.
pub fn uint_stmt(fields: &[u64], lsn: i64) -> StmtRef {
    Statement::replace(fields.iter().map(|v| Field::Uint(*v)).collect(), lsn)
}

/// A DELETE statement with unsigned key fields.
pub fn uint_delete(key: &[u64], lsn: i64) -> StmtRef {
    Statement::delete(key.iter().map(|v| Field::Uint(*v)).collect(), lsn)
}

pub fn uint_key(fields: &[u64]) -> Vec<Field> {
    fields.iter().map(|v| Field::Uint(*v)).collect()
}

pub struct RunFixtureBuilder {
    stmts: Vec<StmtRef>,
    rows_per_page: u32,
    key_parts: usize,
    bloom_fpr: Option<f64>,
}

impl RunFixtureBuilder {
    /// Statements in run order: keys ascending, LSNs descending within
    /// a key.
    pub fn stmts(mut self, stmts: impl IntoIterator<Item = StmtRef>) -> Self {
        self.stmts.extend(stmts);
        self
    }

    pub fn rows_per_page(mut self, rows: u32) -> Self {
        assert!(rows > 0);
        self.rows_per_page = rows;
        self
    }

    pub fn key_parts(mut self, parts: usize) -> Self {
        self.key_parts = parts;
        self
    }

    pub fn bloom(mut self, fpr: f64) -> Self {
        self.bloom_fpr = Some(fpr);
        self
    }

    pub fn build(self) -> RunFixture {
        let dir = TempDir::new().expect("tempdir");
        let run_path = dir.path().join("00001.run");
        let index_path = dir.path().join("00001.index");
        let key_def = KeyDef::new(self.key_parts);

        let bloom = self.bloom_fpr.map(|fpr| {
            let mut bloom = Bloom::for_items(self.stmts.len() as u64, fpr);
            for stmt in &self.stmts {
                bloom.add(key_def.hash_key(stmt.fields()));
            }
            bloom
        });

        let (min_key, max_key, min_lsn, max_lsn) = if self.stmts.is_empty() {
            (Vec::new(), Vec::new(), 0, 0)
        } else {
            (
                self.stmts[0].key(&key_def).to_vec(),
                self.stmts[self.stmts.len() - 1].key(&key_def).to_vec(),
                self.stmts.iter().map(|s| s.lsn()).min().unwrap(),
                self.stmts.iter().map(|s| s.lsn()).max().unwrap(),
            )
        };
        let mut info = RunInfo::new(min_key, max_key, min_lsn, max_lsn, bloom);

        let mut writer = XlogWriter::create(&run_path, FileType::Run).expect("create run");
        for chunk in self.stmts.chunks(self.rows_per_page as usize) {
            let mut payload = BytesMut::new();
            let mut offsets = Vec::with_capacity(chunk.len());
            for stmt in chunk {
                offsets.push(payload.len() as u32);
                stmt.encode_row(&mut payload);
            }
            let page_index_offset = payload.len() as u64;

            let mut blob = Vec::with_capacity(offsets.len() * 4);
            for offset in &offsets {
                blob.extend_from_slice(&offset.to_le_bytes());
            }
            let mut map = MapWriter::new();
            map.put_bytes(PAGE_INDEX_INDEX, &blob);
            encode_row(ROW_PAGE_INDEX, &map.finish(), &mut payload);

            let unpacked_size = payload.len() as u64;
            let (offset, size) = writer.append_tx(&payload).expect("append page");
            info.push_page(PageInfo::new(
                offset,
                size,
                chunk.len() as u32,
                unpacked_size,
                page_index_offset,
                chunk[0].key(&key_def).to_vec(),
            ));
        }
        writer.sync().expect("sync run");

        let mut payload = BytesMut::new();
        encode_row(ROW_RUN_INFO, &info.encode_body(), &mut payload);
        for page in info.pages() {
            encode_row(ROW_PAGE_INFO, &page.encode_body(), &mut payload);
        }
        let mut writer = XlogWriter::create(&index_path, FileType::Index).expect("create index");
        writer.append_tx(&payload).expect("append index");
        writer.sync().expect("sync index");

        RunFixture {
            _dir: dir,
            run_path,
            index_path,
            info,
        }
    }
}

pub struct RunFixture {
    _dir: TempDir,
    run_path: PathBuf,
    index_path: PathBuf,
    info: RunInfo,
}

impl RunFixture {
    pub fn builder() -> RunFixtureBuilder {
        RunFixtureBuilder {
            stmts: Vec::new(),
            rows_per_page: 10,
            key_parts: 1,
            bloom_fpr: None,
        }
    }

    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// The metadata as written, for round-trip assertions.
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Load the fixture back through the regular recovery path.
    pub fn recover(&self) -> RunRef {
        recovery::recover(1, &self.index_path, &self.run_path).expect("recover fixture")
    }
}
