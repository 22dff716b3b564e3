// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Framed container format shared by run data files and their sibling
//! index files.
//!
//! A file is a fixed header followed by a sequence of transaction
//! frames. Each frame is a small header plus a zstd-compressed payload;
//! the payload expands to a concatenation of typed rows:
//!
//! ```text
//! +--------------------------------------------+
//! | magic (8) | version (4) | filetype (4)     |
//! +--------------------------------------------+
//! | compressed_size (4) | unpacked_size (4)    |
//! | crc32 of compressed payload (4)            |
//! | compressed payload ...                     |
//! +--------------------------------------------+
//! | ... more frames                            |
//! +--------------------------------------------+
//! ```
//!
//! Row framing inside a decompressed payload is `type (1) | body_len (4)
//! | body`. Row bodies are typed key-maps (see [`MapWriter`]); unknown
//! map codes are skipped so old readers survive new writers, while a
//! missing mandatory code is a hard corruption error at the call site.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{
        Path,
        PathBuf,
    },
};

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

use crate::{
    env,
    errs::{
        Result,
        RunError,
    },
};

pub(crate) const XLOG_MAGIC: [u8; 8] = *b"RBDMXLOG";
pub(crate) const XLOG_VERSION: u32 = 1;
pub(crate) const XLOG_HEADER_SIZE: usize = 16;
pub(crate) const TX_HEADER_SIZE: usize = 12;
pub(crate) const ROW_HEADER_SIZE: usize = 5;

/// Statement rows.
pub(crate) const ROW_REPLACE: u8 = 1;
pub(crate) const ROW_DELETE: u8 = 2;
pub(crate) const ROW_UPSERT: u8 = 3;
/// Metadata rows.
pub(crate) const ROW_RUN_INFO: u8 = 100;
pub(crate) const ROW_PAGE_INFO: u8 = 101;
pub(crate) const ROW_PAGE_INDEX: u8 = 102;

/// zstd level for freshly written frames; mirrors what the write path
/// of the engine uses for data pages.
pub(crate) const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Run = 1,
    Index = 2,
}

impl FileType {
    pub(crate) fn name(self) -> &'static str {
        match self {
            | FileType::Run => "RUN",
            | FileType::Index => "INDEX",
        }
    }

    fn from_u32(raw: u32) -> Option<FileType> {
        match raw {
            | 1 => Some(FileType::Run),
            | 2 => Some(FileType::Index),
            | _ => None,
        }
    }
}

/// Append a framed row to `buf`.
pub(crate) fn encode_row(ty: u8, body: &[u8], buf: &mut BytesMut) {
    buf.put_u8(ty);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
}

/// Decode the row starting at `offset` within a decompressed payload.
/// Returns `(type, body, next_offset)`, or `None` if the framing does
/// not fit the buffer.
pub(crate) fn row_at(data: &Bytes, offset: usize) -> Option<(u8, Bytes, usize)> {
    if offset + ROW_HEADER_SIZE > data.len() {
        return None;
    }
    let ty = data[offset];
    let body_len =
        u32::from_le_bytes(data[offset + 1..offset + 5].try_into().unwrap()) as usize;
    let body_beg = offset + ROW_HEADER_SIZE;
    let body_end = body_beg.checked_add(body_len)?;
    if body_end > data.len() {
        return None;
    }
    Some((ty, data.slice(body_beg..body_end), body_end))
}

/// Builder for a typed key-map row body: `entry_count (1)` then per
/// entry `code (1) | value_len (4) | value`. Length-prefixing every
/// value keeps unknown codes skippable.
pub(crate) struct MapWriter {
    count: u8,
    body: BytesMut,
}

impl MapWriter {
    pub(crate) fn new() -> Self {
        MapWriter {
            count: 0,
            body: BytesMut::new(),
        }
    }

    fn put_entry(&mut self, code: u8, value: &[u8]) {
        self.body.put_u8(code);
        self.body.put_u32_le(value.len() as u32);
        self.body.put_slice(value);
        self.count += 1;
    }

    pub(crate) fn put_u64(&mut self, code: u8, value: u64) {
        self.put_entry(code, &value.to_le_bytes());
    }

    pub(crate) fn put_i64(&mut self, code: u8, value: i64) {
        self.put_entry(code, &value.to_le_bytes());
    }

    pub(crate) fn put_bytes(&mut self, code: u8, value: &[u8]) {
        self.put_entry(code, value);
    }

    pub(crate) fn finish(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body.len());
        buf.put_u8(self.count);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// One decoded key-map entry.
pub(crate) struct MapEntry {
    pub(crate) code: u8,
    pub(crate) value: Bytes,
}

impl MapEntry {
    pub(crate) fn as_u64(&self) -> Option<u64> {
        Some(u64::from_le_bytes(self.value.as_ref().try_into().ok()?))
    }

    pub(crate) fn as_i64(&self) -> Option<i64> {
        Some(i64::from_le_bytes(self.value.as_ref().try_into().ok()?))
    }
}

/// Decode a key-map row body. Returns `None` on truncated framing.
pub(crate) fn read_map(mut body: Bytes) -> Option<Vec<MapEntry>> {
    if body.remaining() < 1 {
        return None;
    }
    let count = body.get_u8() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < ROW_HEADER_SIZE {
            return None;
        }
        let code = body.get_u8();
        let len = body.get_u32_le() as usize;
        if body.remaining() < len {
            return None;
        }
        entries.push(MapEntry {
            code,
            value: body.copy_to_bytes(len),
        });
    }
    if body.has_remaining() {
        return None;
    }
    Some(entries)
}

/// Sequential reader over a framed file: validates the header on open,
/// then yields one decompressed transaction at a time and rows within
/// it.
#[derive(Debug)]
pub(crate) struct XlogCursor {
    path: PathBuf,
    file: File,
    pos: u64,
    len: u64,
    tx: Option<TxRows>,
}

#[derive(Debug)]
struct TxRows {
    data: Bytes,
    pos: usize,
}

impl XlogCursor {
    pub(crate) fn open(path: &Path, expected: FileType) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let mut header = [0u8; XLOG_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)
            .map_err(|_| RunError::invalid_run(path, "truncated file header"))?;
        if header[0..8] != XLOG_MAGIC {
            return Err(RunError::invalid_run(path, "bad magic"));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != XLOG_VERSION {
            return Err(RunError::invalid_run(
                path,
                format!("unsupported version {version}"),
            ));
        }
        let raw_type = u32::from_le_bytes(header[12..16].try_into().unwrap());
        match FileType::from_u32(raw_type) {
            | Some(ty) if ty == expected => {},
            | Some(ty) => {
                return Err(RunError::invalid_run(
                    path,
                    format!(
                        "wrong file type (expected {}, got {})",
                        expected.name(),
                        ty.name()
                    ),
                ));
            },
            | None => {
                return Err(RunError::invalid_run(
                    path,
                    format!("unknown file type {raw_type}"),
                ));
            },
        }

        Ok(XlogCursor {
            path: path.to_path_buf(),
            file,
            pos: XLOG_HEADER_SIZE as u64,
            len,
            tx: None,
        })
    }

    /// Advance to the next transaction frame. Returns `false` at a
    /// clean end of file.
    pub(crate) fn next_tx(&mut self) -> Result<bool> {
        self.tx = None;
        if self.pos == self.len {
            return Ok(false);
        }

        let mut header = [0u8; TX_HEADER_SIZE];
        self.file
            .read_exact_at(&mut header, self.pos)
            .map_err(|_| self.eof_error())?;
        let compressed_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let unpacked_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut compressed = vec![0u8; compressed_size];
        self.file
            .read_exact_at(&mut compressed, self.pos + TX_HEADER_SIZE as u64)
            .map_err(|_| self.eof_error())?;
        if crc32fast::hash(&compressed) != crc {
            return Err(RunError::invalid_run(&self.path, "tx checksum mismatch"));
        }

        let mut data = env::alloc_buf(unpacked_size, "tx payload")?;
        let written = env::decompress_into(&compressed, &mut data)
            .map_err(|_| RunError::invalid_run(&self.path, "decompression failed"))?;
        if written != unpacked_size {
            return Err(RunError::invalid_run(&self.path, "unpacked size mismatch"));
        }

        self.pos += (TX_HEADER_SIZE + compressed_size) as u64;
        self.tx = Some(TxRows {
            data: Bytes::from(data),
            pos: 0,
        });
        Ok(true)
    }

    /// The next row of the current transaction, or `None` when the
    /// transaction is exhausted.
    pub(crate) fn next_row(&mut self) -> Result<Option<(u8, Bytes)>> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(None);
        };
        if tx.pos == tx.data.len() {
            return Ok(None);
        }
        match row_at(&tx.data, tx.pos) {
            | Some((ty, body, next)) => {
                tx.pos = next;
                Ok(Some((ty, body)))
            },
            | None => Err(RunError::invalid_run(&self.path, "truncated row")),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the underlying descriptor to the caller; used when a run
    /// data file is adopted after its header has been verified.
    pub(crate) fn into_file(self) -> File {
        self.file
    }

    fn eof_error(&self) -> RunError {
        RunError::invalid_run(&self.path, "unexpected EOF")
    }
}

/// Append-only writer for framed files. The read path owns this module;
/// the writer exists because the codec is symmetric and the fixture
/// builder and metadata round-trips need the encode direction.
pub(crate) struct XlogWriter {
    file: File,
    pos: u64,
}

impl XlogWriter {
    pub(crate) fn create(path: &Path, filetype: FileType) -> Result<Self> {
        let file = File::create(path)?;
        let mut header = BytesMut::with_capacity(XLOG_HEADER_SIZE);
        header.put_slice(&XLOG_MAGIC);
        header.put_u32_le(XLOG_VERSION);
        header.put_u32_le(filetype as u32);
        file.write_all_at(&header, 0)?;
        Ok(XlogWriter {
            file,
            pos: XLOG_HEADER_SIZE as u64,
        })
    }

    /// Compress and append one transaction frame built from an already
    /// concatenated row payload. Returns `(frame_offset, frame_size)` —
    /// exactly what a positional page read later re-reads.
    pub(crate) fn append_tx(&mut self, payload: &[u8]) -> Result<(u64, u64)> {
        let compressed = zstd::bulk::compress(payload, COMPRESSION_LEVEL)?;

        let mut frame = BytesMut::with_capacity(TX_HEADER_SIZE + compressed.len());
        frame.put_u32_le(compressed.len() as u32);
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(&compressed));
        frame.put_slice(&compressed);

        let offset = self.pos;
        self.file.write_all_at(&frame, offset)?;
        self.pos += frame.len() as u64;
        Ok((offset, frame.len() as u64))
    }

    pub(crate) fn sync(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
