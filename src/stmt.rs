// Copyright (c) RubidiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use bytes::{
    Bytes,
    BytesMut,
};

use crate::{
    keydef::{
        decode_key,
        encode_key,
        Field,
        KeyDef,
    },
    xlog::{
        read_map,
        MapWriter,
        ROW_DELETE,
        ROW_REPLACE,
        ROW_UPSERT,
    },
};

/// Row-body map codes for statement rows.
const STMT_TUPLE: u8 = 1;
const STMT_LSN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtKind {
    Replace,
    Delete,
    Upsert,
}

/// An immutable, reference-counted record: a type, a field tuple and the
/// LSN that versions it. DELETE statements carry only their key fields.
///
/// Statements are shared between iterator caches, streams and the merge
/// layer above; cloning the [`StmtRef`] is the ref/unref protocol.
#[derive(Debug, PartialEq, Eq)]
pub struct Statement {
    kind: StmtKind,
    lsn: i64,
    fields: Vec<Field>,
}

pub type StmtRef = Arc<Statement>;

impl Statement {
    pub fn replace(fields: Vec<Field>, lsn: i64) -> StmtRef {
        Arc::new(Statement {
            kind: StmtKind::Replace,
            lsn,
            fields,
        })
    }

    pub fn delete(key: Vec<Field>, lsn: i64) -> StmtRef {
        Arc::new(Statement {
            kind: StmtKind::Delete,
            lsn,
            fields: key,
        })
    }

    pub fn upsert(fields: Vec<Field>, lsn: i64) -> StmtRef {
        Arc::new(Statement {
            kind: StmtKind::Upsert,
            lsn,
            fields,
        })
    }

    #[inline]
    pub fn kind(&self) -> StmtKind {
        self.kind
    }

    #[inline]
    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The key projection under the given comparator.
    pub fn key<'a>(&'a self, def: &KeyDef) -> &'a [Field] {
        let n = def.part_count().min(self.fields.len());
        &self.fields[..n]
    }

    pub(crate) fn row_type(&self) -> u8 {
        match self.kind {
            | StmtKind::Replace => ROW_REPLACE,
            | StmtKind::Delete => ROW_DELETE,
            | StmtKind::Upsert => ROW_UPSERT,
        }
    }

    /// Encode this statement as a framed row body.
    pub(crate) fn encode_body(&self) -> Bytes {
        let mut map = MapWriter::new();
        map.put_bytes(STMT_TUPLE, &encode_key(&self.fields));
        map.put_i64(STMT_LSN, self.lsn);
        map.finish()
    }

    /// Decode a statement row. `is_primary` is false for secondary-index
    /// runs, which never contain UPSERTs (upserts are squashed against
    /// the primary index before a secondary run is written).
    pub(crate) fn decode_row(
        ty: u8,
        body: Bytes,
        is_primary: bool,
    ) -> std::result::Result<Statement, String> {
        let kind = match ty {
            | ROW_REPLACE => StmtKind::Replace,
            | ROW_DELETE => StmtKind::Delete,
            | ROW_UPSERT if is_primary => StmtKind::Upsert,
            | ROW_UPSERT => {
                return Err("unexpected UPSERT in a secondary-index run".to_string());
            },
            | other => return Err(format!("unknown statement row type {other}")),
        };

        let mut fields = None;
        let mut lsn = None;
        for entry in read_map(body).ok_or("truncated statement row")? {
            match entry.code {
                | STMT_TUPLE => {
                    fields = Some(
                        decode_key(entry.value).ok_or("malformed statement tuple")?,
                    );
                },
                | STMT_LSN => {
                    lsn = Some(entry.as_i64().ok_or("malformed statement lsn")?);
                },
                | _ => {}, // forward compatible
            }
        }

        let fields = fields.ok_or("statement row missing mandatory key TUPLE")?;
        let lsn = lsn.ok_or("statement row missing mandatory key LSN")?;
        if fields.is_empty() {
            return Err("statement tuple has no fields".to_string());
        }
        Ok(Statement { kind, lsn, fields })
    }

    /// Encode as a complete framed row, header included.
    pub(crate) fn encode_row(&self, buf: &mut BytesMut) {
        crate::xlog::encode_row(self.row_type(), &self.encode_body(), buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(vals: &[u64]) -> Vec<Field> {
        vals.iter().map(|v| Field::Uint(*v)).collect()
    }

    #[test]
    fn test_row_roundtrip() {
        let stmt = Statement::replace(fields(&[1, 2, 3]), 99);
        let decoded =
            Statement::decode_row(stmt.row_type(), stmt.encode_body(), true).unwrap();
        assert_eq!(&decoded, stmt.as_ref());

        let del = Statement::delete(fields(&[7]), 100);
        let decoded = Statement::decode_row(del.row_type(), del.encode_body(), true).unwrap();
        assert_eq!(decoded.kind(), StmtKind::Delete);
        assert_eq!(decoded.lsn(), 100);
    }

    #[test]
    fn test_upsert_rejected_in_secondary_run() {
        let up = Statement::upsert(fields(&[1, 2]), 5);
        assert!(Statement::decode_row(up.row_type(), up.encode_body(), false).is_err());
        assert!(Statement::decode_row(up.row_type(), up.encode_body(), true).is_ok());
    }

    #[test]
    fn test_unknown_map_codes_are_skipped() {
        let stmt = Statement::replace(fields(&[4]), 1);
        let mut map = MapWriter::new();
        map.put_bytes(STMT_TUPLE, &encode_key(stmt.fields()));
        map.put_i64(STMT_LSN, stmt.lsn());
        map.put_bytes(200, b"from the future");
        let decoded = Statement::decode_row(ROW_REPLACE, map.finish(), true).unwrap();
        assert_eq!(&decoded, stmt.as_ref());
    }

    #[test]
    fn test_missing_mandatory_key_is_an_error() {
        let mut map = MapWriter::new();
        map.put_i64(STMT_LSN, 3);
        let err = Statement::decode_row(ROW_REPLACE, map.finish(), true).unwrap_err();
        assert!(err.contains("TUPLE"));
    }

    #[test]
    fn test_key_projection() {
        let def = KeyDef::new(2);
        let stmt = Statement::replace(fields(&[10, 20, 30]), 1);
        assert_eq!(stmt.key(&def), &fields(&[10, 20])[..]);
    }
}
