//! Decoder for the pgoutput logical replication wire format.
//!
//! Pure byte parsing, no I/O. Only the message kinds the pipeline
//! consumes are decoded in full; everything else is reported as
//! `Skipped` so the polling loop can ignore it without failing.
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>

use serde_json::Value;

use crate::lsn::Lsn;
use crate::observer::FieldImage;

/// Decoding failures. The polling loop logs and skips the offending
/// message; a malformed message never halts replication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid UTF-8 in message string")]
    InvalidUtf8,
    #[error("empty message")]
    Empty,
    #[error("unknown message kind 0x{0:02X}")]
    UnknownKind(u8),
    #[error("unknown tuple marker 0x{0:02X}")]
    UnknownTupleMarker(u8),
    #[error("unknown column kind 0x{0:02X}")]
    UnknownColumnKind(u8),
}

/// Column descriptor from a Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Part of the replica key.
    pub key: bool,
    pub name: String,
    pub type_oid: u32,
}

/// Table descriptor from a Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub columns: Vec<RelationColumn>,
}

/// Raw column value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Null,
    /// A large value the update did not touch; not carried in the log.
    Unchanged,
    Text(String),
}

/// One row image: raw values in relation column order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTuple(pub Vec<RawValue>);

/// A decoded replication message.
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Begin {
        /// Location of this transaction's commit record.
        final_lsn: Lsn,
        /// Microseconds since the PostgreSQL epoch (2000-01-01).
        commit_ts_micros: i64,
        xid: u32,
    },
    Commit {
        end_lsn: Lsn,
        commit_ts_micros: i64,
    },
    Relation(Relation),
    Insert {
        relation: u32,
        new: RawTuple,
    },
    Update {
        relation: u32,
        old: Option<RawTuple>,
        key: Option<RawTuple>,
        new: RawTuple,
    },
    Delete {
        relation: u32,
        old: Option<RawTuple>,
        key: Option<RawTuple>,
    },
    /// A message kind the pipeline has no use for (Origin, Type,
    /// Truncate, logical decoding messages).
    Skipped(u8),
}

/// Decode one pgoutput message. The first byte selects the kind.
pub fn decode(buf: &[u8]) -> Result<WalMessage, WalError> {
    let (&kind, payload) = buf.split_first().ok_or(WalError::Empty)?;
    let mut r = ByteReader::new(payload);
    match kind {
        b'B' => {
            let final_lsn = Lsn(r.u64()?);
            let commit_ts_micros = r.i64()?;
            let xid = r.u32()?;
            Ok(WalMessage::Begin {
                final_lsn,
                commit_ts_micros,
                xid,
            })
        }
        b'C' => {
            let _flags = r.u8()?;
            let _commit_lsn = r.u64()?;
            let end_lsn = Lsn(r.u64()?);
            let commit_ts_micros = r.i64()?;
            Ok(WalMessage::Commit {
                end_lsn,
                commit_ts_micros,
            })
        }
        b'R' => decode_relation(&mut r),
        b'I' => {
            let relation = r.u32()?;
            match r.u8()? {
                b'N' => Ok(WalMessage::Insert {
                    relation,
                    new: r.tuple()?,
                }),
                other => Err(WalError::UnknownTupleMarker(other)),
            }
        }
        b'U' => decode_update(&mut r),
        b'D' => decode_delete(&mut r),
        b'O' | b'Y' | b'T' | b'M' => Ok(WalMessage::Skipped(kind)),
        other => Err(WalError::UnknownKind(other)),
    }
}

fn decode_relation(r: &mut ByteReader<'_>) -> Result<WalMessage, WalError> {
    let oid = r.u32()?;
    let schema = r.cstring()?;
    let name = r.cstring()?;
    let _replica_identity = r.u8()?;
    let count = r.i16()?.max(0) as usize;

    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let flags = r.u8()?;
        let col_name = r.cstring()?;
        let type_oid = r.u32()?;
        let _type_modifier = r.i32()?;
        columns.push(RelationColumn {
            key: flags & 1 != 0,
            name: col_name,
            type_oid,
        });
    }

    Ok(WalMessage::Relation(Relation {
        oid,
        schema,
        name,
        columns,
    }))
}

fn decode_update(r: &mut ByteReader<'_>) -> Result<WalMessage, WalError> {
    let relation = r.u32()?;
    let mut old = None;
    let mut key = None;

    let mut marker = r.u8()?;
    if marker == b'O' {
        old = Some(r.tuple()?);
        marker = r.u8()?;
    } else if marker == b'K' {
        key = Some(r.tuple()?);
        marker = r.u8()?;
    }
    if marker != b'N' {
        return Err(WalError::UnknownTupleMarker(marker));
    }

    Ok(WalMessage::Update {
        relation,
        old,
        key,
        new: r.tuple()?,
    })
}

fn decode_delete(r: &mut ByteReader<'_>) -> Result<WalMessage, WalError> {
    let relation = r.u32()?;
    match r.u8()? {
        b'O' => Ok(WalMessage::Delete {
            relation,
            old: Some(r.tuple()?),
            key: None,
        }),
        b'K' => Ok(WalMessage::Delete {
            relation,
            old: None,
            key: Some(r.tuple()?),
        }),
        other => Err(WalError::UnknownTupleMarker(other)),
    }
}

/// Convert a raw wire value into the observer-facing image, using the
/// column's type to pick a JSON scalar.
#[must_use]
pub fn field_image(column: &RelationColumn, raw: &RawValue) -> FieldImage {
    match raw {
        RawValue::Null => FieldImage::Null,
        RawValue::Unchanged => FieldImage::Unchanged,
        RawValue::Text(text) => FieldImage::Value(decode_scalar(column.type_oid, text)),
    }
}

/// Map a text-format value to a typed JSON scalar by type OID.
/// Anything unrecognized, and anything that fails to parse, stays a
/// string; `numeric` stays a string to preserve precision.
#[must_use]
pub fn decode_scalar(type_oid: u32, text: &str) -> Value {
    const BOOL: u32 = 16;
    const INT8: u32 = 20;
    const INT2: u32 = 21;
    const INT4: u32 = 23;
    const FLOAT4: u32 = 700;
    const FLOAT8: u32 = 701;

    match type_oid {
        BOOL => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        INT2 | INT4 | INT8 => text
            .parse::<i64>()
            .map_or_else(|_| Value::String(text.to_string()), Value::from),
        FLOAT4 | FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or_else(|| Value::String(text.to_string()), Value::Number),
        _ => Value::String(text.to_string()),
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WalError> {
        if self.buf.len() < n {
            return Err(WalError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, WalError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, WalError> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, WalError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, WalError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn cstring(&mut self) -> Result<String, WalError> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(WalError::Truncated)?;
        let bytes = self.take(nul)?;
        self.take(1)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WalError::InvalidUtf8)
    }

    fn tuple(&mut self) -> Result<RawTuple, WalError> {
        let count = self.i16()?.max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = match self.u8()? {
                b'n' => RawValue::Null,
                b'u' => RawValue::Unchanged,
                b't' => {
                    let len = self.i32()?.max(0) as usize;
                    let bytes = self.take(len)?;
                    RawValue::Text(
                        String::from_utf8(bytes.to_vec()).map_err(|_| WalError::InvalidUtf8)?,
                    )
                }
                other => return Err(WalError::UnknownColumnKind(other)),
            };
            values.push(value);
        }
        Ok(RawTuple(values))
    }
}
