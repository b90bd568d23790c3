//! Decoder for pgoutput logical messages.
//!
//! Message layout reference:
//! <https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>

use bytes::{Buf, Bytes};
use thiserror::Error;

use super::message::*;
use crate::lsn::Lsn;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0:?}")]
    InvalidType(char),
    #[error("invalid tuple cell type: {0:?}")]
    InvalidCellType(char),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Decodes one logical message from an XLogData payload.
pub fn decode_logical(mut data: Bytes) -> Result<LogicalMessage, DecodeError> {
    if !data.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }
    let tag = data.get_u8();
    match tag {
        b'B' => decode_begin(&mut data).map(LogicalMessage::Begin),
        b'C' => decode_commit(&mut data).map(LogicalMessage::Commit),
        b'O' => decode_origin(&mut data).map(LogicalMessage::Origin),
        b'R' => decode_relation(&mut data).map(LogicalMessage::Relation),
        b'Y' => decode_type(&mut data).map(LogicalMessage::Type),
        b'I' => decode_insert(&mut data).map(LogicalMessage::Insert),
        b'U' => decode_update(&mut data).map(LogicalMessage::Update),
        b'D' => decode_delete(&mut data).map(LogicalMessage::Delete),
        b'T' => decode_truncate(&mut data).map(LogicalMessage::Truncate),
        t => Err(DecodeError::InvalidType(t as char)),
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::NotEnoughData);
    }
    Ok(())
}

fn read_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let raw = buf.copy_to_bytes(n);
    buf.advance(1); // terminating NUL
    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, DecodeError> {
    need(buf, 8 + 8 + 4)?;
    Ok(BeginBody {
        final_lsn: Lsn(buf.get_u64()),
        timestamp: buf.get_i64(),
        xid: buf.get_u32(),
    })
}

fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, DecodeError> {
    need(buf, 1 + 8 + 8 + 8)?;
    Ok(CommitBody {
        flags: buf.get_u8(),
        commit_lsn: Lsn(buf.get_u64()),
        end_lsn: Lsn(buf.get_u64()),
        timestamp: buf.get_i64(),
    })
}

fn decode_origin(buf: &mut Bytes) -> Result<OriginBody, DecodeError> {
    need(buf, 8)?;
    Ok(OriginBody {
        commit_lsn: Lsn(buf.get_u64()),
        name: read_string(buf)?,
    })
}

fn decode_relation(buf: &mut Bytes) -> Result<RelationBody, DecodeError> {
    need(buf, 4)?;
    let id = buf.get_u32();
    let namespace = read_string(buf)?;
    let name = read_string(buf)?;
    need(buf, 1 + 2)?;
    let replica_identity = buf.get_u8();
    let ncols = buf.get_u16();

    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        need(buf, 1)?;
        let flags = buf.get_u8();
        let col_name = read_string(buf)?;
        need(buf, 8)?;
        columns.push(RelationColumn {
            flags,
            name: col_name,
            type_oid: buf.get_u32(),
            type_modifier: buf.get_i32(),
        });
    }

    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_type(buf: &mut Bytes) -> Result<TypeBody, DecodeError> {
    need(buf, 4)?;
    Ok(TypeBody {
        oid: buf.get_u32(),
        namespace: read_string(buf)?,
        name: read_string(buf)?,
    })
}

fn decode_insert(buf: &mut Bytes) -> Result<InsertBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    match buf.get_u8() {
        b'N' => {}
        t => {
            return Err(DecodeError::Protocol(format!(
                "expected new tuple marker, got {:?}",
                t as char
            )))
        }
    }
    Ok(InsertBody {
        relation_id,
        tuple: decode_tuple(buf)?,
    })
}

fn decode_update(buf: &mut Bytes) -> Result<UpdateBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();

    let (old_tuple, new_tuple) = match buf.get_u8() {
        // key or full old image, then the new tuple
        b'K' | b'O' => {
            let old = decode_tuple(buf)?;
            need(buf, 1)?;
            match buf.get_u8() {
                b'N' => {}
                t => {
                    return Err(DecodeError::Protocol(format!(
                        "expected new tuple after old image, got {:?}",
                        t as char
                    )))
                }
            }
            (Some(old), decode_tuple(buf)?)
        }
        b'N' => (None, decode_tuple(buf)?),
        t => return Err(DecodeError::InvalidType(t as char)),
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(buf: &mut Bytes) -> Result<DeleteBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    match buf.get_u8() {
        b'K' | b'O' => {}
        t => return Err(DecodeError::InvalidType(t as char)),
    }
    Ok(DeleteBody {
        relation_id,
        old_tuple: decode_tuple(buf)?,
    })
}

fn decode_truncate(buf: &mut Bytes) -> Result<TruncateBody, DecodeError> {
    need(buf, 5)?;
    let nrels = buf.get_u32();
    let options = buf.get_u8();
    need(buf, nrels as usize * 4)?;
    let mut relation_ids = Vec::with_capacity(nrels as usize);
    for _ in 0..nrels {
        relation_ids.push(buf.get_u32());
    }
    Ok(TruncateBody {
        relation_ids,
        options,
    })
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, DecodeError> {
    need(buf, 2)?;
    let ncols = buf.get_u16();
    let mut cells = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        need(buf, 1)?;
        let cell = match buf.get_u8() {
            b'n' => Cell::Null,
            b'u' => Cell::Toast,
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                Cell::Text(buf.copy_to_bytes(len))
            }
            b'b' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                Cell::Binary(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidCellType(t as char)),
        };
        cells.push(cell);
    }
    Ok(Tuple(cells))
}
