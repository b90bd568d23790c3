//! pgoutput protocol version 1 message model.

use bytes::Bytes;

use crate::lsn::Lsn;

/// A decoded logical replication message.
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationBody),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

impl LogicalMessage {
    /// Short operation label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalMessage::Begin(_) => "begin",
            LogicalMessage::Commit(_) => "commit",
            LogicalMessage::Origin(_) => "origin",
            LogicalMessage::Relation(_) => "relation",
            LogicalMessage::Type(_) => "type",
            LogicalMessage::Insert(_) => "insert",
            LogicalMessage::Update(_) => "update",
            LogicalMessage::Delete(_) => "delete",
            LogicalMessage::Truncate(_) => "truncate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: Lsn,
    pub name: String,
}

/// Table description, sent at stream start and after DDL.
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    /// Bit 1 marks primary-key membership.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

/// User-defined type announcement.
#[derive(Debug, Clone)]
pub struct TypeBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old row image ('K' key columns or 'O' full row); absent when the
    /// replica identity does not expose it.
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub relation_ids: Vec<u32>,
    pub options: u8,
}

/// One row image: a cell per column ordinal.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<Cell>);

impl Tuple {
    /// Raw comparable bytes of a cell; `None` for NULL and unchanged TOAST.
    pub fn cell_bytes(&self, pos: usize) -> Option<&[u8]> {
        match self.0.get(pos) {
            Some(Cell::Text(b)) | Some(Cell::Binary(b)) => Some(b),
            _ => None,
        }
    }
}

/// A single column value as carried by the stream.
#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    /// Unchanged TOASTed value, not present in the stream.
    Toast,
    Text(Bytes),
    Binary(Bytes),
}
