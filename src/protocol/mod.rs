//! PostgreSQL logical-replication wire protocol.
//!
//! The replication connection speaks the simple query protocol only, which
//! rules the regular client crate out; this module carries a purpose-built
//! TCP client plus the pgoutput message model and decoder.

pub mod client;
pub mod decoder;
pub mod message;
pub mod scram;

pub use client::{CopyOut, PgConnectOptions, ReplicationClient, StreamMessage};
pub use decoder::{decode_logical, DecodeError};
pub use message::{
    Cell, DeleteBody, InsertBody, LogicalMessage, RelationBody, RelationColumn, Tuple, TypeBody,
    UpdateBody,
};
pub use scram::{ScramError, ScramSha256};
