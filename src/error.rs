//! Error types for the replication bridge.
//!
//! One crate-level enum with constructor helpers; parsers with a closed
//! error set (tags, copy format, pgoutput, SCRAM) keep their own types and
//! convert into this one at the module boundary.

use thiserror::Error;

use crate::conftags::SyntaxError;
use crate::pgcopy::CopyError;
use crate::protocol::decoder::DecodeError;
use crate::protocol::scram::ScramError;

/// Bridge-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad flags, missing tags, invalid env)
    #[error("configuration error: {0}")]
    Config(String),

    /// Query-connection error
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Replication wire-protocol violation
    #[error("replication protocol error: {0}")]
    Protocol(String),

    /// Logical message the stream cannot be advanced past
    #[error("unknown logical message type '{0}'")]
    UnknownMessage(char),

    /// pgoutput payload decoding error
    #[error("pgoutput decode error: {0}")]
    PgOutput(#[from] DecodeError),

    /// Binary copy stream error
    #[error("copy stream error: {0}")]
    Copy(#[from] CopyError),

    /// Comment tag parsing error
    #[error("tag config error: {0}")]
    Tags(#[from] SyntaxError),

    /// SCRAM authentication failure
    #[error("scram auth error: {0}")]
    Scram(#[from] ScramError),

    /// Postgres type OID can not be zero
    #[error("postgres type OID can't be zero")]
    ZeroTypeOid,

    /// Type missing after a discovery attempt
    #[error("can not find discovered type {0}")]
    TypeNotFound(u32),

    /// Type of a kind the registry can not represent
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// Received result tuple is smaller than a configured column position
    #[error("column {0} out of tuple range")]
    ColumnOutOfRange(String),

    /// Column value decoding error
    #[error("decode column value: {0}")]
    Value(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error towards the search engine
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the search engine
    #[error("search engine returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// Bulk response carried item-level errors that can not be ignored
    #[error("commit bulk returned errors")]
    BulkCommitFail,

    /// A single document can never fit the bulk buffer
    #[error("document of {size} bytes exceeds bulk buffer capacity {cap}")]
    DocumentTooLarge { size: usize, cap: usize },

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a value-decoding error
    pub fn value(msg: impl Into<String>) -> Self {
        Self::Value(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the flusher may retry the operation that produced this error.
    ///
    /// Only downstream transport failures are retriable; everything reaching
    /// the replication stream is not, because a sent standby position can
    /// never be rewound.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::HttpStatus { .. } | Self::BulkCommitFail
        )
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
