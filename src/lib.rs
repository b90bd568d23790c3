//! # pg2search - PostgreSQL to search-engine replication bridge
//!
//! One-way, near-realtime replication from a PostgreSQL logical-replication
//! publication into an Elasticsearch/OpenSearch cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  pgoutput   ┌─────────────┐  documents  ┌───────────┐
//! │ PostgreSQL │────────────▶│ replication │────────────▶│  flusher  │
//! │   (WAL)    │             │   reader    │    pipe     │  (_bulk)  │
//! └────────────┘             └─────────────┘             └─────┬─────┘
//!        ▲                                                     │
//!        └──────────── standby status (acked LSN) ◀────────────┘
//! ```
//!
//! The reader owns the replication connection: it drives the initial
//! snapshot copy and the streaming phase, turning row events into bulk
//! header/body pairs. The flusher buffers NDJSON, posts batches, and only
//! after a successful batch publishes the acknowledged WAL position that
//! the reader reports back upstream. A crash therefore resumes from the
//! last position whose effects are durable downstream.
//!
//! Configuration lives in the database itself: table and column comments
//! carry `key:"value"` tags (see [`conftags`]) that select what is indexed,
//! how documents are keyed and routed, and which child tables are inlined
//! into parent documents via scripted upserts.

pub mod conftags;
pub mod document;
pub mod error;
pub mod lag;
pub mod lsn;
pub mod metrics;
pub mod pgcopy;
pub mod pipe;
pub mod protocol;
pub mod reindex;
pub mod replication;
pub mod schema;
pub mod search;
pub mod types;

pub use error::{Error, Result};
pub use lsn::Lsn;
pub use metrics::Metrics;
pub use pipe::{AckPosition, DocTx, Document};
pub use schema::Database;
pub use search::{Flusher, FlushOptions, SearchClient};
