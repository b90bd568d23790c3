//! Downstream side: the search-engine HTTP client and the bulk flusher.

mod bulk;
mod client;
mod response;

pub use bulk::{FlushOptions, Flusher};
pub use client::{install_scripts, SearchClient};
pub use response::{BulkResponse, ItemError, TOLERATED_ERROR};
