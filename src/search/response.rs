//! Model of the filtered bulk response.
//!
//! Requests use `filter_path=items.*.error,errors`, so a fully successful
//! bulk comes back as `{}` and failures carry only the error objects.

use serde::Deserialize;

/// Item errors the bridge tolerates: updating a document that was already
/// deleted downstream.
pub const TOLERATED_ERROR: &str = "document_missing_exception";

#[derive(Debug, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<std::collections::HashMap<String, ItemResult>>,
}

#[derive(Debug, Deserialize)]
pub struct ItemResult {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub error: Option<ItemError>,
}

#[derive(Debug, Deserialize)]
pub struct ItemError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkResponse {
    /// Item-level errors, flattened out of the per-action wrappers.
    pub fn item_errors(&self) -> impl Iterator<Item = (Option<&str>, &ItemError)> {
        self.items.iter().flat_map(|item| {
            item.values()
                .filter_map(|res| res.error.as_ref().map(|err| (res.id.as_deref(), err)))
        })
    }
}
