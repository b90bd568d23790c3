//! Parent/child join field configuration.
//!
//! Rendered as a `{"name": ..., "parent": ...}` object on each document,
//! the shape the search engine's join field type expects.

use serde_json::Value;

use super::table::Table;

#[derive(Debug, Default)]
pub struct TableJoin {
    pub enabled: bool,
    /// Document field the join object is stored at.
    pub field_name: String,
    /// Fixed relation name; used when no name column is bound.
    pub type_name: String,
    /// Column supplying a dynamic relation name.
    pub name_col: Option<usize>,
    /// Column supplying the parent document id; set on child tables.
    pub parent_col: Option<usize>,
}

impl TableJoin {
    /// Builds the join object from the table's decoded row.
    pub fn json_value(&self, table: &Table) -> Value {
        let mut map = serde_json::Map::new();
        let name = match self.name_col {
            Some(cid) => table.columns[cid].string_value(),
            None => self.type_name.clone(),
        };
        map.insert("name".to_string(), Value::String(name));
        if let Some(cid) = self.parent_col {
            let parent = table.columns[cid].string_value();
            if !parent.is_empty() {
                map.insert("parent".to_string(), Value::String(parent));
            }
        }
        Value::Object(map)
    }
}
