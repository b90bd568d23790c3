//! Inline definitions: one-to-many child rows embedded as an array field
//! on the parent document via scripted upserts.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::table::Table;
use super::TableId;
use crate::document::{self, Action};
use crate::error::{Error, Result};
use crate::protocol::Tuple;

/// Default stored-script ids, installed at startup.
pub const SCRIPT_ADD: &str = "inline_add";
pub const SCRIPT_DEL: &str = "inline_del";

#[derive(Debug)]
pub struct Inline {
    pub name: String,
    /// Array field on the parent document.
    pub field_name: String,
    /// Table whose documents receive the array; declared by a table-level
    /// `inline` tag.
    pub parent: Option<TableId>,
    /// Table whose rows feed the array; declared by column-level `inline`
    /// tags.
    pub source: Option<TableId>,

    /// Document field name -> column index on the source table.
    pub columns: Vec<(String, usize)>,

    /// Key of the inlined row within the array; source pk by default.
    pub pk_col: Option<usize>,
    /// Source column holding the parent document's pk.
    pub parent_col: Option<usize>,
    /// Optional routing column for the parent document.
    pub routing_col: Option<usize>,

    /// Without old pk/parent/routing in the WAL, removals are impossible.
    pub upsert_only: bool,

    pub script_add: String,
    pub script_del: String,
}

impl Inline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_name: name.to_string(),
            parent: None,
            source: None,
            columns: Vec::new(),
            pk_col: None,
            parent_col: None,
            routing_col: None,
            upsert_only: false,
            script_add: SCRIPT_ADD.to_string(),
            script_del: SCRIPT_DEL.to_string(),
        }
    }

    /// Adds or renames a member column.
    pub fn bind_column(&mut self, field: &str, cid: usize) {
        if let Some(entry) = self.columns.iter_mut().find(|(_, c)| *c == cid) {
            entry.0 = field.to_string();
        } else {
            self.columns.push((field.to_string(), cid));
        }
    }

    /// Whether any of the inline keys differ between the row images; the
    /// parent document's array entry must then be removed and re-added.
    pub fn keys_changed(&self, old: Option<&Tuple>, new: &Tuple, source: &Table) -> bool {
        let old = match old {
            Some(old) => old,
            None => return false,
        };
        for cid in [self.parent_col, self.pk_col, self.routing_col]
            .into_iter()
            .flatten()
        {
            let pos = source.columns[cid].pos;
            if old.cell_bytes(pos) != new.cell_bytes(pos) {
                return true;
            }
        }
        false
    }

    fn pk_name<'a>(&self, source: &'a Table) -> Result<&'a str> {
        let cid = self
            .pk_col
            .ok_or_else(|| Error::config(format!("inline {} has no pk column", self.name)))?;
        Ok(&source.columns[cid].name)
    }

    /// The parent document's `_id`, derived from the source row's parent
    /// column and the parent table's prefixing rule.
    fn parent_doc_id(&self, source: &Table, parent: &Table) -> Result<String> {
        let cid = self
            .parent_col
            .ok_or_else(|| Error::config(format!("inline {} has no parent column", self.name)))?;
        let raw = source.columns[cid].string_value();
        if parent.pk_no_prefix {
            Ok(raw)
        } else {
            Ok(format!("{}_{}", parent.name, raw))
        }
    }

    /// Bulk header targeting the parent document; always an update.
    pub fn bulk_header(&self, source: &Table, parent: &Table) -> Result<Bytes> {
        let routing = self
            .routing_col
            .map(|cid| source.columns[cid].string_value())
            .filter(|routing| !routing.is_empty());
        document::bulk_header(
            Action::Update,
            &parent.index_name,
            &self.parent_doc_id(source, parent)?,
            routing.as_deref(),
        )
    }

    /// Member columns of the current source row as a JSON object.
    fn row_object(&self, source: &Table) -> Map<String, Value> {
        let mut obj = Map::new();
        for (field, cid) in &self.columns {
            if let Some(value) = source.columns[*cid].json_value() {
                obj.insert(field.clone(), value);
            }
        }
        obj
    }

    /// Scripted-upsert body adding the current source row to the parent.
    pub fn add_script(&self, source: &Table, parent: &Table) -> Result<Bytes> {
        let parent_pk = parent.pk_col.ok_or_else(|| {
            Error::config(format!(
                "inline {}: parent table {} has no primary key",
                self.name, parent.name
            ))
        })?;
        let parent_col = self
            .parent_col
            .ok_or_else(|| Error::config(format!("inline {} has no parent column", self.name)))?;
        document::inline_add_body(
            &self.script_add,
            self.row_object(source),
            self.pk_name(source)?,
            &self.field_name,
            &parent.name,
            &parent.columns[parent_pk].name,
            source.columns[parent_col]
                .json_value()
                .unwrap_or(Value::Null),
        )
    }

    /// Script body removing the current source row from the parent.
    pub fn del_script(&self, source: &Table) -> Result<Bytes> {
        document::inline_del_body(
            &self.script_del,
            self.row_object(source),
            self.pk_name(source)?,
            &self.field_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cell;
    use crate::types::TypeRegistry;

    fn tuple(cells: &[Option<&[u8]>]) -> Tuple {
        Tuple(
            cells
                .iter()
                .map(|c| match c {
                    None => Cell::Null,
                    Some(data) => Cell::Text(Bytes::copy_from_slice(data)),
                })
                .collect(),
        )
    }

    /// Child table `c(id, pid)` with both columns decodable.
    fn source_table() -> Table {
        let mut t = Table::new("public", "c");
        for (i, name) in ["id", "pid"].iter().enumerate() {
            let cid = t.column_entry(name);
            t.columns[cid].pos = i;
            t.columns[cid].type_oid = 23;
            t.columns[cid].has_decoder = true;
        }
        t.active_cols = vec![0, 1];
        t
    }

    fn parent_table() -> Table {
        let mut t = Table::new("public", "p");
        let cid = t.column_entry("id");
        t.columns[cid].pos = 0;
        t.columns[cid].type_oid = 23;
        t.columns[cid].has_decoder = true;
        t.pk_col = Some(0);
        t.index_name = "postgres".to_string();
        t
    }

    fn items_inline() -> Inline {
        let mut inl = Inline::new("items");
        inl.field_name = "items_field".to_string();
        inl.pk_col = Some(0);
        inl.parent_col = Some(1);
        inl.bind_column("id", 0);
        inl.bind_column("pid", 1);
        inl
    }

    #[test]
    fn test_keys_changed_on_parent_move() {
        let source = source_table();
        let inl = items_inline();
        let old = tuple(&[Some(b"5"), Some(b"1")]);
        let same = tuple(&[Some(b"5"), Some(b"1")]);
        let moved = tuple(&[Some(b"5"), Some(b"2")]);
        assert!(!inl.keys_changed(Some(&old), &same, &source));
        assert!(inl.keys_changed(Some(&old), &moved, &source));
        assert!(!inl.keys_changed(None, &moved, &source));
    }

    #[test]
    fn test_add_script_shape() {
        let registry = TypeRegistry::with_builtins();
        let mut source = source_table();
        source
            .decode_tuple(&registry, &tuple(&[Some(b"5"), Some(b"1")]))
            .unwrap();
        let parent = parent_table();
        let inl = items_inline();

        let header = inl.bulk_header(&source, &parent).unwrap();
        assert_eq!(
            &header[..],
            br#"{"update":{"_index":"postgres","_id":"p_1"}}"#
        );

        let body: serde_json::Value =
            serde_json::from_slice(&inl.add_script(&source, &parent).unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "scripted_upsert": true,
                "script": {
                    "id": "inline_add",
                    "params": {"obj": {"id": 5, "pid": 1}, "pk": "id", "inline": "items_field"}
                },
                "upsert": {"docType": "p", "id": 1}
            })
        );
    }

    #[test]
    fn test_del_script_shape() {
        let registry = TypeRegistry::with_builtins();
        let mut source = source_table();
        source
            .decode_tuple(&registry, &tuple(&[Some(b"5"), Some(b"1")]))
            .unwrap();
        let inl = items_inline();

        let body: serde_json::Value =
            serde_json::from_slice(&inl.del_script(&source).unwrap()).unwrap();
        assert_eq!(body["scripted_upsert"], serde_json::json!(false));
        assert_eq!(body["script"]["id"], serde_json::json!("inline_del"));
        assert!(body.get("upsert").is_none());
    }
}
