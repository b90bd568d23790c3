//! Table configuration, decoded-row state and document rendering.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::debug;

use super::column::Column;
use super::join::TableJoin;
use super::InlineId;
use crate::document::{self, Action};
use crate::error::{Error, Result};
use crate::pgcopy::Row;
use crate::protocol::Tuple;
use crate::types::{TypeRegistry, WireFormat};

#[derive(Debug)]
pub struct Table {
    /// Owning schema name.
    pub schema: String,
    pub name: String,
    /// Relation OID used by the logical replication protocol.
    pub relation_id: u32,

    /// Document type label, defaults to the table name.
    pub doc_type: String,
    /// Whether rows of this table become documents. Publication membership
    /// makes this the default; `index:"-"` opts out.
    pub index: bool,
    /// Default include flag for columns without an `index` tag.
    pub index_all: bool,
    /// Without old PKs / routing in the WAL, proper update & delete is
    /// impossible; only upserts are emitted.
    pub upsert_only: bool,
    pub(crate) tag_parsed: bool,

    pub columns: Vec<Column>,
    by_name: HashMap<String, usize>,

    /// Primary-key column; used for `_id` and in inline scripting.
    pub pk_col: Option<usize>,
    /// Use the raw pk value as `_id` instead of `{table}_{pk}`.
    pub pk_no_prefix: bool,
    /// Column feeding `routing`.
    pub routing_col: Option<usize>,

    pub join: TableJoin,

    /// Target index; cached by `init`.
    pub index_name: String,

    /// Inlines this table is the parent of.
    pub inlines: Vec<InlineId>,
    /// Inlines this table feeds as the source; their parents' documents
    /// must be updated on every row event here.
    pub inlined_in: Vec<InlineId>,

    /// Columns to decode per row: indexed ones plus inline participants.
    /// Computed by `Database::init_table`.
    pub(crate) active_cols: Vec<usize>,
}

impl Table {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            relation_id: 0,
            doc_type: name.to_string(),
            // index by default; the table is already listed in the publication
            index: true,
            index_all: false,
            upsert_only: false,
            tag_parsed: false,
            columns: Vec::new(),
            by_name: HashMap::new(),
            pk_col: None,
            pk_no_prefix: false,
            routing_col: None,
            join: TableJoin::default(),
            index_name: String::new(),
            inlines: Vec::new(),
            inlined_in: Vec::new(),
            active_cols: Vec::new(),
        }
    }

    /// Gets or creates the column config, inheriting the table's
    /// `index_all` default.
    pub fn column_entry(&mut self, name: &str) -> usize {
        if let Some(&cid) = self.by_name.get(name) {
            return cid;
        }
        let cid = self.columns.len();
        self.columns.push(Column::new(name, self.index_all));
        self.by_name.insert(name.to_string(), cid);
        cid
    }

    pub fn column_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Whether the document identity (`_id` or routing) differs between the
    /// two row images, forcing a delete + re-index instead of an update.
    pub fn keys_changed(&self, old: Option<&Tuple>, new: &Tuple) -> bool {
        let old = match old {
            Some(old) => old,
            None => return false,
        };
        let pk = match self.pk_col {
            Some(cid) => self.columns[cid].pos,
            None => return false,
        };
        if old.cell_bytes(pk) != new.cell_bytes(pk) {
            return true;
        }
        if let Some(cid) = self.routing_col {
            let pos = self.columns[cid].pos;
            if old.cell_bytes(pos) != new.cell_bytes(pos) {
                return true;
            }
        }
        false
    }

    /// Decodes a replication tuple into the active columns.
    pub fn decode_tuple(&mut self, registry: &TypeRegistry, tuple: &Tuple) -> Result<()> {
        let mut omitted = false;
        for i in 0..self.active_cols.len() {
            let cid = self.active_cols[i];
            let pos = self.columns[cid].pos;
            let cell = tuple
                .0
                .get(pos)
                .ok_or_else(|| Error::ColumnOutOfRange(self.columns[cid].name.clone()))?;
            self.columns[cid].decode_cell(registry, cell)?;
            omitted |= self.columns[cid].value.is_none();
        }
        if omitted {
            debug!(table = %self.name, "some columns are empty and omitted from the document");
        }
        Ok(())
    }

    /// Decodes a binary copy row; cells follow the copy column order set by
    /// `copy_query`.
    pub fn decode_row(&mut self, registry: &TypeRegistry, row: &Row) -> Result<()> {
        for i in 0..self.active_cols.len() {
            let cid = self.active_cols[i];
            let pos = self.columns[cid].pos;
            let cell = row
                .get(pos)
                .ok_or_else(|| Error::ColumnOutOfRange(self.columns[cid].name.clone()))?;
            match cell {
                None => self.columns[cid].value = None,
                Some(raw) => {
                    self.columns[cid].decode_raw(registry, raw, WireFormat::Binary)?;
                }
            }
        }
        Ok(())
    }

    /// The document `_id`: stringified pk, prefixed with the table name
    /// unless the pk column is tagged as an identity.
    pub fn doc_id(&self) -> Result<String> {
        let pk = self
            .pk_col
            .ok_or_else(|| Error::config(format!("table {} has no primary key", self.name)))?;
        let raw = self.columns[pk].string_value();
        if self.pk_no_prefix {
            Ok(raw)
        } else {
            Ok(format!("{}_{}", self.name, raw))
        }
    }

    fn routing(&self) -> Option<String> {
        self.routing_col
            .map(|cid| self.columns[cid].string_value())
            .filter(|routing| !routing.is_empty())
    }

    /// Bulk header for this table's current row.
    pub fn bulk_header(&self, action: Action) -> Result<Bytes> {
        let routing = self.routing();
        document::bulk_header(action, &self.index_name, &self.doc_id()?, routing.as_deref())
    }

    /// Document fields: configured columns in discovery order, the join
    /// object when enabled, and the trailing docType.
    fn doc_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        for col in &self.columns {
            if !col.index {
                continue;
            }
            if let Some(value) = col.json_value() {
                fields.insert(col.field_name.clone(), value);
            }
        }
        if self.join.enabled {
            fields.insert(self.join.field_name.clone(), self.join.json_value(self));
        }
        fields.insert("docType".to_string(), Value::String(self.doc_type.clone()));
        fields
    }

    /// Full document body for index operations.
    pub fn doc_body(&self) -> Result<Bytes> {
        document::doc_body(self.doc_fields())
    }

    /// `{"doc": ...}` partial body for update operations.
    pub fn update_doc_body(&self) -> Result<Bytes> {
        document::update_body(self.doc_fields())
    }

    /// Builds the initial data load query, e.g.
    /// `COPY "public"."users" ("id","name") TO STDOUT WITH BINARY;` and
    /// rewrites the active columns' ordinals to the copy column order.
    /// Relation messages overwrite them again once streaming starts.
    pub fn copy_query(&mut self) -> String {
        let mut q = String::from("COPY ");
        q.push('"');
        q.push_str(&self.schema.replace('"', "\"\""));
        q.push_str("\".\"");
        q.push_str(&self.name.replace('"', "\"\""));
        q.push_str("\" (");

        for (i, &cid) in self.active_cols.iter().enumerate() {
            if i != 0 {
                q.push(',');
            }
            self.columns[cid].pos = i;
            q.push('"');
            q.push_str(&self.columns[cid].name.replace('"', "\"\""));
            q.push('"');
        }
        q.push_str(") TO STDOUT WITH BINARY;");
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cell;

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

    /// Table `t(id pk, r routing, name)` with decoders attached.
    fn test_table() -> Table {
        let mut t = Table::new("public", "t");
        t.index_all = true;
        for (i, name) in ["id", "r", "name"].iter().enumerate() {
            let cid = t.column_entry(name);
            t.columns[cid].pos = i;
            t.columns[cid].type_oid = if *name == "id" { 23 } else { 25 };
            t.columns[cid].has_decoder = true;
        }
        t.pk_col = Some(0);
        t.routing_col = Some(1);
        t.index_name = "postgres".to_string();
        t.active_cols = vec![0, 1, 2];
        t
    }

    #[test]
    fn test_keys_changed() {
        let t = test_table();
        let old = tuple(&[Some(b"1"), Some(b"a"), Some(b"x")]);
        let same = tuple(&[Some(b"1"), Some(b"a"), Some(b"y")]);
        let new_pk = tuple(&[Some(b"2"), Some(b"a"), Some(b"x")]);
        let new_routing = tuple(&[Some(b"1"), Some(b"b"), Some(b"x")]);

        assert!(!t.keys_changed(Some(&old), &same));
        assert!(t.keys_changed(Some(&old), &new_pk));
        assert!(t.keys_changed(Some(&old), &new_routing));
        // absent old image means "no key change"
        assert!(!t.keys_changed(None, &new_pk));
    }

    #[test]
    fn test_doc_id_prefixing() {
        let registry = TypeRegistry::with_builtins();
        let mut t = test_table();
        t.decode_tuple(&registry, &tuple(&[Some(b"42"), Some(b"a"), Some(b"foo")]))
            .unwrap();
        assert_eq!(t.doc_id().unwrap(), "t_42");

        t.pk_no_prefix = true;
        assert_eq!(t.doc_id().unwrap(), "42");
    }

    #[test]
    fn test_doc_body_order_and_omission() {
        let registry = TypeRegistry::with_builtins();
        let mut t = test_table();
        t.decode_tuple(&registry, &tuple(&[Some(b"42"), Some(b"a"), None]))
            .unwrap();
        let body = t.doc_body().unwrap();
        // name is NULL and therefore omitted; docType closes the object
        assert_eq!(&body[..], br#"{"id":42,"r":"a","docType":"t"}"#);
    }

    #[test]
    fn test_bulk_header_with_routing() {
        let registry = TypeRegistry::with_builtins();
        let mut t = test_table();
        t.decode_tuple(&registry, &tuple(&[Some(b"42"), Some(b"a"), Some(b"x")]))
            .unwrap();
        let header = t.bulk_header(Action::Delete).unwrap();
        assert_eq!(
            &header[..],
            br#"{"delete":{"_index":"postgres","_id":"t_42","routing":"a"}}"#
        );
    }

    #[test]
    fn test_copy_query_quoting_and_positions() {
        let mut t = test_table();
        // scramble positions; copy_query must rewrite them
        t.columns[0].pos = 9;
        t.columns[2].pos = 7;
        let q = t.copy_query();
        assert_eq!(
            q,
            r#"COPY "public"."t" ("id","r","name") TO STDOUT WITH BINARY;"#
        );
        assert_eq!(t.columns[0].pos, 0);
        assert_eq!(t.columns[1].pos, 1);
        assert_eq!(t.columns[2].pos, 2);
    }

    #[test]
    fn test_out_of_range_tuple() {
        let registry = TypeRegistry::with_builtins();
        let mut t = test_table();
        let err = t
            .decode_tuple(&registry, &tuple(&[Some(b"42")]))
            .unwrap_err();
        assert!(matches!(err, Error::ColumnOutOfRange(_)));
    }
}
