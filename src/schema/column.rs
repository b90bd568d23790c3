//! Column configuration and per-row decoded state.

use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::protocol::Cell;
use crate::types::{PgValue, TypeRegistry, WireFormat};

/// One column of a published table.
///
/// Besides the tag-driven configuration this carries the column's ordinal
/// within replication tuples (rewritten by every relation message and by
/// the snapshot copy) and the most recently decoded value.
#[derive(Debug)]
pub struct Column {
    /// SQL column name.
    pub name: String,
    /// Field name in the emitted document; defaults to the column name.
    pub field_name: String,
    /// Whether the column is part of the document body.
    pub index: bool,
    /// Declared primary key in the catalog; fallback when no `pk` tag is set.
    pub sql_pk: bool,
    /// Whether the replica identity exposes the old value of this column in
    /// the WAL. Without it, deletes and key-changing updates are unusable.
    pub old_in_wal: bool,
    /// Ordinal in logical-replication tuples or the copy result.
    pub pos: usize,
    /// Type OID, resolved through the registry at decode time.
    pub type_oid: u32,
    /// False when discovery could not resolve the type; values are omitted.
    pub has_decoder: bool,
    /// Decoded value of the current row; `None` means omit (NULL/TOAST).
    pub value: Option<PgValue>,
}

impl Column {
    pub fn new(name: &str, index: bool) -> Self {
        Self {
            name: name.to_string(),
            field_name: name.to_string(),
            index,
            sql_pk: false,
            old_in_wal: false,
            pos: 0,
            type_oid: 0,
            has_decoder: false,
            value: None,
        }
    }

    /// Decodes one replication tuple cell into the value slot.
    pub fn decode_cell(&mut self, registry: &TypeRegistry, cell: &Cell) -> Result<()> {
        match cell {
            Cell::Null | Cell::Toast => {
                self.value = None;
                Ok(())
            }
            Cell::Text(raw) => self.decode_raw(registry, raw, WireFormat::Text),
            Cell::Binary(raw) => self.decode_raw(registry, raw, WireFormat::Binary),
        }
    }

    /// Decodes a raw cell. Decode failures drop the value with a warning
    /// rather than poisoning the whole row.
    pub fn decode_raw(
        &mut self,
        registry: &TypeRegistry,
        raw: &[u8],
        format: WireFormat,
    ) -> Result<()> {
        self.value = None;
        if !self.has_decoder {
            return Ok(());
        }
        match registry.decode(self.type_oid, raw, format) {
            Ok(value) => {
                self.value = Some(value);
                Ok(())
            }
            Err(e) => {
                warn!(column = %self.name, error = %e, "failed to decode column value");
                Ok(())
            }
        }
    }

    /// JSON rendering of the current value, if present.
    pub fn json_value(&self) -> Option<Value> {
        self.value.as_ref().map(PgValue::to_json)
    }

    /// Text rendering used for `_id` and `routing`.
    pub fn string_value(&self) -> String {
        self.value
            .as_ref()
            .map(PgValue::stringify)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn registry() -> TypeRegistry {
        TypeRegistry::with_builtins()
    }

    fn int_column(name: &str) -> Column {
        let mut col = Column::new(name, true);
        col.type_oid = 23;
        col.has_decoder = true;
        col
    }

    #[test]
    fn test_decode_text_cell() {
        let mut col = int_column("id");
        col.decode_cell(&registry(), &Cell::Text(Bytes::from_static(b"42")))
            .unwrap();
        assert_eq!(col.value, Some(PgValue::Int(42)));
        assert_eq!(col.string_value(), "42");
    }

    #[test]
    fn test_decode_binary_cell() {
        let mut col = int_column("id");
        let raw = Bytes::copy_from_slice(&7i32.to_be_bytes());
        col.decode_cell(&registry(), &Cell::Binary(raw)).unwrap();
        assert_eq!(col.value, Some(PgValue::Int(7)));
    }

    #[test]
    fn test_null_and_toast_omit() {
        let mut col = int_column("id");
        col.decode_cell(&registry(), &Cell::Text(Bytes::from_static(b"1")))
            .unwrap();
        assert!(col.value.is_some());

        col.decode_cell(&registry(), &Cell::Null).unwrap();
        assert!(col.value.is_none());

        col.decode_cell(&registry(), &Cell::Text(Bytes::from_static(b"1")))
            .unwrap();
        col.decode_cell(&registry(), &Cell::Toast).unwrap();
        assert!(col.value.is_none());
        assert_eq!(col.string_value(), "");
    }

    #[test]
    fn test_missing_decoder_omits() {
        let mut col = Column::new("mystery", true);
        col.type_oid = 999_999;
        col.decode_cell(&registry(), &Cell::Text(Bytes::from_static(b"x")))
            .unwrap();
        assert!(col.value.is_none());
    }
}
