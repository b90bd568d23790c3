//! Bulk operation assembly: header lines and body lines, as raw bytes
//! ready for the NDJSON buffer.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::Result;

/// Bulk action verb.
///
/// The bulk grammar knows `index`, `update` and `delete`; a key-changing
/// update re-creates the document through a fresh `index` after its delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Index,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Index => "index",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// `{"<action>":{"_index":...,"_id":...,"routing":...}}`
pub fn bulk_header(
    action: Action,
    index: &str,
    id: &str,
    routing: Option<&str>,
) -> Result<Bytes> {
    let mut meta = Map::new();
    meta.insert("_index".to_string(), Value::String(index.to_string()));
    meta.insert("_id".to_string(), Value::String(id.to_string()));
    if let Some(routing) = routing {
        meta.insert("routing".to_string(), Value::String(routing.to_string()));
    }
    let mut header = Map::new();
    header.insert(action.as_str().to_string(), Value::Object(meta));
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(header))?))
}

/// Full document body.
pub fn doc_body(fields: Map<String, Value>) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(fields))?))
}

/// Partial update body: `{"doc": {...}}`, the shape bulk updates require.
pub fn update_body(fields: Map<String, Value>) -> Result<Bytes> {
    let mut wrapper = Map::new();
    wrapper.insert("doc".to_string(), Value::Object(fields));
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(wrapper))?))
}

/// Scripted-upsert body adding an inlined row to its parent document.
///
/// The upsert document seeds a parent that does not exist yet with its
/// docType and primary key, so out-of-order child inserts still land.
#[allow(clippy::too_many_arguments)]
pub fn inline_add_body(
    script_id: &str,
    obj: Map<String, Value>,
    pk_name: &str,
    inline_field: &str,
    parent_doc_type: &str,
    parent_pk_name: &str,
    parent_pk_value: Value,
) -> Result<Bytes> {
    let mut params = Map::new();
    params.insert("obj".to_string(), Value::Object(obj));
    params.insert("pk".to_string(), Value::String(pk_name.to_string()));
    params.insert(
        "inline".to_string(),
        Value::String(inline_field.to_string()),
    );

    let mut script = Map::new();
    script.insert("id".to_string(), Value::String(script_id.to_string()));
    script.insert("params".to_string(), Value::Object(params));

    let mut upsert = Map::new();
    upsert.insert(
        "docType".to_string(),
        Value::String(parent_doc_type.to_string()),
    );
    upsert.insert(parent_pk_name.to_string(), parent_pk_value);

    let mut body = Map::new();
    body.insert("scripted_upsert".to_string(), Value::Bool(true));
    body.insert("script".to_string(), Value::Object(script));
    body.insert("upsert".to_string(), Value::Object(upsert));
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
}

/// Script body removing an inlined row from its parent document. No upsert
/// seed: a missing parent means there is nothing to remove from.
pub fn inline_del_body(
    script_id: &str,
    obj: Map<String, Value>,
    pk_name: &str,
    inline_field: &str,
) -> Result<Bytes> {
    let mut params = Map::new();
    params.insert("obj".to_string(), Value::Object(obj));
    params.insert("pk".to_string(), Value::String(pk_name.to_string()));
    params.insert(
        "inline".to_string(),
        Value::String(inline_field.to_string()),
    );

    let mut script = Map::new();
    script.insert("id".to_string(), Value::String(script_id.to_string()));
    script.insert("params".to_string(), Value::Object(params));

    let mut body = Map::new();
    body.insert("script".to_string(), Value::Object(script));
    body.insert("scripted_upsert".to_string(), Value::Bool(false));
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bulk_header_shape() {
        let header = bulk_header(Action::Index, "postgres", "t_42", None).unwrap();
        assert_eq!(&header[..], br#"{"index":{"_index":"postgres","_id":"t_42"}}"#);

        let header = bulk_header(Action::Delete, "postgres", "t_42", Some("a")).unwrap();
        assert_eq!(
            &header[..],
            br#"{"delete":{"_index":"postgres","_id":"t_42","routing":"a"}}"#
        );
    }

    #[test]
    fn test_update_body_wraps_doc() {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("foo"));
        let body = update_body(fields).unwrap();
        assert_eq!(&body[..], br#"{"doc":{"name":"foo"}}"#);
    }

    #[test]
    fn test_inline_add_body_shape() {
        let mut obj = Map::new();
        obj.insert("id".to_string(), json!(5));
        obj.insert("pid".to_string(), json!(1));
        let body =
            inline_add_body("inline_add", obj, "id", "items_field", "p", "id", json!(1)).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({
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
    fn test_inline_del_body_shape() {
        let mut obj = Map::new();
        obj.insert("id".to_string(), json!(5));
        let body = inline_del_body("inline_del", obj, "id", "items").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({
                "script": {
                    "id": "inline_del",
                    "params": {"obj": {"id": 5}, "pk": "id", "inline": "items"}
                },
                "scripted_upsert": false
            })
        );
    }
}
