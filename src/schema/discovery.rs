//! Catalog discovery: one query over the publication membership surfaces
//! every published table and column together with its comments (the tag
//! configuration), type OID, primary-key membership and whether the
//! replica identity exposes the old row image for it.

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::Database;

/// Publication membership joined with comments, pk and replica identity.
///
/// `old_in_wal` is derived from `pg_class.relreplident`: FULL exposes every
/// column, DEFAULT exposes primary-key columns, and USING INDEX exposes the
/// members of the replica-identity index. NOTHING exposes none.
const DISCOVER_QUERY: &str = r#"
SELECT n.nspname::text                      AS schema_name,
       c.relname::text                      AS table_name,
       a.attname::text                      AS column_name,
       obj_description(c.oid, 'pg_class')   AS table_comment,
       col_description(c.oid, a.attnum)     AS column_comment,
       COALESCE(pk.indisprimary, false)     AS is_pk,
       a.atttypid::oid                      AS type_oid,
       (c.relreplident = 'f'
        OR (c.relreplident = 'd' AND COALESCE(pk.indisprimary, false))
        OR (c.relreplident = 'i' AND COALESCE(ri.is_member, false))
       )                                    AS old_in_wal
FROM pg_publication p
JOIN pg_publication_tables pt ON pt.pubname = p.pubname
JOIN pg_namespace n ON n.nspname = pt.schemaname
JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = pt.tablename
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
LEFT JOIN LATERAL (
    SELECT i.indisprimary
    FROM pg_index i
    WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY (i.indkey)
) pk ON true
LEFT JOIN LATERAL (
    SELECT true AS is_member
    FROM pg_index i
    WHERE i.indrelid = c.oid AND i.indisreplident AND a.attnum = ANY (i.indkey)
) ri ON true
WHERE p.pubname = $1
ORDER BY n.nspname, c.relname, a.attnum
"#;

impl Database {
    /// Populates the schema tree from the publication and the comment tags.
    ///
    /// Only tables exposed via the publication are considered. Table
    /// comments are applied before column comments because column defaults
    /// (`index_all`) are inherited from the table.
    pub async fn discover(&mut self) -> Result<()> {
        let query = self
            .query
            .clone()
            .ok_or_else(|| Error::invalid_state("query connection not established"))?;

        let rows = {
            let client = query.lock().await;
            client.query(DISCOVER_QUERY, &[&self.publication]).await?
        };
        if rows.is_empty() {
            return Err(Error::config(format!(
                "publication {:?} has no published tables",
                self.publication
            )));
        }
        debug!(rows = rows.len(), publication = %self.publication, "discovered published columns");

        for row in rows {
            let schema: String = row.get(0);
            let table: String = row.get(1);
            let column: String = row.get(2);
            let table_comment: Option<String> = row.get(3);
            let column_comment: Option<String> = row.get(4);
            let is_pk: bool = row.get(5);
            let type_oid: u32 = row.get(6);
            let old_in_wal: bool = row.get(7);

            let tid = self.table_entry(&schema, &table);
            self.apply_table_tags(tid, table_comment.as_deref())?;

            let cid = self.tables[tid].column_entry(&column);
            self.apply_column_tags(tid, cid, column_comment.as_deref())?;
            {
                let col = &mut self.tables[tid].columns[cid];
                col.sql_pk = is_pk;
                col.old_in_wal = old_in_wal;
                col.type_oid = type_oid;
            }

            match self.data_type(type_oid).await {
                Ok(()) => self.tables[tid].columns[cid].has_decoder = true,
                Err(e) => {
                    warn!(
                        table = %table,
                        column = %column,
                        oid = type_oid,
                        error = %e,
                        "can not find data type for column"
                    );
                }
            }
        }

        // finalize every table now that all tags are applied
        for tid in 0..self.tables.len() {
            self.init_table(tid)?;
        }
        Ok(())
    }
}
