//! Initial data load: binary copy of every indexable table, inside the
//! transaction that created the replication slot, so the snapshot and the
//! stream start position line up exactly.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::document::Action;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::pgcopy;
use crate::pipe::Document;
use crate::protocol::ReplicationClient;
use crate::schema::{Database, TableId};

impl Database {
    /// Copies every indexable table, inline sources before their parents.
    /// Must run inside the slot-creation transaction.
    pub async fn reindex(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut conn = self.take_repl()?;
        let mut res = Ok(());
        for tid in self.indexable_tables() {
            res = self.copy_table(&mut conn, tid, cancel).await;
            if res.is_err() {
                break;
            }
        }
        self.repl = Some(conn);
        res
    }

    async fn copy_table(
        &mut self,
        conn: &mut ReplicationClient,
        tid: TableId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.init_table(tid)?;
        let table_name = self.tables[tid].name.clone();
        let query = self.tables[tid].copy_query();
        info!(table = %table_name, sql = %query, "copying snapshot");

        let mut copy = conn.copy_out(&query).await?;
        let mut parser = pgcopy::Parser::new();
        let mut rows_copied = 0u64;

        while let Some(chunk) = copy.next().await? {
            if cancel.is_cancelled() {
                return Err(Error::invalid_state("reindex interrupted by shutdown"));
            }
            for row in parser.feed(&chunk)? {
                rows_copied += 1;
                self.metrics.inc_copy_rows(&table_name);
                self.tables[tid].decode_row(&self.registry, &row)?;

                // snapshot documents carry the zero position: nothing is
                // acknowledged upstream until streaming starts
                let mut docs = Vec::new();
                if self.tables[tid].index {
                    docs.push(Document {
                        position: Lsn::ZERO,
                        meta: self.tables[tid].bulk_header(Action::Index)?,
                        data: Some(self.tables[tid].doc_body()?),
                    });
                }
                for iid in self.tables[tid].inlined_in.clone() {
                    let inline = &self.inlines[iid];
                    let source = &self.tables[tid];
                    let parent_tid = inline.parent.ok_or_else(|| {
                        Error::config(format!("inline {} has no parent table", inline.name))
                    })?;
                    let parent = &self.tables[parent_tid];
                    docs.push(Document {
                        position: Lsn::ZERO,
                        meta: inline.bulk_header(source, parent)?,
                        data: Some(inline.add_script(source, parent)?),
                    });
                }
                for doc in docs {
                    self.stream.doc(doc).await?;
                }
            }
        }
        parser.finish()?;
        info!(table = %table_name, rows = rows_copied, "snapshot copied");
        Ok(())
    }
}
