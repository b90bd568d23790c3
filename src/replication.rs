//! The streaming phase: drive the replication connection, dispatch logical
//! messages into documents, and keep the upstream informed of the
//! acknowledged position.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::Action;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::pipe::Document;
use crate::protocol::{
    decode_logical, LogicalMessage, ReplicationClient, StreamMessage,
};
use crate::schema::Database;

impl Database {
    /// Drops the replication slot. Failures are logged, not fatal: the most
    /// common cause is the slot not existing yet.
    pub async fn drop_slot(&mut self) -> Result<()> {
        let mut conn = self.take_repl()?;
        match conn.drop_replication_slot(&self.slot).await {
            Ok(()) => info!(slot = %self.slot, "dropped replication slot"),
            Err(e) => warn!(slot = %self.slot, error = %e, "failed to drop replication slot"),
        }
        self.repl = Some(conn);
        Ok(())
    }

    /// Creates the replication slot inside the current transaction, making
    /// the creation snapshot available to the following copy. Failures are
    /// logged (the slot may already exist); a genuinely missing slot fails
    /// `START_REPLICATION` later.
    pub async fn create_slot(&mut self) -> Result<()> {
        let mut conn = self.take_repl()?;
        match conn.create_replication_slot(&self.slot).await {
            Ok(()) => info!(slot = %self.slot, "created replication slot"),
            Err(e) => warn!(slot = %self.slot, error = %e, "failed to create replication slot"),
        }
        self.repl = Some(conn);
        Ok(())
    }

    /// Opens the `REPEATABLE READ` transaction slot creation and the
    /// snapshot copy must share.
    pub async fn tx_begin(&mut self) -> Result<()> {
        let mut conn = self.take_repl()?;
        let res = conn.begin_snapshot_tx().await;
        self.repl = Some(conn);
        res
    }

    /// Ends the snapshot transaction; streaming can not start inside one.
    pub async fn tx_commit(&mut self) -> Result<()> {
        let mut conn = self.take_repl()?;
        let res = conn.commit_tx().await;
        self.repl = Some(conn);
        res
    }

    pub(crate) fn take_repl(&mut self) -> Result<ReplicationClient> {
        self.repl
            .take()
            .ok_or_else(|| Error::invalid_state("replication connection not established"))
    }

    /// Switches the replication connection into streaming mode and runs the
    /// receive loop until cancellation or a fatal error. Zero `at` resumes
    /// from the slot's confirmed position.
    pub async fn start_replication(&mut self, at: Lsn, cancel: &CancellationToken) -> Result<()> {
        let mut conn = self.take_repl()?;
        let res = self.stream_loop(&mut conn, at, cancel).await;
        self.repl = Some(conn);
        res
    }

    async fn stream_loop(
        &mut self,
        conn: &mut ReplicationClient,
        at: Lsn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        conn.start_replication(&self.slot, at, &self.publication, self.use_binary)
            .await?;
        info!(slot = %self.slot, publication = %self.publication, "started streaming replication");

        let mut deadline = Instant::now() + self.standby_timeout;
        let mut prev_commit = self.ack.get();

        loop {
            if Instant::now() >= deadline {
                let commit = self.ack.get();
                conn.standby_status(commit).await?;
                if commit > prev_commit {
                    prev_commit = commit;
                    debug!(lsn = %commit, "committed position upstream");
                }
                deadline = Instant::now() + self.standby_timeout;
            }

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // report the final position before going away
                    let commit = self.ack.get();
                    if let Err(e) = conn.standby_status(commit).await {
                        warn!(error = %e, "failed to send final standby status");
                    }
                    info!(lsn = %commit, "shutdown: streaming stopped");
                    return Ok(());
                }
                received = conn.recv_stream(deadline) => received?,
            };

            match received {
                // deadline fired; the top of the loop sends the update
                None => continue,
                Some(StreamMessage::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                }) => {
                    if reply_requested {
                        deadline = Instant::now();
                    }
                    // propagate the server position even when no rows flow,
                    // so acknowledgments do not fall behind
                    self.stream.mark(wal_end).await?;
                }
                Some(StreamMessage::XLogData {
                    wal_start, data, ..
                }) => {
                    let msg = decode_logical(data)?;
                    self.handle_logical(wal_start, msg).await?;
                }
                Some(StreamMessage::Closed) => {
                    return Err(Error::protocol("server closed the replication stream"));
                }
            }
        }
    }

    /// Dispatches one decoded logical message.
    ///
    /// Unknown message kinds never reach this point (the decoder treats
    /// them as fatal, the stream can not be advanced past unknown
    /// semantics); truncate is known but unsupported and skipped.
    pub async fn handle_logical(&mut self, pos: Lsn, msg: LogicalMessage) -> Result<()> {
        match msg {
            // transaction boundaries are not preserved downstream
            LogicalMessage::Begin(_) | LogicalMessage::Commit(_) => Ok(()),
            LogicalMessage::Origin(_) => Ok(()),

            LogicalMessage::Relation(rel) => {
                let tid = self.table_entry(&rel.namespace, &rel.name);
                self.tables[tid].relation_id = rel.id;
                self.relations.insert(rel.id, tid);
                self.metrics.inc_streamed("metadata", &rel.name);

                for (pos, relcol) in rel.columns.iter().enumerate() {
                    let cid = self.tables[tid].column_entry(&relcol.name);
                    {
                        let col = &mut self.tables[tid].columns[cid];
                        col.pos = pos;
                        col.type_oid = relcol.type_oid;
                    }
                    match self.data_type(relcol.type_oid).await {
                        Ok(()) => self.tables[tid].columns[cid].has_decoder = true,
                        Err(e) => {
                            self.tables[tid].columns[cid].has_decoder = false;
                            warn!(
                                table = %rel.name,
                                column = %relcol.name,
                                oid = relcol.type_oid,
                                error = %e,
                                "can not resolve column type"
                            );
                        }
                    }
                }
                self.init_table(tid)
            }

            LogicalMessage::Type(typ) => {
                if let Err(e) = self.data_type(typ.oid).await {
                    warn!(oid = typ.oid, name = %typ.name, error = %e, "type discovery failed");
                }
                Ok(())
            }

            LogicalMessage::Insert(ins) => {
                let tid = self.expect_relation(ins.relation_id)?;
                self.metrics
                    .inc_streamed("insert", &self.tables[tid].name.clone());
                self.tables[tid].decode_tuple(&self.registry, &ins.tuple)?;

                let mut docs = Vec::new();
                if self.tables[tid].index {
                    docs.push(Document {
                        position: pos,
                        meta: self.tables[tid].bulk_header(Action::Index)?,
                        data: Some(self.tables[tid].doc_body()?),
                    });
                }
                self.push_inline_adds(tid, pos, &mut docs)?;
                self.send_all(docs).await
            }

            LogicalMessage::Update(upd) => {
                let tid = self.expect_relation(upd.relation_id)?;
                self.metrics
                    .inc_streamed("update", &self.tables[tid].name.clone());

                let mut docs = Vec::new();
                let mut recreate = false;

                // If the document keys (_id, routing) changed, it can not be
                // updated in place: delete the old document first. Without
                // the old row image this path is unavailable.
                if !self.tables[tid].upsert_only {
                    if let Some(old) = &upd.old_tuple {
                        self.tables[tid].decode_tuple(&self.registry, old)?;

                        if self.tables[tid].index
                            && self.tables[tid].keys_changed(Some(old), &upd.new_tuple)
                        {
                            recreate = true;
                            docs.push(Document {
                                position: pos,
                                meta: self.tables[tid].bulk_header(Action::Delete)?,
                                data: None,
                            });
                        }

                        // clean up inline entries whose keys moved
                        for iid in self.tables[tid].inlined_in.clone() {
                            let inline = &self.inlines[iid];
                            let source = &self.tables[tid];
                            if inline.keys_changed(Some(old), &upd.new_tuple, source) {
                                let parent = &self.tables[self.inline_parent(iid)?];
                                docs.push(Document {
                                    position: pos,
                                    meta: inline.bulk_header(source, parent)?,
                                    data: Some(inline.del_script(source)?),
                                });
                            }
                        }
                    }
                }

                self.tables[tid].decode_tuple(&self.registry, &upd.new_tuple)?;

                if self.tables[tid].index {
                    if recreate {
                        // the previous document is gone; index a fresh one
                        docs.push(Document {
                            position: pos,
                            meta: self.tables[tid].bulk_header(Action::Index)?,
                            data: Some(self.tables[tid].doc_body()?),
                        });
                    } else {
                        docs.push(Document {
                            position: pos,
                            meta: self.tables[tid].bulk_header(Action::Update)?,
                            data: Some(self.tables[tid].update_doc_body()?),
                        });
                    }
                }
                self.push_inline_adds(tid, pos, &mut docs)?;
                self.send_all(docs).await
            }

            LogicalMessage::Delete(del) => {
                let tid = self.expect_relation(del.relation_id)?;
                self.metrics
                    .inc_streamed("delete", &self.tables[tid].name.clone());
                self.tables[tid].decode_tuple(&self.registry, &del.old_tuple)?;

                let mut docs = Vec::new();
                if self.tables[tid].index && !self.tables[tid].upsert_only {
                    docs.push(Document {
                        position: pos,
                        meta: self.tables[tid].bulk_header(Action::Delete)?,
                        data: None,
                    });
                }
                for iid in self.tables[tid].inlined_in.clone() {
                    let inline = &self.inlines[iid];
                    if inline.upsert_only {
                        continue;
                    }
                    let source = &self.tables[tid];
                    let parent = &self.tables[self.inline_parent(iid)?];
                    docs.push(Document {
                        position: pos,
                        meta: inline.bulk_header(source, parent)?,
                        data: Some(inline.del_script(source)?),
                    });
                }
                self.send_all(docs).await
            }

            LogicalMessage::Truncate(trunc) => {
                warn!(
                    relations = ?trunc.relation_ids,
                    "truncate is not supported and was skipped"
                );
                Ok(())
            }
        }
    }

    fn expect_relation(&self, oid: u32) -> Result<crate::schema::TableId> {
        self.relation(oid).ok_or_else(|| {
            Error::protocol(format!("row event for unknown relation {oid}"))
        })
    }

    fn inline_parent(&self, iid: crate::schema::InlineId) -> Result<crate::schema::TableId> {
        self.inlines[iid].parent.ok_or_else(|| {
            Error::config(format!(
                "inline {} has no parent table",
                self.inlines[iid].name
            ))
        })
    }

    /// Inline add operations against every parent this table feeds.
    fn push_inline_adds(
        &self,
        tid: crate::schema::TableId,
        pos: Lsn,
        docs: &mut Vec<Document>,
    ) -> Result<()> {
        for &iid in &self.tables[tid].inlined_in {
            let inline = &self.inlines[iid];
            let source = &self.tables[tid];
            let parent = &self.tables[self.inline_parent(iid)?];
            docs.push(Document {
                position: pos,
                meta: inline.bulk_header(source, parent)?,
                data: Some(inline.add_script(source, parent)?),
            });
        }
        Ok(())
    }

    async fn send_all(&self, docs: Vec<Document>) -> Result<()> {
        for doc in docs {
            self.stream.doc(doc).await?;
        }
        Ok(())
    }
}
