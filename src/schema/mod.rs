//! The schema tree: database, schemas, tables, columns and inlines.
//!
//! Tables and inlines reference each other both ways (a table parents
//! inlines whose sources are other tables), so both live in arenas on
//! [`Database`] and hold index handles instead of owning pointers. The tree
//! is mutated during startup discovery and on relation messages, both on
//! the reader task; the streaming hot path only reads it.

mod column;
mod discovery;
mod inline;
mod join;
mod table;
mod tags;

pub use column::Column;
pub use inline::{Inline, SCRIPT_ADD, SCRIPT_DEL};
pub use join::TableJoin;
pub use table::Table;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pipe::{AckPosition, DocTx};
use crate::protocol::{PgConnectOptions, ReplicationClient};
use crate::types::TypeRegistry;

pub type TableId = usize;
pub type InlineId = usize;

/// Name maps of one Postgres schema (namespace).
#[derive(Default)]
struct SchemaEntry {
    tables: HashMap<String, TableId>,
    inlines: HashMap<String, InlineId>,
}

/// The replicated database: configuration tree, type registry and both
/// upstream connections.
pub struct Database {
    /// Database name; doubles as the index name for the `public` schema.
    pub name: String,
    pub slot: String,
    pub publication: String,
    /// Interval between standby status updates.
    pub standby_timeout: Duration,

    pub(crate) tables: Vec<Table>,
    pub(crate) inlines: Vec<Inline>,
    schemas: HashMap<String, SchemaEntry>,
    pub(crate) relations: HashMap<u32, TableId>,

    pub registry: TypeRegistry,

    /// Discovery/metadata connection; a mutex serializes access because
    /// replication runs its own connection and everything else shares this
    /// one.
    pub(crate) query: Option<Arc<Mutex<tokio_postgres::Client>>>,
    /// Replication-mode connection, owned by the reader.
    pub(crate) repl: Option<ReplicationClient>,
    /// Request binary tuple values (PG14+).
    pub(crate) use_binary: bool,

    pub(crate) stream: DocTx,
    pub(crate) ack: AckPosition,
    pub(crate) metrics: Arc<Metrics>,
}

impl Database {
    pub fn new(
        slot: String,
        publication: String,
        stream: DocTx,
        ack: AckPosition,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: String::new(),
            slot,
            publication,
            standby_timeout: Duration::from_secs(10),
            tables: Vec::new(),
            inlines: Vec::new(),
            schemas: HashMap::new(),
            relations: HashMap::new(),
            registry: TypeRegistry::with_builtins(),
            query: None,
            repl: None,
            use_binary: false,
            stream,
            ack,
            metrics,
        }
    }

    /// Opens both connections: the regular query connection for discovery
    /// and type resolution, and the replication-mode connection.
    pub async fn connect(&mut self, opts: &PgConnectOptions) -> Result<()> {
        if opts.database.is_empty() {
            return Err(Error::config("database needs to be specified"));
        }
        self.name = opts.database.clone();

        let mut config = tokio_postgres::Config::new();
        config
            .host(&opts.host)
            .port(opts.port)
            .dbname(&opts.database)
            .user(&opts.user)
            .application_name("pg2search")
            .options("-c statement_timeout=0");
        if let Some(password) = &opts.password {
            config.password(password);
        }
        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "query connection closed");
            }
        });
        self.query = Some(Arc::new(Mutex::new(client)));

        let repl = ReplicationClient::connect(opts).await?;
        let version = repl
            .parameter("server_version")
            .unwrap_or("unknown")
            .to_string();
        let major = repl.server_major_version();
        if major.is_none() {
            warn!(postgres_version = %version, "can not parse Postgres major version");
        }
        self.use_binary = major.is_some_and(|m| m >= 14);
        self.repl = Some(repl);

        info!(
            postgres_version = %version,
            binary_streaming = self.use_binary,
            "connected to database"
        );
        Ok(())
    }

    /// Shared handle to the query connection, e.g. for the lag probe.
    pub fn query_handle(&self) -> Option<Arc<Mutex<tokio_postgres::Client>>> {
        self.query.clone()
    }

    /// Gets or creates a table config with its defaults.
    pub fn table_entry(&mut self, schema: &str, table: &str) -> TableId {
        let entry = self.schemas.entry(schema.to_string()).or_default();
        if let Some(&tid) = entry.tables.get(table) {
            return tid;
        }
        let tid = self.tables.len();
        self.tables.push(Table::new(schema, table));
        entry.tables.insert(table.to_string(), tid);
        tid
    }

    /// Gets or creates an inline definition with its defaults.
    pub fn inline_entry(&mut self, schema: &str, name: &str) -> InlineId {
        let entry = self.schemas.entry(schema.to_string()).or_default();
        if let Some(&iid) = entry.inlines.get(name) {
            return iid;
        }
        let iid = self.inlines.len();
        self.inlines.push(Inline::new(name));
        entry.inlines.insert(name.to_string(), iid);
        iid
    }

    pub fn table(&self, tid: TableId) -> &Table {
        &self.tables[tid]
    }

    pub fn inline(&self, iid: InlineId) -> &Inline {
        &self.inlines[iid]
    }

    /// Table by relation OID, populated by relation messages.
    pub fn relation(&self, oid: u32) -> Option<TableId> {
        self.relations.get(&oid).copied()
    }

    /// Makes sure a decoder for the OID exists, discovering it on demand
    /// over the query connection.
    pub async fn data_type(&mut self, oid: u32) -> Result<()> {
        if oid == 0 {
            return Err(Error::ZeroTypeOid);
        }
        if self.registry.contains(oid) {
            return Ok(());
        }
        let query = self
            .query
            .clone()
            .ok_or_else(|| Error::invalid_state("query connection not established"))?;
        let client = query.lock().await;
        self.registry.discover(&client, oid).await?;
        self.registry.resolve(oid).map(|_| ())
    }

    /// Consistency checks and pre-computed caches for a table: pk fallback,
    /// index naming, upsert-only inference and the active column set. Also
    /// re-inits every inline the table feeds. Runs after discovery and
    /// after every relation message.
    pub fn init_table(&mut self, tid: TableId) -> Result<()> {
        if self.tables[tid].pk_col.is_none() {
            let fallback = self.tables[tid].columns.iter().position(|c| c.sql_pk);
            if fallback.is_some() {
                self.tables[tid].pk_col = fallback;
            }
        }

        for iid in self.tables[tid].inlined_in.clone() {
            self.init_inline(iid)?;
        }

        // decode set: indexed columns plus every inline participant
        let mut active: Vec<usize> = Vec::new();
        for (cid, col) in self.tables[tid].columns.iter().enumerate() {
            let mut used = col.index;
            for &iid in &self.tables[tid].inlined_in {
                let inl = &self.inlines[iid];
                used |= inl.columns.iter().any(|(_, c)| *c == cid)
                    || inl.pk_col == Some(cid)
                    || inl.parent_col == Some(cid)
                    || inl.routing_col == Some(cid);
            }
            if used {
                active.push(cid);
            }
        }
        self.tables[tid].active_cols = active;

        let table = &mut self.tables[tid];
        if !table.index {
            // ignored tables skip the document-side checks
            return Ok(());
        }

        let pk = table.pk_col.ok_or_else(|| {
            Error::config(format!(
                "table {}.{} has no primary key and no pk tag",
                table.schema, table.name
            ))
        })?;

        table.index_name = if table.schema == "public" {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, table.schema)
        };

        if !table.columns[pk].old_in_wal
            || table
                .routing_col
                .is_some_and(|cid| !table.columns[cid].old_in_wal)
        {
            table.upsert_only = true;
        }
        Ok(())
    }

    fn init_inline(&mut self, iid: InlineId) -> Result<()> {
        let inline = &self.inlines[iid];
        let source_tid = inline
            .source
            .ok_or_else(|| Error::config(format!("inline {} has no source table", inline.name)))?;
        inline
            .parent
            .ok_or_else(|| Error::config(format!("inline {} has no parent table", inline.name)))?;
        if inline.parent_col.is_none() {
            return Err(Error::config(format!(
                "inline {}: parent column is not configured",
                inline.name
            )));
        }

        let source_pk = self.tables[source_tid].pk_col;
        let inline = &mut self.inlines[iid];
        if inline.pk_col.is_none() {
            if source_pk.is_none() {
                return Err(Error::config(format!(
                    "inline {}: pk column is not configured",
                    inline.name
                )));
            }
            info!(inline = %inline.name, "using implicit pk column");
            inline.pk_col = source_pk;
        }

        let source = &self.tables[source_tid];
        let inline = &self.inlines[iid];
        let old_missing = |cid: Option<usize>| cid.is_some_and(|c| !source.columns[c].old_in_wal);
        let upsert_only = old_missing(inline.pk_col)
            || old_missing(inline.parent_col)
            || old_missing(inline.routing_col);
        self.inlines[iid].upsert_only = upsert_only;
        Ok(())
    }

    /// Tables that take part in reindexing: indexed ones and inline
    /// sources, ordered so every inline source is copied before its parent
    /// (the add scripts then find or seed the parent documents).
    pub fn indexable_tables(&self) -> Vec<TableId> {
        let selected: Vec<TableId> = (0..self.tables.len())
            .filter(|&tid| self.tables[tid].index || !self.tables[tid].inlined_in.is_empty())
            .collect();
        if selected.len() < 2 {
            return selected;
        }

        // Kahn's algorithm over source -> parent edges, seeded in arena
        // order so unrelated tables keep a stable ordering.
        let mut indegree: HashMap<TableId, usize> =
            selected.iter().map(|&tid| (tid, 0)).collect();
        let mut edges: HashMap<TableId, Vec<TableId>> = HashMap::new();
        for inline in &self.inlines {
            if let (Some(source), Some(parent)) = (inline.source, inline.parent) {
                if source != parent
                    && indegree.contains_key(&source)
                    && indegree.contains_key(&parent)
                {
                    edges.entry(source).or_default().push(parent);
                    *indegree.get_mut(&parent).unwrap() += 1;
                }
            }
        }

        let mut queue: Vec<TableId> = selected
            .iter()
            .copied()
            .filter(|tid| indegree[tid] == 0)
            .collect();
        let mut ordered = Vec::with_capacity(selected.len());
        let mut at = 0;
        while at < queue.len() {
            let tid = queue[at];
            at += 1;
            ordered.push(tid);
            for &next in edges.get(&tid).into_iter().flatten() {
                let d = indegree.get_mut(&next).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push(next);
                }
            }
        }
        // cyclic leftovers (mutually inlined tables) append in arena order
        for &tid in &selected {
            if !ordered.contains(&tid) {
                ordered.push(tid);
            }
        }
        ordered
    }

    /// Logs the discovered configuration: one line per table and inline,
    /// with column dispositions and upsert-only warnings.
    pub fn log_status(&self) {
        for (schema_name, entry) in &self.schemas {
            for (_, &tid) in &entry.tables {
                let table = &self.tables[tid];
                info!(
                    schema = %schema_name,
                    table = %table.name,
                    index = table.index,
                    doc_type = %table.doc_type,
                    target_index = %table.index_name,
                    "discovered table"
                );
                if table.upsert_only {
                    warn!(
                        table = %table.name,
                        "table is forwarded in upsert-only mode; not all key fields are available in WAL"
                    );
                }
                for (cid, col) in table.columns.iter().enumerate() {
                    info!(
                        table = %table.name,
                        column = %col.name,
                        field = %col.field_name,
                        indexed = col.index,
                        pk = table.pk_col == Some(cid),
                        routing = table.routing_col == Some(cid),
                        old_in_wal = col.old_in_wal,
                        "column"
                    );
                }
            }
            for (_, &iid) in &entry.inlines {
                let inline = &self.inlines[iid];
                let source = inline.source.map(|tid| self.tables[tid].name.as_str());
                let parent = inline.parent.map(|tid| self.tables[tid].name.as_str());
                info!(
                    inline = %inline.name,
                    field = %inline.field_name,
                    source = source.unwrap_or("?"),
                    parent = parent.unwrap_or("?"),
                    "discovered inline"
                );
                if inline.upsert_only {
                    warn!(
                        inline = %inline.name,
                        "inline is forwarded in upsert-only mode; not all key fields are available in WAL"
                    );
                }
            }
        }
    }
}
