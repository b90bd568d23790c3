//! Process metrics, rendered in Prometheus text format by the HTTP
//! endpoint. Counters are plain atomics; the per-table maps sit behind a
//! lock that is only touched once per decoded row.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Shared metric registry.
pub struct Metrics {
    started_at: Instant,
    /// Decoded streaming messages by (operation, table).
    streamed: Mutex<BTreeMap<(String, String), u64>>,
    /// Initial rows received via COPY, by table.
    copy_rows: Mutex<BTreeMap<String, u64>>,
    /// Document index/update/delete operations handed to the flusher.
    doc_ops: AtomicU64,
    /// Total NDJSON bytes accepted by the search engine.
    pushed_bytes: AtomicU64,
    /// Successful bulk requests.
    bulk_requests: AtomicU64,
    /// Bulk attempts that failed and were retried or gave up.
    bulk_errors: AtomicU64,
    /// Retained WAL behind the slot, from the lag probe.
    slot_lag_bytes: AtomicU64,
    /// Whether the slot was usable at the last probe.
    slot_ok: AtomicBool,
    slot_seen: AtomicBool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            streamed: Mutex::new(BTreeMap::new()),
            copy_rows: Mutex::new(BTreeMap::new()),
            doc_ops: AtomicU64::new(0),
            pushed_bytes: AtomicU64::new(0),
            bulk_requests: AtomicU64::new(0),
            bulk_errors: AtomicU64::new(0),
            slot_lag_bytes: AtomicU64::new(0),
            slot_ok: AtomicBool::new(true),
            slot_seen: AtomicBool::new(false),
        }
    }

    pub fn inc_streamed(&self, operation: &str, table: &str) {
        *self
            .streamed
            .lock()
            .entry((operation.to_string(), table.to_string()))
            .or_insert(0) += 1;
    }

    pub fn inc_copy_rows(&self, table: &str) {
        *self.copy_rows.lock().entry(table.to_string()).or_insert(0) += 1;
    }

    pub fn inc_doc_ops(&self) {
        self.doc_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pushed_bytes(&self, bytes: u64) {
        self.pushed_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.bulk_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bulk_errors(&self) {
        self.bulk_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_slot_lag(&self, bytes: u64, usable: bool) {
        self.slot_lag_bytes.store(bytes, Ordering::Relaxed);
        self.slot_ok.store(usable, Ordering::Relaxed);
        self.slot_seen.store(true, Ordering::Relaxed);
    }

    /// Renders the Prometheus exposition text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP pg2search_uptime_seconds Time since the process started\n");
        out.push_str("# TYPE pg2search_uptime_seconds gauge\n");
        out.push_str(&format!(
            "pg2search_uptime_seconds {:.3}\n\n",
            self.started_at.elapsed().as_secs_f64()
        ));

        out.push_str(
            "# HELP pg2search_streaming_messages_total Decoded messages received in streaming replication\n",
        );
        out.push_str("# TYPE pg2search_streaming_messages_total counter\n");
        for ((operation, table), count) in self.streamed.lock().iter() {
            out.push_str(&format!(
                "pg2search_streaming_messages_total{{operation=\"{}\",table=\"{}\"}} {}\n",
                operation, table, count
            ));
        }
        out.push('\n');

        out.push_str("# HELP pg2search_copy_rows_total Initial rows received via COPY\n");
        out.push_str("# TYPE pg2search_copy_rows_total counter\n");
        for (table, count) in self.copy_rows.lock().iter() {
            out.push_str(&format!(
                "pg2search_copy_rows_total{{table=\"{}\"}} {}\n",
                table, count
            ));
        }
        out.push('\n');

        out.push_str(
            "# HELP pg2search_doc_operations_total Document index/update/delete operations\n",
        );
        out.push_str("# TYPE pg2search_doc_operations_total counter\n");
        out.push_str(&format!(
            "pg2search_doc_operations_total {}\n\n",
            self.doc_ops.load(Ordering::Relaxed)
        ));

        out.push_str(
            "# HELP pg2search_pushed_bytes_total NDJSON bytes accepted by the search engine\n",
        );
        out.push_str("# TYPE pg2search_pushed_bytes_total counter\n");
        out.push_str(&format!(
            "pg2search_pushed_bytes_total {}\n\n",
            self.pushed_bytes.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP pg2search_bulk_requests_total Successful bulk requests\n");
        out.push_str("# TYPE pg2search_bulk_requests_total counter\n");
        out.push_str(&format!(
            "pg2search_bulk_requests_total {}\n\n",
            self.bulk_requests.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP pg2search_bulk_errors_total Failed bulk attempts\n");
        out.push_str("# TYPE pg2search_bulk_errors_total counter\n");
        out.push_str(&format!(
            "pg2search_bulk_errors_total {}\n\n",
            self.bulk_errors.load(Ordering::Relaxed)
        ));

        if self.slot_seen.load(Ordering::Relaxed) {
            out.push_str(
                "# HELP pg2search_slot_retained_wal_bytes WAL retained behind the replication slot\n",
            );
            out.push_str("# TYPE pg2search_slot_retained_wal_bytes gauge\n");
            out.push_str(&format!(
                "pg2search_slot_retained_wal_bytes {}\n\n",
                self.slot_lag_bytes.load(Ordering::Relaxed)
            ));

            out.push_str("# HELP pg2search_slot_usable Whether the replication slot is usable\n");
            out.push_str("# TYPE pg2search_slot_usable gauge\n");
            out.push_str(&format!(
                "pg2search_slot_usable {}\n",
                self.slot_ok.load(Ordering::Relaxed) as u8
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_counters() {
        let metrics = Metrics::new();
        metrics.inc_streamed("insert", "users");
        metrics.inc_streamed("insert", "users");
        metrics.inc_streamed("delete", "users");
        metrics.inc_copy_rows("users");
        metrics.inc_doc_ops();
        metrics.add_pushed_bytes(512);

        let out = metrics.render();
        assert!(out
            .contains("pg2search_streaming_messages_total{operation=\"insert\",table=\"users\"} 2"));
        assert!(out
            .contains("pg2search_streaming_messages_total{operation=\"delete\",table=\"users\"} 1"));
        assert!(out.contains("pg2search_copy_rows_total{table=\"users\"} 1"));
        assert!(out.contains("pg2search_doc_operations_total 1"));
        assert!(out.contains("pg2search_pushed_bytes_total 512"));
        assert!(out.contains("pg2search_bulk_requests_total 1"));
    }

    #[test]
    fn test_slot_gauges_appear_after_probe() {
        let metrics = Metrics::new();
        assert!(!metrics.render().contains("pg2search_slot_retained_wal_bytes"));

        metrics.set_slot_lag(1024, true);
        let out = metrics.render();
        assert!(out.contains("pg2search_slot_retained_wal_bytes 1024"));
        assert!(out.contains("pg2search_slot_usable 1"));
    }
}
