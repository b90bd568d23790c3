//! Periodic replication-slot lag probe.
//!
//! Runs on the shared query connection: reports how much WAL the slot
//! retains and error-logs slots the server marked unusable (`lost`), which
//! means the only way forward is recreating the slot and reindexing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Metrics;

const LAG_QUERY: &str = r#"
SELECT pg_current_wal_lsn()::text,
       COALESCE(confirmed_flush_lsn::text, '')    AS committed,
       COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn), 0)::bigint AS lag_bytes,
       COALESCE(wal_status::text, '')             AS status
FROM pg_replication_slots
WHERE slot_name = $1
"#;

/// Probes the slot every `interval` until cancelled. Query failures are
/// logged and retried on the next tick; they never stop replication.
pub async fn probe(
    query: Arc<Mutex<tokio_postgres::Client>>,
    slot: String,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let row = {
            let client = query.lock().await;
            client.query_opt(LAG_QUERY, &[&slot]).await
        };
        match row {
            Err(e) => warn!(slot = %slot, error = %e, "slot lag query failed"),
            Ok(None) => error!(slot = %slot, "replication slot does not exist"),
            Ok(Some(row)) => {
                let current: String = row.get(0);
                let committed: String = row.get(1);
                let lag_bytes: i64 = row.get(2);
                let status: String = row.get(3);

                let usable = status != "lost";
                metrics.set_slot_lag(lag_bytes.max(0) as u64, usable);

                if !usable {
                    error!(
                        slot = %slot,
                        slot_status = %status,
                        "slot is not usable; recreate the slot and reindex data"
                    );
                }
                info!(
                    slot = %slot,
                    slot_status = %status,
                    current_lsn = %current,
                    committed_lsn = %committed,
                    locked_wal_bytes = lag_bytes,
                    "slot lag"
                );
            }
        }
    }
}
