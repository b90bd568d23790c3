//! Daemon configuration: three CLI flags plus the environment contract.

use std::time::Duration;

use clap::Parser;

use pg2search::protocol::PgConnectOptions;
use pg2search::FlushOptions;

#[derive(Parser, Debug)]
#[command(
    name = "pg2search",
    version,
    about = "PostgreSQL to search-engine replication bridge"
)]
pub struct Config {
    /// Create the replication slot if it does not exist.
    #[arg(long)]
    pub create: bool,

    /// Drop and re-create the replication slot; implies --reindex.
    #[arg(long)]
    pub recreate: bool,

    /// Copy a full snapshot into the search engine before streaming.
    #[arg(long)]
    pub reindex: bool,

    /// Replication slot holding the authoritative resume position.
    #[arg(long, env = "PG_SLOT", default_value = "pg2es")]
    pub slot: String,

    /// Publication listing the replicated tables.
    #[arg(long, env = "PG_PUBLICATION", default_value = "search")]
    pub publication: String,

    #[arg(long, env = "PGHOST", default_value = "localhost")]
    pub pg_host: String,

    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pub pg_port: u16,

    #[arg(long, env = "PGDATABASE")]
    pub pg_database: String,

    #[arg(long, env = "PGUSER", default_value = "postgres")]
    pub pg_user: String,

    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    pub pg_password: Option<String>,

    /// Search engine URL or host; may carry basic-auth credentials.
    #[arg(long, env = "SEARCH_HOST")]
    pub search_host: String,

    #[arg(long, env = "SEARCH_USERNAME")]
    pub search_username: Option<String>,

    #[arg(long, env = "SEARCH_PASSWORD", hide_env_values = true)]
    pub search_password: Option<String>,

    /// Bulk request body limit in megabytes. Small values (2-8) are
    /// recommended; the engine-side limit is 100.
    #[arg(long, env = "SEARCH_BULK_SIZE", default_value_t = 4)]
    pub search_bulk_size: usize,

    /// Maximum waiting time between bulk requests.
    #[arg(long, env = "SEARCH_PUSH_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub search_push_interval: Duration,

    /// Log output format: json or cli.
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Bind address of the state/metrics HTTP endpoint.
    #[arg(long, env = "ADDR", default_value = "0.0.0.0:80")]
    pub addr: String,
}

impl Config {
    /// Whether the startup sequence copies a snapshot. Recreating the slot
    /// moves the resume position, so the copy is mandatory then.
    pub fn wants_reindex(&self) -> bool {
        self.reindex || self.recreate
    }

    pub fn wants_slot_create(&self) -> bool {
        self.create || self.recreate
    }

    pub fn pg_options(&self) -> PgConnectOptions {
        PgConnectOptions {
            host: self.pg_host.clone(),
            port: self.pg_port,
            database: self.pg_database.clone(),
            user: self.pg_user.clone(),
            password: self.pg_password.clone(),
        }
    }

    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            capacity: self.search_bulk_size.clamp(1, 100) << 20,
            idle: self.search_push_interval.max(Duration::from_secs(1)),
            ..FlushOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["pg2search"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["--pg-database", "app", "--search-host", "search:9200"]);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.slot, "pg2es");
        assert_eq!(cfg.publication, "search");
        assert_eq!(cfg.search_bulk_size, 4);
        assert_eq!(cfg.search_push_interval, Duration::from_secs(30));
        assert!(!cfg.wants_reindex());
        assert!(!cfg.wants_slot_create());
    }

    #[test]
    fn test_recreate_implies_reindex_and_create() {
        let cfg = parse(&["--recreate"]);
        assert!(cfg.wants_reindex());
        assert!(cfg.wants_slot_create());
    }

    #[test]
    fn test_bulk_size_clamped() {
        let cfg = parse(&["--search-bulk-size", "1000"]);
        assert_eq!(cfg.flush_options().capacity, 100 << 20);

        let cfg = parse(&["--search-bulk-size", "0"]);
        assert_eq!(cfg.flush_options().capacity, 1 << 20);
    }

    #[test]
    fn test_push_interval_parsing() {
        let cfg = parse(&["--search-push-interval", "1500ms"]);
        assert_eq!(cfg.search_push_interval, Duration::from_millis(1500));
        // sub-second intervals are raised to the engine-friendly minimum
        assert_eq!(cfg.flush_options().idle, Duration::from_secs(1));
    }
}
