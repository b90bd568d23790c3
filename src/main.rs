//! pg2search daemon: wires the replication reader, the bulk flusher and the
//! HTTP surface together, and owns the startup/shutdown choreography.

mod config;
mod http;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pg2search::{lag, pipe, search, Database, Flusher, Lsn, Metrics, SearchClient};

use config::Config;
use state::{Phase, StateCell};

fn init_tracing(format: &str, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        "cli" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    init_tracing(&cfg.log_format, &cfg.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting pg2search");

    let cancel = CancellationToken::new();
    let state = Arc::new(StateCell::new());
    let metrics = Arc::new(Metrics::new());

    // downstream first: scripts must exist before any inline update flows
    let search_client = SearchClient::new(
        &cfg.search_host,
        cfg.search_username.clone(),
        cfg.search_password.clone(),
    )?;
    search::install_scripts(&search_client)
        .await
        .context("install stored scripts")?;

    let (doc_tx, doc_rx) = pipe::channel();
    let ack = pipe::AckPosition::new();
    let flusher = Flusher::new(
        search_client,
        doc_rx,
        ack.clone(),
        metrics.clone(),
        cfg.flush_options(),
    );
    let mut flusher_task = tokio::spawn(flusher.run(cancel.clone()));

    // upstream: connect, discover the tag-driven configuration
    let mut db = Database::new(
        cfg.slot.clone(),
        cfg.publication.clone(),
        doc_tx,
        ack.clone(),
        metrics.clone(),
    );
    db.connect(&cfg.pg_options())
        .await
        .context("connect to postgres")?;
    db.discover().await.context("discover publication config")?;
    db.log_status();

    // internal http surface
    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("bind {}", cfg.addr))?;
    let http_task = tokio::spawn(http::serve(
        listener,
        state.clone(),
        metrics.clone(),
        cancel.clone(),
    ));

    if let Some(query) = db.query_handle() {
        tokio::spawn(lag::probe(
            query,
            cfg.slot.clone(),
            metrics.clone(),
            cancel.clone(),
            Duration::from_secs(30),
        ));
    }

    // startup sequence and streaming, on the reader task
    let create = cfg.wants_slot_create();
    let recreate = cfg.recreate;
    let reindex = cfg.wants_reindex();
    let reader_cancel = cancel.clone();
    let reader_state = state.clone();
    let mut reader_task = tokio::spawn(async move {
        if recreate {
            db.drop_slot().await?;
        }
        // slot creation exports a snapshot into this transaction; the copy
        // must happen inside it so data and stream position agree
        db.tx_begin().await?;
        if create {
            db.create_slot().await?;
        }
        if reindex {
            info!("reindexing data");
            reader_state.store(Phase::Reindexing);
            db.reindex(&reader_cancel).await?;
            reader_state.store(Phase::ReindexingDone);
        }
        db.tx_commit().await?;
        reader_state.store(Phase::StartedUp);

        reader_state.store(Phase::StreamingWal);
        // zero means: resume from the slot's confirmed position
        db.start_replication(Lsn::ZERO, &reader_cancel).await
    });

    // run until a signal arrives or a task dies
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down gracefully");
        }
        res = &mut reader_task => {
            fatal_exit("replication", flatten(res));
        }
        res = &mut flusher_task => {
            fatal_exit("flusher", flatten(res));
        }
    }

    state.store(Phase::ShuttingDown);
    cancel.cancel();

    // a second signal skips the graceful path
    tokio::spawn(async {
        shutdown_signal().await;
        error!("received second signal; dying now");
        std::process::exit(1);
    });

    let shutdown = async {
        if let Err(e) = flatten(reader_task.await) {
            error!(error = %e, "replication ended with error during shutdown");
        }
        if let Err(e) = flatten(flusher_task.await) {
            error!(error = %e, "flusher ended with error during shutdown");
        }
        let _ = http_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(30), shutdown)
        .await
        .is_err()
    {
        error!("graceful shutdown timed out");
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "can not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn flatten(
    res: Result<pg2search::Result<()>, tokio::task::JoinError>,
) -> pg2search::Result<()> {
    match res {
        Ok(res) => res,
        Err(e) => Err(pg2search::Error::invalid_state(format!("task panicked: {e}"))),
    }
}

fn fatal_exit(task: &str, res: pg2search::Result<()>) -> ! {
    match res {
        Ok(()) => error!(task, "task exited unexpectedly"),
        Err(e) => error!(task, error = %e, "task failed"),
    }
    std::process::exit(1);
}
