//! The bulk flusher: accumulates NDJSON operations and decides when to
//! push them.
//!
//! Flush triggers, first one wins:
//!
//! 1. **full**: the next document does not fit the buffer; the producer is
//!    blocked on the pipe until the drain finishes.
//! 2. **shutdown**: drain once and exit.
//! 3. **idle**: nothing was pushed for `idle`.
//! 4. **debounce**: the idle interval expired with an empty buffer; the
//!    first write afterwards schedules a push `debounce` later instead of
//!    waiting out another idle interval. Re-armed after every flush.
//!
//! A global throttle keeps at least `throttle` between pushes, full buffers
//! included. After a successful push the buffered positions are durable
//! downstream, and only then is the acknowledged position published.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::SearchClient;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::metrics::Metrics;
use crate::pipe::{Document, Item};

#[derive(Debug, Clone)]
pub struct FlushOptions {
    /// Buffer capacity in bytes; one bulk request is never larger.
    pub capacity: usize,
    /// Maximum waiting time for data; any partial buffer is pushed after it.
    pub idle: Duration,
    /// Minimal time between requests.
    pub throttle: Duration,
    /// Delay between the first write into an empty-and-idle buffer and its
    /// push.
    pub debounce: Duration,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            capacity: 4 << 20,
            idle: Duration::from_secs(5),
            throttle: Duration::from_millis(500),
            debounce: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Debounce {
    /// Steady state: partial pushes happen at the idle interval.
    Skip,
    /// Idle expired with nothing buffered; the next write arms the timer.
    Requested,
    /// Push as soon as this deadline (and the throttle gate) passes.
    Armed(Instant),
}

/// Consumes the document pipe and owns the byte buffer.
pub struct Flusher {
    client: SearchClient,
    rx: mpsc::Receiver<Item>,
    ack: crate::pipe::AckPosition,
    metrics: Arc<Metrics>,
    opts: FlushOptions,

    buf: Vec<u8>,
    /// Position of the last item accepted into the buffer; zero while
    /// reindexing.
    inqueue: Lsn,
    last_flush: Instant,
    debounce: Debounce,
}

impl Flusher {
    pub fn new(
        client: SearchClient,
        rx: mpsc::Receiver<Item>,
        ack: crate::pipe::AckPosition,
        metrics: Arc<Metrics>,
        opts: FlushOptions,
    ) -> Self {
        Self {
            client,
            rx,
            ack,
            metrics,
            buf: Vec::with_capacity(opts.capacity),
            opts,
            inqueue: Lsn::ZERO,
            last_flush: Instant::now(),
            debounce: Debounce::Skip,
        }
    }

    /// Runs until cancellation or until the pipe closes; either way the
    /// remaining buffer is pushed once before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.flush().await?;
                    info!("shutdown: flusher drained");
                    return Ok(());
                }
                item = self.rx.recv() => match item {
                    None => {
                        self.flush().await?;
                        info!("document pipe closed, flusher drained");
                        return Ok(());
                    }
                    Some(Item::Mark(pos)) => {
                        self.inqueue = pos;
                        // nothing buffered means nothing precedes this
                        // position; acknowledge it right away
                        if self.buf.is_empty() {
                            self.publish(pos);
                        }
                    }
                    Some(Item::Doc(doc)) => self.append(doc).await?,
                },
                _ = sleep_until_opt(deadline) => {
                    if self.buf.is_empty() {
                        // idle with nothing to push: publish the recorded
                        // mark and switch to debounce for the next write
                        self.publish(self.inqueue);
                        self.debounce = Debounce::Requested;
                    } else {
                        self.flush().await?;
                    }
                }
            }
        }
    }

    /// Earliest moment a flush decision is due; `None` when only new input
    /// can change the state.
    fn next_deadline(&self) -> Option<Instant> {
        let gate = self.last_flush + self.opts.throttle;
        let idle_at = self.last_flush + self.opts.idle;
        if self.buf.is_empty() {
            match self.debounce {
                Debounce::Skip => Some(idle_at),
                _ => None,
            }
        } else {
            match self.debounce {
                Debounce::Armed(at) => Some(at.max(gate)),
                _ => Some(idle_at.max(gate)),
            }
        }
    }

    async fn append(&mut self, doc: Document) -> Result<()> {
        let size = doc.ndjson_len();
        if size > self.opts.capacity {
            return Err(Error::DocumentTooLarge {
                size,
                cap: self.opts.capacity,
            });
        }
        if self.opts.capacity - self.buf.len() < size {
            // full buffer: drain first; the producer stays blocked on the
            // pipe handoff meanwhile
            self.flush().await?;
        }
        doc.write_ndjson(&mut self.buf);
        self.inqueue = doc.position;
        self.metrics.inc_doc_ops();
        if self.debounce == Debounce::Requested {
            self.debounce = Debounce::Armed(Instant::now() + self.opts.debounce);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.wait_throttle().await;

        let position = self.inqueue;
        if self.buf.is_empty() {
            self.publish(position);
            self.last_flush = Instant::now();
            self.debounce = Debounce::Skip;
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.client.bulk(&self.buf).await {
                Ok(()) => break,
                Err(e) if e.is_retriable() => {
                    attempt += 1;
                    self.metrics.inc_bulk_errors();
                    warn!(attempt, error = %e, "bulk push failed, retrying");
                    if attempt >= 3 {
                        return Err(e);
                    }
                    tokio::time::sleep(self.opts.throttle).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.metrics.add_pushed_bytes(self.buf.len() as u64);
        info!(bytes = self.buf.len(), lsn = %position, "pushed bulk request");
        self.publish(position);
        self.buf.clear();
        self.last_flush = Instant::now();
        self.debounce = Debounce::Skip;
        Ok(())
    }

    /// Zero positions are never acknowledged: reindex documents have no WAL
    /// coordinate yet.
    fn publish(&self, pos: Lsn) {
        if !pos.is_zero() {
            self.ack.publish(pos);
        }
    }

    async fn wait_throttle(&mut self) {
        let mut gate = self.last_flush + self.opts.throttle;
        if self.client.take_throttle() {
            // the engine asked to slow down on the previous push
            gate += self.opts.throttle;
        }
        tokio::time::sleep_until(gate).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
