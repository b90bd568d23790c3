//! The document pipe between the replication reader and the bulk flusher,
//! and the acknowledged-position cell flowing the other way.
//!
//! The pipe is a capacity-1 channel: a synchronous handoff that preserves
//! WAL order and gives the reader backpressure whenever the flusher is
//! busy draining its buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// One operation of a bulk request: header line plus optional body line.
#[derive(Debug, Clone)]
pub struct Document {
    /// WAL position this document was decoded at; zero during reindex.
    pub position: Lsn,
    /// Bulk action header (`{"index":{"_index":...,"_id":...}}`).
    pub meta: Bytes,
    /// Document content or script; delete operations have none.
    pub data: Option<Bytes>,
}

impl Document {
    /// Serialized size including the newline after every line.
    pub fn ndjson_len(&self) -> usize {
        self.meta.len() + 1 + self.data.as_ref().map(|d| d.len() + 1).unwrap_or(0)
    }

    /// Appends the NDJSON lines to a buffer.
    pub fn write_ndjson(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.meta);
        buf.push(b'\n');
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
            buf.push(b'\n');
        }
    }
}

/// What travels through the pipe: a document, or a bare position mark from
/// a keepalive so upstream lag does not grow while no indexed rows change.
#[derive(Debug)]
pub enum Item {
    Mark(Lsn),
    Doc(Document),
}

impl Item {
    pub fn position(&self) -> Lsn {
        match self {
            Item::Mark(pos) => *pos,
            Item::Doc(doc) => doc.position,
        }
    }
}

/// Producer half, owned by the replication reader.
#[derive(Clone)]
pub struct DocTx {
    tx: mpsc::Sender<Item>,
}

impl DocTx {
    pub async fn doc(&self, doc: Document) -> Result<()> {
        self.tx
            .send(Item::Doc(doc))
            .await
            .map_err(|_| Error::invalid_state("document pipe closed"))
    }

    pub async fn mark(&self, pos: Lsn) -> Result<()> {
        self.tx
            .send(Item::Mark(pos))
            .await
            .map_err(|_| Error::invalid_state("document pipe closed"))
    }
}

/// Creates the pipe. Capacity 1: item N+1 is accepted only once the flusher
/// picked up item N.
pub fn channel() -> (DocTx, mpsc::Receiver<Item>) {
    let (tx, rx) = mpsc::channel(1);
    (DocTx { tx }, rx)
}

/// The acknowledged WAL position, published by the flusher after every
/// successful bulk and sampled by the reader for standby status updates.
///
/// `fetch_max` keeps the value monotone no matter who publishes.
#[derive(Clone, Default)]
pub struct AckPosition(Arc<AtomicU64>);

impl AckPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Lsn {
        Lsn(self.0.load(Ordering::Acquire))
    }

    pub fn publish(&self, pos: Lsn) {
        self.0.fetch_max(pos.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_ndjson() {
        let doc = Document {
            position: Lsn(7),
            meta: Bytes::from_static(b"{\"delete\":{}}"),
            data: None,
        };
        assert_eq!(doc.ndjson_len(), 14);
        let mut buf = Vec::new();
        doc.write_ndjson(&mut buf);
        assert_eq!(buf, b"{\"delete\":{}}\n");

        let doc = Document {
            position: Lsn(8),
            meta: Bytes::from_static(b"{\"index\":{}}"),
            data: Some(Bytes::from_static(b"{\"id\":1}")),
        };
        assert_eq!(doc.ndjson_len(), 13 + 9);
        let mut buf = Vec::new();
        doc.write_ndjson(&mut buf);
        assert_eq!(buf, b"{\"index\":{}}\n{\"id\":1}\n");
    }

    #[test]
    fn test_ack_position_monotone() {
        let ack = AckPosition::new();
        assert_eq!(ack.get(), Lsn::ZERO);
        ack.publish(Lsn(10));
        assert_eq!(ack.get(), Lsn(10));
        ack.publish(Lsn(5)); // stale publish never rewinds
        assert_eq!(ack.get(), Lsn(10));
        ack.publish(Lsn(11));
        assert_eq!(ack.get(), Lsn(11));
    }

    #[tokio::test]
    async fn test_pipe_handoff_order() {
        let (tx, mut rx) = channel();
        let sender = tokio::spawn(async move {
            for i in 1..=5u64 {
                tx.mark(Lsn(i)).await.unwrap();
            }
        });
        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item.position().0);
        }
        sender.await.unwrap();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }
}
