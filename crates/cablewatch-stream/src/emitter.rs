//! Line-delimited JSON output.
//!
//! All records go through one bounded queue drained by one writer task, so
//! the read loop and debounce timers never interleave bytes of different
//! records. Queue order is emission order. Once told to drain, the writer
//! finishes the record in flight and discards everything still queued except
//! records marked as retained.

use std::io;

use cablewatch_core::metrics::{RECORDS_DISCARDED_TOTAL, RECORDS_EMITTED_TOTAL};
use cablewatch_core::{OutboundEventRecord, Result, StreamError};
use metrics::counter;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes one JSON object per line to a sink.
pub struct LineEmitter<W> {
    sink: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> LineEmitter<W> {
    /// Wrap a sink.
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Serialize and write one record, then flush.
    pub async fn emit(&mut self, record: &OutboundEventRecord) -> Result<()> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, record).map_err(io::Error::other)?;
        self.buf.push(b'\n');
        self.sink.write_all(&self.buf).await?;
        self.sink.flush().await?;
        counter!(RECORDS_EMITTED_TOTAL, "kind" => record.kind()).increment(1);
        Ok(())
    }

    /// Give back the sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Records the writer may hold before producers have to wait.
pub const QUEUE_CAPACITY: usize = 32;

/// A record waiting for the writer.
#[derive(Debug)]
pub struct Queued {
    /// The record to write.
    pub record: OutboundEventRecord,
    /// Written even after the writer was told to drain.
    pub retain: bool,
}

impl Queued {
    /// A record that is discarded if still queued when draining starts.
    pub fn new(record: OutboundEventRecord) -> Self {
        Self {
            record,
            retain: false,
        }
    }

    /// A record that survives draining.
    pub fn retained(record: OutboundEventRecord) -> Self {
        Self { record, retain: true }
    }
}

/// Cloneable producer side of the emission queue.
#[derive(Clone, Debug)]
pub struct EmitterHandle {
    tx: mpsc::Sender<Queued>,
}

impl EmitterHandle {
    /// A handle paired with a bare receiver instead of a writer task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Queued>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue without waiting. Hands the record back when the queue is full
    /// or the writer has stopped.
    pub fn try_send(&self, queued: Queued) -> std::result::Result<(), TrySendError<Queued>> {
        self.tx.try_send(queued)
    }

    /// Wait for one free slot. `None` once the writer has stopped.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, Queued>> {
        self.tx.reserve().await.ok()
    }
}

/// Consumer side: the running writer task.
pub struct WriterHandle {
    task: JoinHandle<Result<()>>,
    failed: CancellationToken,
    drain: CancellationToken,
}

impl WriterHandle {
    /// Stop writing after the record in flight. Queued records are
    /// discarded unless retained.
    pub fn drain(&self) {
        self.drain.cancel();
    }

    /// Resolves once a write has failed.
    pub async fn failed(&self) {
        self.failed.cancelled().await;
    }

    /// Wait for the queue to drain and return the first write error, if any.
    ///
    /// The queue only closes once every [`EmitterHandle`] is dropped.
    pub async fn finish(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(StreamError::Sink(io::Error::other(join_err.to_string()))),
        }
    }
}

/// Start the writer task for `sink`.
pub fn spawn_writer<W>(sink: W) -> (EmitterHandle, WriterHandle)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (handle, mut rx) = EmitterHandle::channel(QUEUE_CAPACITY);
    let failed = CancellationToken::new();
    let failed_signal = failed.clone();
    let drain = CancellationToken::new();
    let draining = drain.clone();

    let task = tokio::spawn(async move {
        let mut emitter = LineEmitter::new(sink);
        let mut discarded: u64 = 0;
        while let Some(Queued { record, retain }) = rx.recv().await {
            if draining.is_cancelled() && !retain {
                discarded += 1;
                continue;
            }
            if let Err(err) = emitter.emit(&record).await {
                error!(error = %err, event = record.event_name(), "sink write failed");
                failed_signal.cancel();
                return Err(err);
            }
        }
        if discarded > 0 {
            counter!(RECORDS_DISCARDED_TOTAL).increment(discarded);
        }
        debug!(discarded, "emission queue closed");
        let mut sink = emitter.into_inner();
        let _ = sink.shutdown().await;
        Ok(())
    });

    (handle, WriterHandle { task, failed, drain })
}
