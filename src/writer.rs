//! Dedicated writer task for frame sending.
//!
//! Each connection owns one writer task that receives encoded frames via an
//! mpsc channel. Handlers, broadcasts and the client API all enqueue into
//! the same channel, so frames leave the socket in enqueue order without a
//! lock around the write half.
//!
//! # Architecture
//!
//! ```text
//! Handler   ─┐
//! Broadcast ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► Socket / Pipe
//! Client    ─┘
//! ```
//!
//! When the connection's close signal fires, the task drains frames that
//! are already queued, flushes, and shuts the write half down. A queued
//! `connect.refuse` therefore still reaches the peer before the close.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::CloseSignal;
use crate::error::{GroundlinkError, Result};

pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long `send` waits for the queue to drain below the limit.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on frames handed to one `write_vectored` call.
const MAX_BATCH_SIZE: usize = 64;

/// Per-connection writer settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued but not yet written before senders start waiting.
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    /// Longest a sender waits on a full queue before `BackpressureTimeout`.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Counts frames between enqueue and write, and wakes waiting senders
/// when the writer catches up.
struct PendingGate {
    pending: AtomicUsize,
    limit: usize,
    released: Notify,
}

impl PendingGate {
    fn new(limit: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            limit,
            released: Notify::new(),
        }
    }

    fn try_reserve(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self, frames: usize) {
        self.pending.fetch_sub(frames, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    fn is_full(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.limit
    }
}

/// Sending side of a connection's writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    gate: Arc<PendingGate>,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue an encoded frame, waiting up to the backpressure timeout if
    /// the writer has fallen behind.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.reserve().await?;

        self.tx.send(frame).await.map_err(|_| {
            self.gate.release(1);
            GroundlinkError::ConnectionClosed
        })
    }

    async fn reserve(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            // Register before checking so a release in between is not lost.
            let released = self.gate.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.gate.try_reserve() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(GroundlinkError::BackpressureTimeout);
            }
        }
    }

    /// Queue a frame only if that needs no waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        if !self.gate.try_reserve() {
            return Err(GroundlinkError::BackpressureTimeout);
        }

        self.tx.try_send(frame).map_err(|e| {
            self.gate.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => GroundlinkError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => GroundlinkError::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.gate.is_full()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.gate.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for one connection's write half.
///
/// The task exits when `close` fires (after draining queued frames), when
/// every handle is dropped, or on the first write error. A write error also
/// fires `close` so the read side of the connection winds down too.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    close: CloseSignal,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let gate = Arc::new(PendingGate::new(config.max_pending_frames));

    let handle = WriterHandle {
        tx,
        gate: gate.clone(),
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, &gate, &close).await;
        if let Err(e) = &result {
            tracing::warn!("Writer task failed: {}", e);
            close.fire();
        }
        result
    });

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    gate: &PendingGate,
    close: &CloseSignal,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let closing = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    batch.push(frame);
                    false
                }
                None => break,
            },
            _ = close.wait() => true,
        };

        // After a close, everything already queued still goes out.
        let limit = if closing { usize::MAX } else { MAX_BATCH_SIZE };
        while batch.len() < limit {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        gate.release(batch.len());
        batch.clear();

        if closing {
            break;
        }
    }

    // Best effort: the peer may already be gone.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write every frame in `batch` with vectored writes, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = unwritten_slices(batch, written);
        match writer.write_vectored(&slices).await? {
            0 => {
                return Err(GroundlinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection accepted no bytes",
                )))
            }
            n => written += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering the part of `batch` after the first `skip` bytes.
fn unwritten_slices(batch: &[Bytes], mut skip: usize) -> Vec<IoSlice<'_>> {
    batch
        .iter()
        .filter_map(|frame| {
            if skip >= frame.len() {
                skip -= frame.len();
                None
            } else {
                let slice = IoSlice::new(&frame[skip..]);
                skip = 0;
                Some(slice)
            }
        })
        .collect()
}
