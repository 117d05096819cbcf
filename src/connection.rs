//! A single live connection and its read loop.
//!
//! Every connection, on either side, runs the same pipeline:
//!
//! ```text
//! socket ─► read ─► FrameBuffer ─► Router::route(payload, origin) ─► handler
//!                                                                     │
//! socket ◄─ writer task ◄─ ConnectionHandle::send ◄───────────────────┘
//! ```
//!
//! Payloads from one connection are routed strictly in arrival order: each
//! route future is awaited before the next payload is looked at. Decode
//! failures, unhandled types and handler errors are logged and the
//! connection stays open. Read errors and corrupt length prefixes end it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::Envelope;
use crate::error::{GroundlinkError, Result};
use crate::handler::Router;
use crate::protocol::{FrameBuffer, MAX_PAYLOAD_LEN};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default read buffer size (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Identifier of a connection, unique within the client or server that
/// created it. Ids increase monotonically, so ordering by id is accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-shot, idempotent latch shared between a connection's tasks.
#[derive(Clone)]
pub(crate) struct CloseSignal(Arc<watch::Sender<bool>>);

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Fire the latch. Returns true only for the call that fired it.
    pub(crate) fn fire(&self) -> bool {
        self.0.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the latch has fired (immediately if it already has).
    pub(crate) async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Closed locally via [`ConnectionHandle::close`].
    Closed,
    /// The remote side closed the stream.
    RemoteClosed,
    /// A read error or protocol violation ended the connection.
    Failed(String),
}

/// Tunables for a spawned connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub read_buffer_size: usize,
    pub max_payload: usize,
    pub writer: WriterConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload: MAX_PAYLOAD_LEN,
            writer: WriterConfig::default(),
        }
    }
}

struct Inner {
    id: ConnectionId,
    peer: String,
    writer: WriterHandle,
    /// Fired by `close()`, by a failed write, or when the read loop ends.
    close: CloseSignal,
    /// Fired once the read loop has fully exited.
    done: CloseSignal,
    role: RwLock<Option<String>>,
}

/// Handle to a live connection: the origin passed to every handler.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Human-readable peer address.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Role declared during the handshake, if any.
    pub fn role(&self) -> Option<String> {
        self.inner.role.read().clone()
    }

    /// Tag the connection with a role.
    pub fn set_role(&self, role: impl Into<String>) {
        *self.inner.role.write() = Some(role.into());
    }

    /// Encode `{type, message}` and queue it on this connection.
    ///
    /// # Errors
    ///
    /// `NotConnected` once the connection is closing or closed,
    /// `MessageTooLong` if the encoded message does not fit the prefix.
    pub async fn send<T: Serialize + ?Sized>(&self, type_path: &str, message: &T) -> Result<()> {
        if self.is_closed() {
            return Err(GroundlinkError::NotConnected);
        }

        let frame = Envelope::encode(type_path, message)?;
        debug!(connection = %self.id(), type_path, "Sending message");
        self.send_frame(frame).await
    }

    /// Queue an already-encoded frame.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(GroundlinkError::NotConnected);
        }

        self.inner.writer.send(frame).await
    }

    /// Queue an encoded frame without waiting for queue space.
    ///
    /// # Errors
    ///
    /// `BackpressureTimeout` if the queue is full.
    pub fn try_send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(GroundlinkError::NotConnected);
        }

        self.inner.writer.try_send(frame)
    }

    /// True while the outbound queue is at its limit.
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }

    /// Close the connection. Frames already queued are still written.
    ///
    /// Idempotent: closing an already-closed connection is a no-op.
    pub fn close(&self) {
        if self.inner.close.fire() {
            debug!(connection = %self.id(), "Closing connection");
        }
    }

    /// True once closing has started.
    pub fn is_closed(&self) -> bool {
        self.inner.close.is_fired() || self.inner.writer.is_closed()
    }

    /// Resolves once the connection has fully shut down.
    pub async fn closed(&self) {
        self.inner.done.wait().await
    }

    /// Number of frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.inner.writer.pending_count()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("role", &self.role())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Start the writer task and read loop for `stream`.
///
/// The returned join handle resolves with how the connection ended, after
/// the close signal has fired and [`ConnectionHandle::closed`] has resolved.
pub(crate) fn spawn_connection<S, R>(
    stream: S,
    id: ConnectionId,
    peer: String,
    router: Arc<R>,
    options: ConnectionOptions,
) -> (ConnectionHandle, JoinHandle<ConnectionEnd>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: Router + ?Sized,
{
    let (reader, write_half) = tokio::io::split(stream);

    let close = CloseSignal::new();
    let (writer, _writer_task) = spawn_writer_task(write_half, options.writer.clone(), close.clone());

    let handle = ConnectionHandle {
        inner: Arc::new(Inner {
            id,
            peer,
            writer,
            close,
            done: CloseSignal::new(),
            role: RwLock::new(None),
        }),
    };

    let loop_handle = handle.clone();
    let task = tokio::spawn(async move {
        let end = read_loop(reader, router, &loop_handle, &options).await;

        loop_handle.inner.close.fire();
        loop_handle.inner.done.fire();

        match &end {
            ConnectionEnd::Closed => info!(connection = %loop_handle.id(), "Connection closed"),
            ConnectionEnd::RemoteClosed => {
                info!(connection = %loop_handle.id(), "Connection closed by peer")
            }
            ConnectionEnd::Failed(reason) => {
                error!(connection = %loop_handle.id(), "Connection failed: {}", reason)
            }
        }

        end
    });

    (handle, task)
}

async fn read_loop<Rd, R>(
    mut reader: Rd,
    router: Arc<R>,
    handle: &ConnectionHandle,
    options: &ConnectionOptions,
) -> ConnectionEnd
where
    Rd: AsyncRead + Unpin,
    R: Router + ?Sized,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(options.max_payload);
    let mut buf = vec![0u8; options.read_buffer_size.max(1)];
    let mut payloads = Vec::new();

    loop {
        let n = tokio::select! {
            _ = handle.inner.close.wait() => return ConnectionEnd::Closed,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return ConnectionEnd::RemoteClosed,
                Ok(n) => n,
                Err(e) => return ConnectionEnd::Failed(e.to_string()),
            },
        };

        // Frames that completed ahead of a bad prefix are still routed.
        let framing = frame_buffer.add_chunk(&buf[..n], |payload| payloads.push(payload));

        for payload in payloads.drain(..) {
            if handle.is_closed() {
                return ConnectionEnd::Closed;
            }
            route_one(router.as_ref(), &payload, handle).await;
        }

        if let Err(e) = framing {
            return ConnectionEnd::Failed(e.to_string());
        }
    }
}

/// Route one payload, logging anything that goes wrong.
async fn route_one<R>(router: &R, payload: &[u8], handle: &ConnectionHandle)
where
    R: Router + ?Sized,
{
    match router.route(payload, handle.clone()).await {
        Ok(()) => {}
        Err(GroundlinkError::MalformedMessage(reason)) => {
            warn!(connection = %handle.id(), "Dropping malformed message: {}", reason);
        }
        Err(GroundlinkError::UnhandledType(type_path)) => {
            warn!(connection = %handle.id(), "Unhandled message type: '{}'", type_path);
        }
        Err(GroundlinkError::RoleRefused(role)) => {
            warn!(connection = %handle.id(), "Refused role '{}'", role);
        }
        Err(e) => {
            error!(connection = %handle.id(), "Handler error: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handler::Dispatcher;
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use crate::codec::decode;
    use crate::protocol::{build_frame, LENGTH_PREFIX_SIZE};

    /// Spawn a connection over an in-memory pipe; returns the far end.
    pub(crate) fn spawn_test_connection(
        id: u64,
        dispatcher: Dispatcher,
    ) -> (ConnectionHandle, DuplexStream, JoinHandle<ConnectionEnd>) {
        let (near, far) = duplex(64 * 1024);
        let (handle, task) = spawn_connection(
            near,
            ConnectionId::new(id),
            format!("test-{}", id),
            Arc::new(dispatcher),
            ConnectionOptions::default(),
        );
        (handle, far, task)
    }

    /// Read one frame from the far end and decode it.
    pub(crate) async fn read_envelope(far: &mut DuplexStream) -> Envelope {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        far.read_exact(&mut prefix).await.unwrap();
        let len = crate::protocol::parse_length_prefix(&prefix).unwrap();
        let mut payload = vec![0u8; len];
        far.read_exact(&mut payload).await.unwrap();
        decode(&payload).unwrap()
    }

    #[test]
    fn test_close_signal_fires_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_close_signal_wait_after_fire() {
        let signal = CloseSignal::new();
        signal.fire();
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("count", move |n: u32, _origin| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(n);
                Ok(())
            }
        });

        let (_handle, mut far, _task) = spawn_test_connection(1, dispatcher);

        let mut bytes = Vec::new();
        for n in 0..20u32 {
            bytes.extend_from_slice(&crate::codec::encode("count", &n).unwrap());
        }
        // Deliver in awkward chunk sizes.
        for chunk in bytes.chunks(7) {
            far.write_all(chunk).await.unwrap();
        }

        for expected in 0..20u32 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_handler_replies_on_origin() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("time.request", |_: Value, origin: ConnectionHandle| async move {
            origin.send("time", &json!({"type": "data", "time": 42.0})).await
        });

        let (_handle, mut far, _task) = spawn_test_connection(1, dispatcher);

        far.write_all(&crate::codec::encode("time", &json!({"type": "request"})).unwrap())
            .await
            .unwrap();

        let reply = read_envelope(&mut far).await;
        assert_eq!(reply.type_path(), "time.data");
        assert_eq!(reply.message(), &json!({"time": 42.0}));
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_close_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("ok", move |_: Value, _origin| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        });
        dispatcher.register("boom", |_: Value, _origin| async move {
            Err(GroundlinkError::Transport("handler failed".into()))
        });

        let (handle, mut far, _task) = spawn_test_connection(1, dispatcher);

        far.write_all(&build_frame(b"{not json").unwrap()).await.unwrap();
        far.write_all(&crate::codec::encode("nobody", &Value::Null).unwrap())
            .await
            .unwrap();
        far.write_all(&crate::codec::encode("boom", &Value::Null).unwrap())
            .await
            .unwrap();
        far.write_all(&crate::codec::encode("ok", &Value::Null).unwrap())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(()));
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_remote_close_ends_connection() {
        let (handle, far, task) = spawn_test_connection(1, Dispatcher::new());

        drop(far);

        assert_eq!(task.await.unwrap(), ConnectionEnd::RemoteClosed);
        assert!(handle.is_closed());
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_invalid_prefix_fails_connection() {
        let (_handle, mut far, task) = spawn_test_connection(1, Dispatcher::new());

        far.write_all(b"garbage!").await.unwrap();

        assert!(matches!(task.await.unwrap(), ConnectionEnd::Failed(_)));
    }

    #[tokio::test]
    async fn test_frame_ahead_of_bad_prefix_is_routed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("note", move |text: String, _origin| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(text);
                Ok(())
            }
        });

        let (_handle, mut far, task) = spawn_test_connection(1, dispatcher);

        let mut chunk = crate::codec::encode("note", "good").unwrap().to_vec();
        chunk.extend_from_slice(b"garbage!");
        far.write_all(&chunk).await.unwrap();

        assert!(matches!(task.await.unwrap(), ConnectionEnd::Failed(_)));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_send() {
        let (handle, _far, task) = spawn_test_connection(1, Dispatcher::new());

        handle.close();
        handle.close();

        assert_eq!(task.await.unwrap(), ConnectionEnd::Closed);

        let result = handle.send("ping", &Value::Null).await;
        assert!(matches!(result, Err(GroundlinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_role_tagging() {
        let (handle, _far, _task) = spawn_test_connection(7, Dispatcher::new());

        assert_eq!(handle.role(), None);
        handle.set_role("flight-view");
        assert_eq!(handle.role().as_deref(), Some("flight-view"));
        assert_eq!(handle.id(), ConnectionId::new(7));
        assert_eq!(handle.id().to_string(), "#7");
    }
}
