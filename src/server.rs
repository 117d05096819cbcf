//! Server: accept loop and the live connection set.
//!
//! Each accepted stream gets its own read loop and writer task (see
//! [`crate::connection`]) and is tracked in a [`ConnectionSet`] until it
//! ends. Removal is eager: a connection leaves the set as soon as its read
//! loop exits, before `ServerEvent::Disconnected` is published.
//!
//! # Example
//!
//! ```no_run
//! use groundlink::{Endpoint, Server};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> groundlink::Result<()> {
//!     let server = Server::builder(Endpoint::tcp("127.0.0.1:4000"))
//!         .handle_raw("ping", |_: Value, origin| async move {
//!             origin.send("ping", &json!({})).await
//!         })
//!         .bind()
//!         .await?;
//!
//!     server.broadcast("mission", &json!({"type": "data"})).await?;
//!     server.stopped().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::codec::Envelope;
use crate::connection::{
    spawn_connection, CloseSignal, ConnectionEnd, ConnectionHandle, ConnectionId,
    ConnectionOptions, DEFAULT_READ_BUFFER_SIZE,
};
use crate::error::{GroundlinkError, Result};
use crate::handler::{BoxFuture, Dispatcher, HandlerResult, RoleRouter, Router};
use crate::protocol::MAX_PAYLOAD_LEN;
use crate::transport::{Endpoint, Listener};
use crate::writer::WriterConfig;

/// Default capacity of the server event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Refuse connections beyond this many. `None` is unlimited.
    pub max_connections: Option<usize>,
    /// Socket read buffer size per connection.
    pub read_buffer_size: usize,
    /// Largest accepted inbound payload.
    pub max_payload: usize,
    /// Outbound queue settings per connection.
    pub writer: WriterConfig,
    /// Capacity of the [`ServerEvent`] channel.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload: MAX_PAYLOAD_LEN,
            writer: WriterConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ServerConfig {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            read_buffer_size: self.read_buffer_size,
            max_payload: self.max_payload,
            writer: self.writer.clone(),
        }
    }
}

/// Lifecycle notifications published by a [`Server`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and added to the set.
    Connected { id: ConnectionId, peer: String },
    /// A connection ended and was removed from the set.
    Disconnected { id: ConnectionId, end: ConnectionEnd },
    /// Accepting failed.
    Error { message: String },
}

/// Per-target outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued on, in broadcast order.
    pub delivered: Vec<ConnectionId>,
    /// Connections that could not take the frame, with the reason.
    pub failed: Vec<(ConnectionId, String)>,
}

impl BroadcastReport {
    /// True if every target took the frame.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of targets attempted.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Ordered set of live connections.
///
/// Keyed by monotonically increasing [`ConnectionId`], so iteration and
/// broadcast order is accept order.
#[derive(Default)]
pub struct ConnectionSet {
    connections: RwLock<BTreeMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id.
    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn insert(&self, handle: ConnectionHandle) {
        self.connections.write().insert(handle.id(), handle);
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.write().remove(&id)
    }

    /// Look up a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of the live connections, in accept order.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    /// Connections currently tagged with `role`, in accept order.
    pub fn with_role(&self, role: &str) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .values()
            .filter(|c| c.role().as_deref() == Some(role))
            .cloned()
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// True if no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Encode once and queue the frame on every live connection.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        type_path: &str,
        message: &T,
    ) -> Result<BroadcastReport> {
        let frame = Envelope::encode(type_path, message)?;
        Ok(self.broadcast_frame(frame).await)
    }

    /// Queue an encoded frame on every live connection.
    pub async fn broadcast_frame(&self, frame: Bytes) -> BroadcastReport {
        self.broadcast_frame_to(frame, |_| true).await
    }

    /// Queue an encoded frame on every live connection `filter` accepts.
    ///
    /// Every target is queued at once, so one slow peer does not delay the
    /// others. A failure on one connection is recorded and does not stop
    /// delivery to the rest. The report lists connections in accept order.
    pub async fn broadcast_frame_to<F>(&self, frame: Bytes, filter: F) -> BroadcastReport
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        let targets: Vec<ConnectionHandle> =
            self.snapshot().into_iter().filter(|c| filter(c)).collect();

        // Concurrent, so a peer waiting out backpressure holds up nobody else.
        let outcomes = join_all(targets.iter().map(|target| target.send_frame(frame.clone()))).await;

        let mut report = BroadcastReport::default();
        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(target.id()),
                Err(e) => {
                    warn!(connection = %target.id(), "Broadcast delivery failed: {}", e);
                    report.failed.push((target.id(), e.to_string()));
                }
            }
        }

        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Unicast to one tracked connection.
    ///
    /// # Errors
    ///
    /// `UnknownConnection` if `id` is not in the set.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        id: ConnectionId,
        type_path: &str,
        message: &T,
    ) -> Result<()> {
        let target = self.get(id).ok_or(GroundlinkError::UnknownConnection(id))?;
        target.send(type_path, message).await
    }

    fn close_all(&self) {
        for connection in self.snapshot() {
            connection.close();
        }
    }
}

/// Hook run for every accepted connection.
pub type AcceptHook = Arc<dyn Fn(ConnectionHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builder for configuring and binding a [`Server`].
pub struct ServerBuilder {
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    role_routing: bool,
    config: ServerConfig,
    connections: Option<Arc<ConnectionSet>>,
    on_accept: Option<AcceptHook>,
}

impl ServerBuilder {
    /// Create a new server builder listening on `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            dispatcher: Dispatcher::new(),
            role_routing: false,
            config: ServerConfig::default(),
            connections: None,
            on_accept: None,
        }
    }

    /// Register a typed handler for a type path.
    pub fn handle<F, T, Fut>(mut self, type_path: &str, handler: F) -> Self
    where
        F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.register(type_path, handler);
        self
    }

    /// Register a handler that receives the body as raw JSON.
    pub fn handle_raw<F, Fut>(mut self, type_path: &str, handler: F) -> Self
    where
        F: Fn(Value, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.register_raw(type_path, handler);
        self
    }

    /// Use a pre-populated dispatcher, replacing any handlers added so far.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Route by connection role: `role.type` first, then `all.type`.
    pub fn role_routing(mut self, enabled: bool) -> Self {
        self.role_routing = enabled;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Refuse connections beyond `limit`.
    ///
    /// Default: unlimited
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = Some(limit);
        self
    }

    /// Set the per-connection read buffer size.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the maximum pending frames per connection.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Track connections in a set shared with the caller, so handlers
    /// registered before binding can reach other connections.
    pub fn connections(mut self, connections: Arc<ConnectionSet>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Run `hook` for every accepted connection.
    pub fn on_accept<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_accept = Some(Arc::new(
            move |handle: ConnectionHandle| -> BoxFuture<'static, Result<()>> {
                Box::pin(hook(handle))
            },
        ));
        self
    }

    /// Bind the endpoint and start accepting.
    pub async fn bind(self) -> Result<Server> {
        let router: Arc<dyn Router> = if self.role_routing {
            Arc::new(RoleRouter::new(self.dispatcher))
        } else {
            Arc::new(self.dispatcher)
        };

        let listener = self.endpoint.bind().await?;
        let local_endpoint = listener.local_endpoint()?;
        let local_addr = listener.local_addr();

        let (events, _rx) = broadcast::channel(self.config.event_capacity.max(1));

        let inner = Arc::new(ServerInner {
            local_endpoint,
            local_addr,
            connections: self.connections.unwrap_or_default(),
            events,
            stop: CloseSignal::new(),
            stopped: CloseSignal::new(),
            accept_task: Mutex::new(None),
        });

        info!(endpoint = %inner.local_endpoint, "Server listening");

        let task = tokio::spawn(accept_loop(
            listener,
            router,
            self.config,
            self.on_accept,
            inner.clone(),
        ));
        *inner.accept_task.lock() = Some(task);

        Ok(Server { inner })
    }
}

struct ServerInner {
    local_endpoint: Endpoint,
    local_addr: Option<SocketAddr>,
    connections: Arc<ConnectionSet>,
    events: broadcast::Sender<ServerEvent>,
    stop: CloseSignal,
    stopped: CloseSignal,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServerInner {
    fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// A listening server.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder(endpoint: Endpoint) -> ServerBuilder {
        ServerBuilder::new(endpoint)
    }

    /// The endpoint actually bound.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.inner.local_endpoint
    }

    /// Bound TCP address, for TCP servers.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Live connections in accept order.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.connections.snapshot()
    }

    /// Look up one live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.connections.get(id)
    }

    /// The underlying connection set.
    pub fn connection_set(&self) -> &Arc<ConnectionSet> {
        &self.inner.connections
    }

    /// Encode once and send to every live connection.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        type_path: &str,
        message: &T,
    ) -> Result<BroadcastReport> {
        self.inner.connections.broadcast(type_path, message).await
    }

    /// Unicast to one live connection.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        id: ConnectionId,
        type_path: &str,
        message: &T,
    ) -> Result<()> {
        self.inner.connections.send(id, type_path, message).await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn stop(&self) {
        if self.inner.stop.fire() {
            info!(endpoint = %self.inner.local_endpoint, "Stopping server");
            self.inner.connections.close_all();
        }
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_fired()
    }

    /// Resolves once the accept loop has exited and the listener is closed.
    pub async fn stopped(&self) {
        self.inner.stopped.wait().await
    }

    /// Stop and wait for the accept loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Accept loop panicked: {}", e);
            }
        }
        self.stopped().await;
    }
}

async fn accept_loop(
    listener: Listener,
    router: Arc<dyn Router>,
    config: ServerConfig,
    on_accept: Option<AcceptHook>,
    inner: Arc<ServerInner>,
) {
    let options = config.connection_options();

    loop {
        let accepted = tokio::select! {
            _ = inner.stop.wait() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(endpoint = %inner.local_endpoint, "Accept failed: {}", e);
                inner.publish(ServerEvent::Error {
                    message: e.to_string(),
                });
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        if let Some(max) = config.max_connections {
            if inner.connections.len() >= max {
                warn!(peer = %peer, max, "Refusing connection: limit reached");
                drop(stream);
                continue;
            }
        }

        let id = inner.connections.next_id();
        let (handle, task) = spawn_connection(stream, id, peer.clone(), router.clone(), options.clone());
        inner.connections.insert(handle.clone());

        info!(connection = %id, peer = %peer, "Connection accepted");
        inner.publish(ServerEvent::Connected { id, peer });

        let watcher = inner.clone();
        tokio::spawn(async move {
            let end = task
                .await
                .unwrap_or_else(|e| ConnectionEnd::Failed(e.to_string()));
            watcher.connections.remove(id);
            watcher.publish(ServerEvent::Disconnected { id, end });
        });

        if let Some(hook) = &on_accept {
            let hook = hook.clone();
            tokio::spawn(async move {
                let id = handle.id();
                if let Err(e) = hook(handle).await {
                    warn!(connection = %id, "Accept hook failed: {}", e);
                }
            });
        }
    }

    drop(listener);
    inner.connections.close_all();
    inner.stopped.fire();
    debug!(endpoint = %inner.local_endpoint, "Accept loop exited");
}
