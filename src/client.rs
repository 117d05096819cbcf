//! Client builder and connection lifecycle.
//!
//! The [`ClientBuilder`] registers handlers and tunes the connection; the
//! [`Client`] drives the lifecycle:
//! 1. Connect to the endpoint, retrying while nobody is listening
//! 2. Read frames and dispatch them to handlers
//! 3. Report the terminal state once the connection ends
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Closed | Errored
//!                  ▲      │
//!                  └──────┘  not listening: sleep reconnect_delay, retry
//! ```
//!
//! # Example
//!
//! ```no_run
//! use groundlink::{Client, Endpoint};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> groundlink::Result<()> {
//!     let client = Client::builder(Endpoint::tcp("127.0.0.1:4000"))
//!         .handle_raw("connect.request", |_: Value, origin| async move {
//!             origin
//!                 .send("connect", &json!({"type": "data", "program": "flight-view"}))
//!                 .await
//!         })
//!         .connect()?;
//!
//!     client.wait_connected().await?;
//!     client.closed().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::{
    spawn_connection, CloseSignal, ConnectionEnd, ConnectionHandle, ConnectionId,
    ConnectionOptions, DEFAULT_READ_BUFFER_SIZE,
};
use crate::error::{GroundlinkError, Result};
use crate::handler::{Dispatcher, HandlerResult};
use crate::protocol::MAX_PAYLOAD_LEN;
use crate::transport::{BoxedStream, Endpoint};
use crate::writer::WriterConfig;

/// Default delay between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called.
    Disconnected,
    /// Attempting to connect, or waiting to retry.
    Connecting,
    /// Connected; `send` is allowed.
    Connected,
    /// Closed locally or by the remote side.
    Closed,
    /// Ended by a non-retryable failure.
    Errored,
}

impl ConnectionState {
    /// True for `Closed` and `Errored`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay before retrying when the endpoint is not listening.
    pub reconnect_delay: Duration,
    /// Give up after this many attempts. `None` retries forever.
    pub max_connect_attempts: Option<u32>,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Largest accepted inbound payload.
    pub max_payload: usize,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_connect_attempts: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload: MAX_PAYLOAD_LEN,
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            read_buffer_size: self.read_buffer_size,
            max_payload: self.max_payload,
            writer: self.writer.clone(),
        }
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// Handlers are registered here, before connecting; the dispatcher is
/// frozen once the client is built.
pub struct ClientBuilder {
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder for `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            dispatcher: Dispatcher::new(),
            config: ClientConfig::default(),
        }
    }

    /// Register a typed handler for a flattened type path.
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

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the delay between connection attempts.
    ///
    /// Default: 1s
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Bound the number of connection attempts.
    ///
    /// Default: unbounded
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connect_attempts = Some(attempts);
        self
    }

    /// Set the socket read buffer size.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the maximum pending frames for backpressure.
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

    /// Build the client without connecting.
    pub fn build(self) -> Client {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);

        Client {
            inner: Arc::new(ClientInner {
                endpoint: self.endpoint,
                router: Arc::new(self.dispatcher),
                config: self.config,
                state,
                connection: RwLock::new(None),
                attempts: AtomicU32::new(0),
                failure: Mutex::new(None),
                started: AtomicBool::new(false),
                stop: CloseSignal::new(),
            }),
        }
    }

    /// Build the client and start connecting.
    pub fn connect(self) -> Result<Client> {
        let client = self.build();
        client.connect()?;
        Ok(client)
    }
}

/// Why a client ended up `Errored`.
#[derive(Debug, Clone)]
enum Failure {
    Refused { attempts: u32 },
    Transport(String),
}

struct ClientInner {
    endpoint: Endpoint,
    router: Arc<Dispatcher>,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    connection: RwLock<Option<ConnectionHandle>>,
    attempts: AtomicU32,
    failure: Mutex<Option<Failure>>,
    started: AtomicBool,
    stop: CloseSignal,
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });

        if changed {
            info!(endpoint = %self.endpoint, state = ?next, "Client state changed");
        }
    }

    fn fail(&self, failure: Failure) {
        *self.failure.lock() = Some(failure);
        self.set_state(ConnectionState::Errored);
    }

    fn failure_error(&self) -> GroundlinkError {
        let failure = self.failure.lock().clone();
        match failure {
            Some(Failure::Refused { attempts }) => GroundlinkError::ConnectionRefused {
                endpoint: self.endpoint.to_string(),
                attempts,
            },
            Some(Failure::Transport(reason)) => GroundlinkError::Transport(reason),
            None => GroundlinkError::ConnectionClosed,
        }
    }
}

/// A connection to a server, with automatic retry while it is not listening.
///
/// Cheaply cloneable. One client drives one session: once it is `Closed`
/// or `Errored`, build a new one to connect again.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(endpoint: Endpoint) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Start connecting in the background. Returns immediately.
    ///
    /// Calling this again while connecting or connected is a no-op.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the client was already disconnected.
    pub fn connect(&self) -> Result<()> {
        if self.inner.stop.is_fired() {
            return Err(GroundlinkError::ConnectionClosed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tokio::spawn(run_lifecycle(self.inner.clone()));
        Ok(())
    }

    /// Wait until the client is connected.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` once a bounded retry budget runs out, `Transport`
    /// for a non-retryable failure, `ConnectionClosed` if the session ended.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| *s == ConnectionState::Connected || s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| GroundlinkError::ConnectionClosed)?;

        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Errored => Err(self.inner.failure_error()),
            _ => Err(GroundlinkError::ConnectionClosed),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connection attempts made so far.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// The endpoint this client connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// The live connection, while connected.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.inner.connection.read().clone()
    }

    /// Description of the failure that moved the client to `Errored`.
    pub fn last_error(&self) -> Option<String> {
        let failed = self.inner.failure.lock().is_some();
        failed.then(|| self.inner.failure_error().to_string())
    }

    /// Send `{type, message}` to the server.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the client is `Connected`.
    pub async fn send<T: Serialize + ?Sized>(&self, type_path: &str, message: &T) -> Result<()> {
        let connection = match (self.state(), self.connection()) {
            (ConnectionState::Connected, Some(connection)) => connection,
            _ => return Err(GroundlinkError::NotConnected),
        };

        connection.send(type_path, message).await
    }

    /// Stop connecting or close the connection. Idempotent.
    pub fn disconnect(&self) {
        if !self.inner.stop.fire() {
            return;
        }

        debug!(endpoint = %self.inner.endpoint, "Disconnect requested");

        // A lifecycle task that never started cannot report the transition.
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.set_state(ConnectionState::Closed);
        }
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    /// Resolves once the client reaches `Closed` or `Errored`.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        state
    }
}

async fn run_lifecycle(inner: Arc<ClientInner>) {
    let Some((stream, attempt)) = establish(&inner).await else {
        return;
    };

    let (connection, task) = spawn_connection(
        stream,
        ConnectionId::new(u64::from(attempt)),
        inner.endpoint.to_string(),
        inner.router.clone(),
        inner.config.connection_options(),
    );

    *inner.connection.write() = Some(connection.clone());
    inner.set_state(ConnectionState::Connected);

    // `disconnect()` may have fired before the handle was published.
    let stopped = tokio::select! {
        _ = inner.stop.wait() => true,
        _ = connection.closed() => false,
    };
    if stopped {
        connection.close();
    }

    let end = task
        .await
        .unwrap_or_else(|e| ConnectionEnd::Failed(e.to_string()));
    *inner.connection.write() = None;

    match end {
        ConnectionEnd::Failed(reason) if !stopped => inner.fail(Failure::Transport(reason)),
        _ => inner.set_state(ConnectionState::Closed),
    }
}

/// Connect, retrying while the endpoint is not listening.
///
/// Returns `None` if the client was stopped or failed; the state has
/// already been updated in that case.
async fn establish(inner: &ClientInner) -> Option<(BoxedStream, u32)> {
    loop {
        if inner.stop.is_fired() {
            inner.set_state(ConnectionState::Closed);
            return None;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        inner.set_state(ConnectionState::Connecting);
        debug!(endpoint = %inner.endpoint, attempt, "Connecting");

        let result = tokio::select! {
            _ = inner.stop.wait() => {
                inner.set_state(ConnectionState::Closed);
                return None;
            }
            result = inner.endpoint.connect() => result,
        };

        match result {
            Ok(stream) => return Some((stream, attempt)),
            Err(e) if inner.endpoint.is_not_listening(&e) => {
                if inner
                    .config
                    .max_connect_attempts
                    .is_some_and(|max| attempt >= max)
                {
                    warn!(endpoint = %inner.endpoint, attempt, "Giving up: endpoint not listening");
                    inner.fail(Failure::Refused { attempts: attempt });
                    return None;
                }

                debug!(
                    endpoint = %inner.endpoint,
                    "Not listening ({}), retrying in {:?}",
                    e,
                    inner.config.reconnect_delay
                );

                tokio::select! {
                    _ = inner.stop.wait() => {
                        inner.set_state(ConnectionState::Closed);
                        return None;
                    }
                    _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
                }
            }
            Err(e) => {
                error!(endpoint = %inner.endpoint, "Connection failed: {}", e);
                inner.fail(Failure::Transport(e.to_string()));
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::transport::generate_pipe_path;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// An address nothing is listening on.
    async fn dead_tcp_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::tcp(addr.to_string())
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = Client::builder(Endpoint::tcp("127.0.0.1:1")).build();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.send("ping", &json!({})).await.unwrap_err();
        assert!(matches!(err, GroundlinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let client = Client::builder(Endpoint::tcp("127.0.0.1:1")).build();

        client.disconnect();
        client.disconnect();

        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.connect(),
            Err(GroundlinkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bounded_retries_exhausted() {
        let client = Client::builder(dead_tcp_endpoint().await)
            .reconnect_delay(Duration::from_millis(10))
            .max_connect_attempts(3)
            .connect()
            .unwrap();

        let err = client.wait_connected().await.unwrap_err();

        assert!(matches!(
            err,
            GroundlinkError::ConnectionRefused { attempts: 3, .. }
        ));
        assert_eq!(client.state(), ConnectionState::Errored);
        assert_eq!(client.connect_attempts(), 3);
        assert!(client.last_error().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_ipc_path_is_retried() {
        let client = Client::builder(Endpoint::ipc(generate_pipe_path("absent")))
            .reconnect_delay(Duration::from_millis(10))
            .max_connect_attempts(2)
            .connect()
            .unwrap();

        let err = client.wait_connected().await.unwrap_err();
        assert!(matches!(
            err,
            GroundlinkError::ConnectionRefused { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_retry_loop() {
        let client = Client::builder(dead_tcp_endpoint().await)
            .reconnect_delay(Duration::from_secs(60))
            .connect()
            .unwrap();

        let mut states = client.subscribe_state();
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        client.disconnect();
        assert_eq!(client.closed().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_dispatch_and_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp(listener.local_addr().unwrap().to_string());

        let client = Client::builder(endpoint)
            .handle_raw("connect.request", |_: Value, origin| async move {
                origin
                    .send("connect", &json!({"type": "data", "program": "flight-view"}))
                    .await
            })
            .connect()
            .unwrap();

        let (mut server_side, _) = listener.accept().await.unwrap();
        client.wait_connected().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        server_side
            .write_all(&encode("connect", &json!({"type": "request"})).unwrap())
            .await
            .unwrap();

        let mut prefix = [0u8; 8];
        server_side.read_exact(&mut prefix).await.unwrap();
        let len = crate::protocol::parse_length_prefix(&prefix).unwrap();
        let mut payload = vec![0u8; len];
        server_side.read_exact(&mut payload).await.unwrap();

        let reply = crate::codec::decode(&payload).unwrap();
        assert_eq!(reply.type_path(), "connect.data");
        assert_eq!(reply.message(), &json!({"program": "flight-view"}));

        client.send("ping", &json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_close_moves_to_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp(listener.local_addr().unwrap().to_string());

        let client = Client::builder(endpoint).connect().unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        client.wait_connected().await.unwrap();

        drop(server_side);

        assert_eq!(client.closed().await, ConnectionState::Closed);
        assert!(matches!(
            client.send("ping", &json!({})).await,
            Err(GroundlinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_stream_moves_to_errored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp(listener.local_addr().unwrap().to_string());

        let client = Client::builder(endpoint).connect().unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        client.wait_connected().await.unwrap();

        server_side.write_all(b"xxxxxxxx").await.unwrap();

        assert_eq!(client.closed().await, ConnectionState::Errored);
        assert!(client.last_error().unwrap().contains("Invalid length prefix"));
    }
}
