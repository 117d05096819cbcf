//! Host server: the role-aware server peers hand telemetry through.
//!
//! On accept the host asks the peer who it is:
//!
//! ```text
//! host → peer   {"type":"connect","message":{"type":"request"}}
//! peer → host   {"type":"connect","message":{"type":"data","program":"<role>"}}
//! ```
//!
//! The reply flattens to `connect.data`, which untagged connections route
//! to `all.connect.data`. Accepted peers are tagged with their role
//! and from then on route through `<role>.<type>` before `all.<type>`.
//!
//! | Role | Policy |
//! |---|---|
//! | `image-corrector` | one at a time, latest wins |
//! | `telemetry-sender` | one at a time, latest wins |
//! | `flight-view` | any number, only when listeners are allowed |
//!
//! Any other program gets `connect`/`{type:"refuse"}` and is closed.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::codec::Envelope;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{GroundlinkError, Result};
use crate::handler::{Dispatcher, Handler, HandlerResult, TypedHandler};
use crate::server::{BroadcastReport, ConnectionSet, Server, ServerConfig, ServerEvent};
use crate::store::{MemoryTelemetryStore, TelemetryStore};
use crate::transport::Endpoint;

/// Image-processing worker role.
pub const ROLE_IMAGE_CORRECTOR: &str = "image-corrector";
/// Telemetry source role.
pub const ROLE_TELEMETRY_SENDER: &str = "telemetry-sender";
/// GUI listener role.
pub const ROLE_FLIGHT_VIEW: &str = "flight-view";

/// Host server tunables.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Accept `flight-view` listeners.
    pub allow_listeners: bool,
    /// Underlying server settings.
    pub server: ServerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            allow_listeners: true,
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectData {
    program: String,
}

#[derive(Debug, Deserialize)]
struct ImageRequest {
    time: f64,
    number: Value,
}

#[derive(Debug, Serialize)]
struct TimeData {
    #[serde(rename = "type")]
    kind: &'static str,
    time: f64,
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Re-add `type` to a flattened body so it can be sent on.
fn with_kind(body: Value, kind: &str) -> Result<Value> {
    let mut object = match body {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        _ => return Err(GroundlinkError::malformed("expected an object body")),
    };
    object.insert("type".to_string(), Value::String(kind.to_string()));
    Ok(Value::Object(object))
}

struct HostState {
    allow_listeners: bool,
    connections: Arc<ConnectionSet>,
    store: Arc<dyn TelemetryStore>,
    image_corrector: RwLock<Option<ConnectionId>>,
    telemetry_sender: RwLock<Option<ConnectionId>>,
    pings: Mutex<HashMap<ConnectionId, VecDeque<f64>>>,
    last_ping_ms: Mutex<HashMap<ConnectionId, f64>>,
}

impl HostState {
    fn live(&self, slot: &RwLock<Option<ConnectionId>>) -> Option<ConnectionId> {
        let id = *slot.read();
        id.filter(|id| self.connections.get(*id).is_some())
    }

    fn forget(&self, id: ConnectionId) {
        self.pings.lock().remove(&id);
        self.last_ping_ms.lock().remove(&id);
        for slot in [&self.image_corrector, &self.telemetry_sender] {
            let mut slot = slot.write();
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }

    async fn on_connect_data(&self, data: ConnectData, origin: ConnectionHandle) -> Result<()> {
        let program = data.program.as_str();

        let slot = match program {
            ROLE_IMAGE_CORRECTOR => Some(&self.image_corrector),
            ROLE_TELEMETRY_SENDER => Some(&self.telemetry_sender),
            ROLE_FLIGHT_VIEW if self.allow_listeners => None,
            _ => {
                // Best effort; the peer is being dropped either way.
                let _ = origin.send("connect", &json!({"type": "refuse"})).await;
                origin.close();
                return Err(GroundlinkError::RoleRefused(program.to_string()));
            }
        };

        if let Some(slot) = slot {
            if let Some(previous) = slot.write().replace(origin.id()) {
                if previous != origin.id() {
                    info!(program, previous = %previous, connection = %origin.id(), "Replacing {}", program);
                }
            }
        }

        origin.set_role(program);
        self.pings.lock().entry(origin.id()).or_default();
        info!(connection = %origin.id(), program, "Peer identified");
        Ok(())
    }

    fn on_ping(&self, origin: &ConnectionHandle) {
        let sent = self
            .pings
            .lock()
            .get_mut(&origin.id())
            .and_then(VecDeque::pop_front);

        match sent {
            Some(sent) => {
                let rtt_ms = (unix_time() - sent) * 1000.0;
                self.last_ping_ms.lock().insert(origin.id(), rtt_ms);
                info!(connection = %origin.id(), rtt_ms, "Ping");
            }
            None => debug!(connection = %origin.id(), "Unsolicited ping"),
        }
    }

    async fn on_telemetry(&self, body: Value) -> Result<()> {
        self.store.insert(body.clone())?;

        let frame = Envelope::encode("telemetry", &with_kind(body, "data")?)?;
        self.connections
            .broadcast_frame_to(frame, |c| c.role().as_deref() == Some(ROLE_FLIGHT_VIEW))
            .await;
        Ok(())
    }

    async fn on_image_request(&self, request: ImageRequest, origin: ConnectionHandle) -> Result<()> {
        debug!(time = request.time, "Image telemetry requested");

        let Some(doc) = self.store.find_nearest(request.time)? else {
            warn!(time = request.time, "No telemetry available for image request");
            return Ok(());
        };

        let mut reply = with_kind(doc, "image-data")?;
        if let Value::Object(object) = &mut reply {
            object.insert("number".to_string(), request.number);
        }
        origin.send("telemetry", &reply).await
    }
}

fn register_host_handlers(dispatcher: &mut Dispatcher, state: &Arc<HostState>) {
    let s = state.clone();
    dispatcher.register("all.connect.data", move |data: ConnectData, origin| {
        let s = s.clone();
        async move { s.on_connect_data(data, origin).await }
    });

    dispatcher.register_raw("all.time.request", |_: Value, origin| async move {
        origin
            .send("time", &TimeData { kind: "data", time: unix_time() })
            .await
    });

    let s = state.clone();
    dispatcher.register_raw("all.ping", move |_: Value, origin| {
        let s = s.clone();
        async move {
            s.on_ping(&origin);
            Ok(())
        }
    });

    let s = state.clone();
    dispatcher.register_raw("telemetry-sender.telemetry.data", move |body: Value, _origin| {
        let s = s.clone();
        async move { s.on_telemetry(body).await }
    });

    let s = state.clone();
    dispatcher.register(
        "image-corrector.telemetry.image-request",
        move |request: ImageRequest, origin| {
            let s = s.clone();
            async move { s.on_image_request(request, origin).await }
        },
    );

    dispatcher.register_raw("image-corrector.image.alert", |alert: Value, origin| async move {
        info!(connection = %origin.id(), %alert, "Image alert");
        Ok(())
    });
}

/// Builder for a [`HostServer`].
pub struct HostServerBuilder {
    endpoint: Endpoint,
    config: HostConfig,
    store: Option<Arc<dyn TelemetryStore>>,
    extra: Vec<(String, Box<dyn Handler>)>,
}

impl HostServerBuilder {
    /// Create a builder listening on `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            config: HostConfig::default(),
            store: None,
            extra: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept `flight-view` listeners.
    ///
    /// Default: true
    pub fn allow_listeners(mut self, allow: bool) -> Self {
        self.config.allow_listeners = allow;
        self
    }

    /// Telemetry store. Default: a fresh [`MemoryTelemetryStore`].
    pub fn store(mut self, store: Arc<dyn TelemetryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an application handler under a role-qualified or `all.`
    /// path. Registered after the built-in handlers, so it can replace them.
    pub fn handle<F, T, Fut>(mut self, type_path: &str, handler: F) -> Self
    where
        F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.extra
            .push((type_path.to_string(), Box::new(TypedHandler::new(handler))));
        self
    }

    /// Bind and start accepting peers.
    pub async fn bind(self) -> Result<HostServer> {
        let connections = Arc::new(ConnectionSet::new());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTelemetryStore::new()));

        let state = Arc::new(HostState {
            allow_listeners: self.config.allow_listeners,
            connections: connections.clone(),
            store,
            image_corrector: RwLock::new(None),
            telemetry_sender: RwLock::new(None),
            pings: Mutex::new(HashMap::new()),
            last_ping_ms: Mutex::new(HashMap::new()),
        });

        let mut dispatcher = Dispatcher::new();
        register_host_handlers(&mut dispatcher, &state);
        for (type_path, handler) in self.extra {
            dispatcher.register_handler(&type_path, handler);
        }

        let server = Server::builder(self.endpoint)
            .config(self.config.server)
            .dispatcher(dispatcher)
            .role_routing(true)
            .connections(connections)
            .on_accept(|origin| async move {
                origin.send("connect", &json!({"type": "request"})).await
            })
            .bind()
            .await?;

        let mut events = server.subscribe();
        let watcher = state.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Disconnected { id, .. }) => watcher.forget(id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Host missed server events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(endpoint = %server.local_endpoint(), allow_listeners = state.allow_listeners, "Host server started");
        Ok(HostServer { server, state })
    }
}

/// Role-aware server for the ground station peers.
#[derive(Clone)]
pub struct HostServer {
    server: Server,
    state: Arc<HostState>,
}

impl HostServer {
    /// Create a host server builder.
    pub fn builder(endpoint: Endpoint) -> HostServerBuilder {
        HostServerBuilder::new(endpoint)
    }

    /// The underlying server.
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        self.server.local_endpoint()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// The live image corrector, if one has identified itself.
    pub fn image_corrector(&self) -> Option<ConnectionId> {
        self.state.live(&self.state.image_corrector)
    }

    /// The live telemetry sender, if one has identified itself.
    pub fn telemetry_sender(&self) -> Option<ConnectionId> {
        self.state.live(&self.state.telemetry_sender)
    }

    /// Connected `flight-view` listeners in accept order.
    pub fn listeners(&self) -> Vec<ConnectionHandle> {
        self.state.connections.with_role(ROLE_FLIGHT_VIEW)
    }

    /// The telemetry store handlers write to.
    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.state.store
    }

    /// Send to every `flight-view` listener.
    pub async fn broadcast_to_listeners<T: Serialize + ?Sized>(
        &self,
        type_path: &str,
        message: &T,
    ) -> Result<BroadcastReport> {
        let frame = Envelope::encode(type_path, message)?;
        Ok(self
            .state
            .connections
            .broadcast_frame_to(frame, |c| c.role().as_deref() == Some(ROLE_FLIGHT_VIEW))
            .await)
    }

    /// Ping a peer; the round trip is recorded when it pings back.
    ///
    /// # Errors
    ///
    /// `UnknownConnection` if `id` is not connected.
    pub async fn send_ping(&self, id: ConnectionId) -> Result<()> {
        let connection = self
            .state
            .connections
            .get(id)
            .ok_or(GroundlinkError::UnknownConnection(id))?;

        self.state
            .pings
            .lock()
            .entry(id)
            .or_default()
            .push_back(unix_time());

        connection.send("ping", &json!({})).await
    }

    /// Most recent round trip to `id` in milliseconds.
    pub fn last_ping_ms(&self, id: ConnectionId) -> Option<f64> {
        self.state.last_ping_ms.lock().get(&id).copied()
    }

    /// Stop accepting and close every peer. Idempotent.
    pub fn stop(&self) {
        self.server.stop();
    }

    pub async fn stopped(&self) {
        self.server.stopped().await
    }
}
