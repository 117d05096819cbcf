//! Dispatcher mapping type paths to handlers.
//!
//! Type paths are the dotted keys produced by envelope flattening, e.g.
//! `"time.data"` or `"all.connect.data"`. Registering a path twice replaces
//! the earlier handler; a path with no handler yields `UnhandledType`,
//! which the read loop logs without closing the connection.
//!
//! # Example
//!
//! ```
//! use groundlink::handler::Dispatcher;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct TimeData {
//!     time: f64,
//! }
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register("time.data", |data: TimeData, _origin| async move {
//!     println!("host time {}", data.time);
//!     Ok(())
//! });
//! assert!(dispatcher.is_registered("time.data"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::Router;
use crate::codec::{Envelope, JsonCodec};
use crate::connection::ConnectionHandle;
use crate::error::{GroundlinkError, Result};

/// What every handler resolves to.
pub type HandlerResult = Result<()>;

/// Boxed, sendable future returned by handlers and routers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe handler stored in the dispatch table.
pub trait Handler: Send + Sync + 'static {
    /// Handle a flattened message body from `origin`.
    fn call(&self, message: Value, origin: ConnectionHandle) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the message body before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a closure taking a deserialised payload.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: Value, origin: ConnectionHandle) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match JsonCodec::from_value(message) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(parsed, origin))
    }
}

/// Registry mapping type paths to handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Dispatcher {
    /// Create a new empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `type_path`, replacing any existing one.
    ///
    /// The body is deserialized into `T` before the handler runs; a body
    /// that does not fit `T` is reported as `MalformedMessage`. Use
    /// `serde_json::Value` to take the body as-is.
    pub fn register<F, T, Fut>(&mut self, type_path: &str, handler: F)
    where
        F: Fn(T, ConnectionHandle) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(type_path, Box::new(TypedHandler::new(handler)));
    }

    /// Register a handler that takes the body as raw JSON.
    pub fn register_raw<F, Fut>(&mut self, type_path: &str, handler: F)
    where
        F: Fn(Value, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register::<F, Value, Fut>(type_path, handler);
    }

    /// Register a boxed handler, replacing any existing one.
    pub fn register_handler(&mut self, type_path: &str, handler: Box<dyn Handler>) {
        if self.handlers.insert(type_path.to_string(), handler).is_some() {
            debug!(type_path, "Replaced existing handler");
        }
    }

    /// Remove the handler for `type_path`. Returns whether one existed.
    pub fn unregister(&mut self, type_path: &str) -> bool {
        self.handlers.remove(type_path).is_some()
    }

    /// Check whether a handler exists for `type_path`.
    pub fn is_registered(&self, type_path: &str) -> bool {
        self.handlers.contains_key(type_path)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type paths, sorted.
    pub fn type_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Decode one payload and dispatch it.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` for undecodable payloads, `UnhandledType` when
    /// nothing is registered for the flattened type, or whatever the
    /// handler returns.
    pub async fn dispatch(&self, payload: &[u8], origin: ConnectionHandle) -> Result<()> {
        let envelope = Envelope::decode(payload)?;
        self.dispatch_envelope(envelope, origin).await
    }

    /// Dispatch an already-decoded envelope.
    pub async fn dispatch_envelope(&self, envelope: Envelope, origin: ConnectionHandle) -> Result<()> {
        let (type_path, message) = envelope.into_parts();
        self.dispatch_as(&type_path, message, origin).await
    }

    /// Invoke the handler for `type_path` with `message`.
    ///
    /// A panicking handler is reported as `GroundlinkError::Handler`.
    pub async fn dispatch_as(
        &self,
        type_path: &str,
        message: Value,
        origin: ConnectionHandle,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(type_path)
            .ok_or_else(|| GroundlinkError::UnhandledType(type_path.to_string()))?;

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(message, origin))) {
            Ok(fut) => fut,
            Err(panic) => return Err(handler_panicked(type_path, panic)),
        };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(handler_panicked(type_path, panic)),
        }
    }
}

impl Router for Dispatcher {
    fn route<'a>(&'a self, payload: &'a [u8], origin: ConnectionHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.dispatch(payload, origin))
    }
}

fn handler_panicked(type_path: &str, panic: Box<dyn Any + Send>) -> GroundlinkError {
    let reason = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };

    GroundlinkError::Handler {
        type_path: type_path.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::spawn_test_connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn origin() -> (ConnectionHandle, tokio::io::DuplexStream) {
        let (handle, far, _task) = spawn_test_connection(1, Dispatcher::new());
        (handle, far)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("time.data", |_: Value, _origin| async { Ok(()) });
        dispatcher.register("connect.request", |_: Value, _origin| async { Ok(()) });

        assert!(dispatcher.is_registered("time.data"));
        assert!(!dispatcher.is_registered("time"));
        assert_eq!(dispatcher.len(), 2);
        assert_eq!(dispatcher.type_paths(), vec!["connect.request", "time.data"]);
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = Dispatcher::new();
        let counter = first.clone();
        dispatcher.register("ping", move |_: Value, _origin| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let counter = second.clone();
        dispatcher.register("ping", move |_: Value, _origin| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (origin, _far) = origin();
        dispatcher
            .dispatch(br#"{"type":"ping","message":{}}"#, origin)
            .await
            .unwrap();

        assert_eq!(dispatcher.len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_type() {
        let dispatcher = Dispatcher::new();
        let (origin, _far) = origin();

        let err = dispatcher
            .dispatch(br#"{"type":"x","message":{"type":"y"}}"#, origin)
            .await
            .unwrap_err();

        assert!(err.is_unhandled());
        assert_eq!(err.to_string(), "Unhandled message type: 'x.y'");
    }

    #[tokio::test]
    async fn test_dispatch_uses_flattened_key() {
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let mut dispatcher = Dispatcher::new();
        let slot = seen.clone();
        dispatcher.register("connect.data", move |body: Value, _origin| {
            let slot = slot.clone();
            async move {
                *slot.lock() = Some(body);
                Ok(())
            }
        });

        let (origin, _far) = origin();
        dispatcher
            .dispatch(
                br#"{"type":"connect","message":{"type":"data","program":"flight-view"}}"#,
                origin,
            )
            .await
            .unwrap();

        assert_eq!(
            seen.lock().clone(),
            Some(serde_json::json!({"program": "flight-view"}))
        );
    }

    #[tokio::test]
    async fn test_typed_body_mismatch_is_malformed() {
        #[derive(serde::Deserialize)]
        struct Telemetry {
            #[allow(dead_code)]
            lat: f64,
        }

        let mut dispatcher = Dispatcher::new();
        dispatcher.register("telemetry", |_: Telemetry, _origin| async { Ok(()) });
        let (origin, _far) = origin();

        let err = dispatcher
            .dispatch(br#"{"type":"telemetry","message":{"lat":"north"}}"#, origin)
            .await
            .unwrap_err();

        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("explode", |body: Value, _origin| async move {
            if body.is_null() {
                panic!("kaboom");
            }
            Ok(())
        });
        let (origin, _far) = origin();

        let err = dispatcher
            .dispatch(br#"{"type":"explode","message":null}"#, origin)
            .await
            .unwrap_err();

        match err {
            GroundlinkError::Handler { type_path, reason } => {
                assert_eq!(type_path, "explode");
                assert_eq!(reason, "kaboom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
