//! Routing seam between the read loop and handler tables.

use tracing::debug;

use super::{BoxFuture, Dispatcher};
use crate::codec::Envelope;
use crate::connection::ConnectionHandle;
use crate::error::Result;

/// Prefix tried when a role-qualified lookup misses.
pub const FALLBACK_PREFIX: &str = "all";

/// Something that can take a raw payload from a connection and handle it.
pub trait Router: Send + Sync + 'static {
    /// Route one demultiplexed payload received on `origin`.
    fn route<'a>(&'a self, payload: &'a [u8], origin: ConnectionHandle) -> BoxFuture<'a, Result<()>>;
}

/// Role-qualified routing.
///
/// A message with flattened type `t` from a connection tagged `role` is
/// dispatched to `role.t`; if nothing handles that, to `all.t`. Untagged
/// connections go straight to `all.t`.
pub struct RoleRouter {
    dispatcher: Dispatcher,
}

impl RoleRouter {
    /// Wrap a dispatcher whose handlers are registered under role-qualified
    /// or `all.` paths.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// The wrapped dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch a decoded envelope using role then fallback lookup.
    pub async fn route_envelope(&self, envelope: Envelope, origin: ConnectionHandle) -> Result<()> {
        if let Some(role) = origin.role() {
            match self
                .dispatcher
                .dispatch_envelope(envelope.with_prefix(&role), origin.clone())
                .await
            {
                Err(e) if e.is_unhandled() => {
                    debug!(role = %role, type_path = envelope.type_path(), "Falling back to '{}'", FALLBACK_PREFIX);
                }
                other => return other,
            }
        }

        self.dispatcher
            .dispatch_envelope(envelope.with_prefix(FALLBACK_PREFIX), origin)
            .await
    }
}

impl Router for RoleRouter {
    fn route<'a>(&'a self, payload: &'a [u8], origin: ConnectionHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let envelope = Envelope::decode(payload)?;
            self.route_envelope(envelope, origin).await
        })
    }
}
