//! Handler module - message dispatch by type path.
//!
//! Provides:
//! - [`Dispatcher`] - maps flattened type paths to handlers
//! - [`Router`] - the seam the read loop routes payloads through
//! - [`RoleRouter`] - role-qualified lookup with `all.` fallback
//!
//! # Example
//!
//! ```
//! use groundlink::handler::{Dispatcher, RoleRouter};
//! use serde_json::{json, Value};
//!
//! let mut dispatcher = Dispatcher::new();
//!
//! // Any role may ask for the time
//! dispatcher.register_raw("all.time.request", |_: Value, origin| async move {
//!     origin.send("time", &json!({"type": "data", "time": 0.0})).await
//! });
//!
//! let router = RoleRouter::new(dispatcher);
//! assert!(router.dispatcher().is_registered("all.time.request"));
//! ```

mod registry;
mod router;

pub use registry::{BoxFuture, Dispatcher, Handler, HandlerResult, TypedHandler};
pub use router::{RoleRouter, Router, FALLBACK_PREFIX};
