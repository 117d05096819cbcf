//! # groundlink
//!
//! Length-prefixed JSON messaging for ground-control-station peers.
//!
//! Every peer (GUI listener, telemetry source, image worker, core server)
//! exchanges discrete `{type, message}` envelopes over a byte stream that
//! has no message boundaries of its own, TCP or local IPC alike.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): 8-byte space-padded decimal length, then UTF-8 JSON
//! - **Envelope** ([`codec`]): `{type, message}` with one-level type flattening
//! - **Dispatch** ([`handler`]): flattened type path to handler, role-qualified fallback
//! - **Peers** ([`Client`], [`Server`], [`HostServer`]): reconnecting client, broadcast server, role-aware host
//!
//! ```text
//! ┌─────────────┐  frames  ┌────────────────────────────────────────┐
//! │   Client    │ ───────► │ FrameBuffer ─► Envelope ─► Dispatcher  │
//! │ (reconnect) │ ◄─────── │ writer task ◄──────── ConnectionHandle │
//! └─────────────┘          └────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use groundlink::{Client, Endpoint};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct TimeData {
//!     time: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> groundlink::Result<()> {
//!     let client = Client::builder(Endpoint::tcp("127.0.0.1:4000"))
//!         .handle("time.data", |data: TimeData, _origin| async move {
//!             println!("host clock: {}", data.time);
//!             Ok(())
//!         })
//!         .connect()?;
//!
//!     client.wait_connected().await?;
//!     client.send("time", &serde_json::json!({"type": "request"})).await?;
//!     client.closed().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod transport;

mod client;
mod connection;
mod host;
mod poller;
mod server;
mod writer;

pub use client::{Client, ClientBuilder, ClientConfig, ConnectionState, DEFAULT_RECONNECT_DELAY};
pub use connection::{ConnectionEnd, ConnectionHandle, ConnectionId, DEFAULT_READ_BUFFER_SIZE};
pub use error::{GroundlinkError, Result};
pub use handler::{Dispatcher, RoleRouter, Router};
pub use host::{
    unix_time, HostConfig, HostServer, HostServerBuilder, ROLE_FLIGHT_VIEW, ROLE_IMAGE_CORRECTOR,
    ROLE_TELEMETRY_SENDER,
};
pub use poller::{PollSource, Poller};
pub use server::{
    AcceptHook, BroadcastReport, ConnectionSet, Server, ServerBuilder, ServerConfig, ServerEvent,
    DEFAULT_EVENT_CAPACITY,
};
pub use transport::Endpoint;
pub use writer::WriterConfig;
