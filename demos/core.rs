//! Core process: a local IPC control endpoint that starts and stops a host.
//!
//! The core listens on the `core` IPC id and reacts to two messages:
//!
//! - `{"type": "start", "message": {"type": "solo", "port": 4000}}` starts a
//!   [`HostServer`] on `0.0.0.0:<port>` with listeners disabled
//! - `{"type": "stop", "message": {}}` stops the running host
//!
//! ```text
//! cargo run --example core
//! GROUNDLINK_LOG=debug cargo run --example core
//! ```

use std::sync::Arc;

use groundlink::logging::{init_logging, LogConfig};
use groundlink::{Endpoint, HostServer, Server, ServerEvent};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Deserialize, Debug)]
struct StartSolo {
    port: u16,
}

type ActiveHost = Arc<Mutex<Option<HostServer>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::from_env())?;

    let active: ActiveHost = Arc::new(Mutex::new(None));

    let start = active.clone();
    let stop = active.clone();
    let core = Server::builder(Endpoint::ipc_id("core"))
        .handle("start.solo", move |data: StartSolo, _origin| {
            let active = start.clone();
            async move {
                info!(port = data.port, "Running core in solo mode");
                let host = HostServer::builder(Endpoint::tcp(format!("0.0.0.0:{}", data.port)))
                    .allow_listeners(false)
                    .bind()
                    .await?;

                let previous = active.lock().replace(host);
                if let Some(previous) = previous {
                    warn!(endpoint = %previous.local_endpoint(), "Replacing running host");
                    previous.stop();
                }
                Ok(())
            }
        })
        .handle_raw("stop", move |_: Value, _origin| {
            let active = stop.clone();
            async move {
                let running = active.lock().take();
                match running {
                    Some(host) => {
                        info!(endpoint = %host.local_endpoint(), "Stopping host");
                        host.stop();
                    }
                    None => warn!("Stop requested with no host running"),
                }
                Ok(())
            }
        })
        .bind()
        .await?;

    info!(endpoint = %core.local_endpoint(), "Core listening");

    let mut events = core.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ServerEvent::Connected { id, .. }) => info!(connection = %id, "Control peer connected"),
                Ok(_) => {}
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let running = active.lock().take();
    if let Some(host) = running {
        host.stop();
    }
    core.shutdown().await;
    Ok(())
}
