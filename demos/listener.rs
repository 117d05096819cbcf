//! Flight-view listener: identifies itself to a host and logs telemetry.
//!
//! ```text
//! cargo run --example listener -- 127.0.0.1:4000
//! ```

use groundlink::logging::{init_logging, LogConfig};
use groundlink::{Client, ConnectionState, Endpoint, ROLE_FLIGHT_VIEW};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Deserialize, Debug)]
struct TimeData {
    time: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::from_env())?;

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4000".to_string());

    let client = Client::builder(Endpoint::tcp(addr))
        .handle_raw("connect.request", |_: Value, origin| async move {
            origin
                .send("connect", &json!({"type": "data", "program": ROLE_FLIGHT_VIEW}))
                .await?;
            origin.send("time", &json!({"type": "request"})).await
        })
        .handle_raw("connect.refuse", |_: Value, _origin| async move {
            warn!("Host refused flight-view listeners");
            Ok(())
        })
        .handle("time.data", |data: TimeData, _origin| async move {
            info!(host_time = data.time, "Host clock");
            Ok(())
        })
        .handle_raw("ping", |_: Value, origin| async move {
            origin.send("ping", &json!({})).await
        })
        .handle_raw("telemetry.data", |body: Value, _origin| async move {
            info!(%body, "Telemetry");
            Ok(())
        })
        .connect()?;

    client.wait_connected().await?;
    info!(endpoint = %client.endpoint(), "Connected");

    tokio::select! {
        state = client.closed() => {
            if state == ConnectionState::Errored {
                warn!(error = ?client.last_error(), "Connection failed");
            }
        }
        _ = tokio::signal::ctrl_c() => client.disconnect(),
    }

    Ok(())
}
