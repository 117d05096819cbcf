//! Telemetry sender: identifies itself to a host and streams position data.
//!
//! ```text
//! cargo run --example telemetry_source -- 127.0.0.1:4000
//! ```

use std::time::Duration;

use groundlink::logging::{init_logging, LogConfig};
use groundlink::{unix_time, Client, Endpoint, ROLE_TELEMETRY_SENDER};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

const RATE: Duration = Duration::from_millis(200);

#[derive(Serialize, Debug)]
struct Telemetry {
    #[serde(rename = "type")]
    kind: &'static str,
    time: f64,
    lat: f64,
    lon: f64,
    alt: f64,
    yaw: f64,
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
                .send("connect", &json!({"type": "data", "program": ROLE_TELEMETRY_SENDER}))
                .await
        })
        .handle_raw("ping", |_: Value, origin| async move {
            origin.send("ping", &json!({})).await
        })
        .connect()?;

    client.wait_connected().await?;
    info!(endpoint = %client.endpoint(), "Streaming telemetry");

    let mut ticker = tokio::time::interval(RATE);
    let mut step = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
            _ = client.closed() => break,
        }

        let t = f64::from(step) * RATE.as_secs_f64();
        let sample = Telemetry {
            kind: "data",
            time: unix_time(),
            lat: 38.1446 + 0.001 * t.sin(),
            lon: -76.4280 + 0.001 * t.cos(),
            alt: 100.0,
            yaw: (t * 10.0) % 360.0,
        };

        client.send("telemetry", &sample).await?;
        debug!(step, "Sample sent");
        step = step.wrapping_add(1);
    }

    client.disconnect();
    Ok(())
}
