//! Client startup race: the client comes up before its server.

use std::time::Duration;

use groundlink::{Client, ConnectionState, Endpoint, Server};
use tokio::net::TcpListener;

const DELAY: Duration = Duration::from_millis(200);

async fn free_port_endpoint() -> Endpoint {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    Endpoint::tcp(addr.to_string())
}

#[tokio::test]
async fn test_client_connects_once_server_starts() {
    let endpoint = free_port_endpoint().await;

    let client = Client::builder(endpoint.clone())
        .reconnect_delay(DELAY)
        .connect()
        .unwrap();

    // Two full retry cycles with nobody listening.
    let mut states = client.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.connect_attempts() < 3 {
            tokio::time::sleep(DELAY / 4).await;
            assert_eq!(client.state(), ConnectionState::Connecting);
        }
    })
    .await
    .unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

    let server = Server::builder(endpoint).bind().await.unwrap();

    tokio::time::timeout(DELAY * 2, client.wait_connected())
        .await
        .expect("client should connect within one backoff interval")
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect();
    assert_eq!(client.closed().await, ConnectionState::Closed);
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent_while_connected() {
    let server = Server::builder(Endpoint::tcp("127.0.0.1:0"))
        .bind()
        .await
        .unwrap();

    let client = Client::builder(server.local_endpoint().clone())
        .connect()
        .unwrap();
    client.wait_connected().await.unwrap();

    client.disconnect();
    client.disconnect();

    assert_eq!(client.closed().await, ConnectionState::Closed);
    assert!(client.last_error().is_none());

    server.shutdown().await;
}
