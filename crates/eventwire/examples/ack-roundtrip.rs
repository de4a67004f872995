//! Ack round trip over an in-memory link.
//!
//! Run with:
//!   cargo run --example ack-roundtrip

use std::time::Duration;

use eventwire::session::{connect, ClientConfig, Server, ServerConfig, Value};
use eventwire::transport::memory;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (connector, acceptor) = memory::listener("example");

    let server = Server::new(acceptor, ServerConfig::default()).on_connection(|socket| {
        eprintln!("[server] client connected: {:?}", socket.id());
        socket.on("ackFromClient", |args: Vec<Value>| {
            eprintln!("[server] ackFromClient args={args:?}");
            vec![
                Value::from(1),
                Value::from(json!({"text": "resp"})),
                Value::from("server"),
            ]
        });
    });
    let handle = server.handle();
    tokio::spawn(server.run());

    let client = connect(connector, ClientConfig::default());
    let reply = client
        .call(
            "ackFromClient",
            vec![Value::from(json!({"id": 3})), Value::from(4)],
            Duration::from_secs(5),
        )
        .await?;
    eprintln!("[client] reply: {}", serde_json::to_string(&reply)?);

    client.close();
    client.closed().await;
    handle.shutdown();
    Ok(())
}
