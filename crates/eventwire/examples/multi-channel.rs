//! Two channels over one TCP connection.
//!
//! Run with:
//!   cargo run --example multi-channel

use std::time::Duration;

use eventwire::session::{
    connect_with_events, ClientConfig, LifecycleEvent, Server, ServerConfig, Value,
};
use eventwire::transport::{MessageConfig, TcpAcceptor, TcpConnector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", MessageConfig::default()).await?;
    let addr = acceptor.local_socket_addr()?;

    let server = Server::new(acceptor, ServerConfig::default())
        .with_channels(&["/chat", "/metrics"])
        .on_connection(|socket| {
            let Ok(chat) = socket.channel("/chat") else {
                return;
            };
            chat.on("say", |args: Vec<Value>| {
                eprintln!("[server] /chat say {args:?}");
                args
            });
            let Ok(metrics) = socket.channel("/metrics") else {
                return;
            };
            metrics.on("sample", |args: Vec<Value>| {
                eprintln!("[server] /metrics sample {args:?}");
            });
        });
    let handle = server.handle();
    tokio::spawn(server.run());

    let (client, mut events) =
        connect_with_events(TcpConnector::new(addr.to_string()), ClientConfig::default());
    let chat = client.channel("/chat")?;
    let metrics = client.channel("/metrics")?;
    let admin = client.channel("/admin")?;

    // Sends made before the joins complete are queued per channel.
    metrics.emit("sample", vec![Value::from("cpu"), Value::from(0.42)])?;
    let echoed = chat
        .call("say", vec![Value::from("hello")], Duration::from_secs(5))
        .await?;
    eprintln!("[client] /chat echoed {echoed:?}");

    while let Ok(event) = events.recv().await {
        if let LifecycleEvent::ChannelError { channel, message } = event {
            eprintln!("[client] {channel} refused: {message}");
            break;
        }
    }
    eprintln!("[client] {} is now {:?}", admin.name(), admin.state());

    client.close();
    client.closed().await;
    handle.shutdown();
    Ok(())
}
