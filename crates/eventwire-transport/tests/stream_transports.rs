use bytes::Bytes;
use eventwire_transport::{Acceptor, Connector, Endpoint, MessageConfig, TcpAcceptor};

#[tokio::test]
async fn tcp_endpoint_exchanges_messages() {
    let mut acceptor = TcpAcceptor::bind("127.0.0.1:0", MessageConfig::default())
        .await
        .expect("tcp listener should bind");
    let addr = acceptor
        .local_socket_addr()
        .expect("bound listener should have an address");

    let endpoint: Endpoint = format!("tcp://{addr}").parse().expect("endpoint should parse");
    let connector = endpoint
        .connector(MessageConfig::default())
        .expect("tcp connector should build");

    let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
    let mut client = client.expect("client should connect");
    let mut server = server.expect("server should accept");

    for i in 0..50u8 {
        client
            .sink
            .send(Bytes::from(vec![i; usize::from(i) + 1]))
            .await
            .expect("send should succeed");
    }
    for i in 0..50u8 {
        let message = server
            .stream
            .recv()
            .await
            .expect("recv should succeed")
            .expect("stream should stay open");
        assert_eq!(message.len(), usize::from(i) + 1);
        assert!(message.iter().all(|b| *b == i));
    }

    server
        .sink
        .send(Bytes::from_static(b"bye"))
        .await
        .expect("reply should send");
    server.sink.close().await.expect("close should succeed");
    assert_eq!(
        client.stream.recv().await.expect("recv should succeed"),
        Some(Bytes::from_static(b"bye"))
    );
    assert_eq!(client.stream.recv().await.expect("eof is not an error"), None);
}

#[cfg(unix)]
#[tokio::test]
async fn unix_endpoint_binds_and_connects() {
    let dir = std::path::PathBuf::from(format!(
        "/tmp/ew-it-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    let endpoint: Endpoint = format!("unix://{}", dir.join("it.sock").display())
        .parse()
        .expect("endpoint should parse");

    let mut acceptor = endpoint
        .bind(MessageConfig::default())
        .await
        .expect("unix acceptor should bind");
    let connector = endpoint
        .connector(MessageConfig::default())
        .expect("unix connector should build");
    assert_eq!(acceptor.local_addr(), connector.describe());

    let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
    let mut client = client.expect("client should connect");
    let mut server = server.expect("server should accept");

    client
        .sink
        .send(Bytes::from_static(b"over uds"))
        .await
        .expect("send should succeed");
    assert_eq!(
        server.stream.recv().await.expect("recv should succeed"),
        Some(Bytes::from_static(b"over uds"))
    );

    drop(client);
    assert_eq!(server.stream.recv().await.expect("eof is not an error"), None);

    drop(acceptor);
    let _ = std::fs::remove_dir_all(&dir);
}
