use std::time::Duration;

use eventwire_session::{
    connect, connect_with_events, ClientConfig, ConnectionState, DisconnectReason, LifecycleEvent,
    OverflowPolicy, ReconnectPolicy, Server, ServerConfig, ServerHandle, SessionError, Socket,
    Value,
};
use eventwire_frame::{FrameConfig, ProtocolError};
use eventwire_transport::memory::{self, MemoryConnector};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

fn start_server<F>(name: &str, setup: F) -> (MemoryConnector, ServerHandle)
where
    F: Fn(Socket) + Send + Sync + 'static,
{
    let (connector, acceptor) = memory::listener(name);
    let server = Server::new(acceptor, ServerConfig::default()).on_connection(setup);
    let handle = server.handle();
    tokio::spawn(server.run());
    (connector, handle)
}

fn echo_handlers(socket: Socket) {
    socket.on("echo", |args: Vec<Value>| args);
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter()
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    mut wanted: impl FnMut(&LifecycleEvent) -> bool,
) -> LifecycleEvent {
    loop {
        let event = events.recv().await.expect("event stream should stay open");
        if wanted(&event) {
            return event;
        }
    }
}

async fn wait_for_channel(events: &mut broadcast::Receiver<LifecycleEvent>, name: &str) {
    wait_for_event(events, |event| {
        matches!(event, LifecycleEvent::ChannelConnect { channel } if channel == name)
    })
    .await;
}

#[tokio::test]
async fn ack_reply_is_returned_verbatim() {
    let (connector, _server) = start_server("ack-verbatim", |socket| {
        socket.on("ackFromClient", |args: Vec<Value>| {
            if args.len() != 2 {
                return Vec::new();
            }
            vec![
                Value::from(1),
                Value::from(json!({"text": "resp"})),
                Value::from("server"),
            ]
        });
    });
    let client = connect(connector, ClientConfig::default());

    let reply = client
        .call(
            "ackFromClient",
            vec![Value::from(json!({"id": 3})), Value::from(4)],
            Duration::from_millis(5000),
        )
        .await
        .unwrap();

    assert_eq!(
        reply,
        vec![
            Value::from(1),
            Value::from(json!({"text": "resp"})),
            Value::from("server"),
        ]
    );
    assert_eq!(client.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_the_call() {
    let (connector, _server) = start_server("ack-timeout", |_socket| {});
    let client = connect(connector, ClientConfig::default());
    client.wait_for_state(ConnectionState::Open).await;

    let started = Instant::now();
    let err = client
        .call("nobody-listens", vec![], Duration::from_millis(100))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        SessionError::AckTimeout { timeout, .. } if timeout == Duration::from_millis(100)
    ));
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
    assert_eq!(client.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_ignored() {
    let (connector, _server) = start_server("ack-late", |socket| {
        socket.on_async("slow", |args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            args
        });
        echo_handlers(socket);
    });
    let client = connect(connector, ClientConfig::default());

    let err = client
        .call("slow", vec![Value::from("late")], Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AckTimeout { .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.pending_acks(), 0);

    let reply = client
        .call("echo", vec![Value::from("fresh")], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::from("fresh")]);
}

#[tokio::test]
async fn events_on_one_channel_keep_their_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (connector, _server) = start_server("ordering", move |socket| {
        let tx = tx.clone();
        socket.on("seq", move |args: Vec<Value>| {
            let _ = tx.send(args[0].as_i64());
        });
    });
    let client = connect(connector, ClientConfig::default());

    // Emitted before the handshake finishes; these are queued and flushed.
    for i in 0..100_i64 {
        client.emit("seq", vec![Value::from(i)]).unwrap();
    }
    for i in 0..100_i64 {
        assert_eq!(rx.recv().await.unwrap(), Some(i));
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_reopens_channels_and_flushes_queued_sends_once() {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
    let (connector, _server) = start_server("reconnect", move |socket| {
        let root = tx.clone();
        socket.on("msg", move |args: Vec<Value>| {
            let text = args[0].as_str().unwrap_or_default().to_string();
            let _ = root.send(("/".to_string(), text));
        });
        let chat = tx.clone();
        socket
            .channel("/chat")
            .unwrap()
            .on("msg", move |args: Vec<Value>| {
                let text = args[0].as_str().unwrap_or_default().to_string();
                let _ = chat.send(("/chat".to_string(), text));
            });
    });
    let faults = connector.clone();
    let (client, mut events) = connect_with_events(
        connector,
        ClientConfig::default().with_reconnect(fast_reconnect()),
    );
    let chat = client.channel("/chat").unwrap();
    wait_for_channel(&mut events, "/chat").await;

    client.emit("msg", vec![Value::from("a1")]).unwrap();
    chat.emit("msg", vec![Value::from("c1")]).unwrap();
    let mut received = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];

    assert_eq!(faults.sever_all(), 1);
    assert_eq!(
        client.wait_for_state(ConnectionState::Reconnecting).await,
        ConnectionState::Reconnecting
    );
    client.emit("msg", vec![Value::from("a2")]).unwrap();
    chat.emit("msg", vec![Value::from("c2")]).unwrap();
    assert_eq!(client.queued_frames(), 2);

    wait_for_event(&mut events, |event| {
        matches!(event, LifecycleEvent::Reconnect { attempt: 1 })
    })
    .await;
    wait_for_channel(&mut events, "/chat").await;
    received.push(rx.recv().await.unwrap());
    received.push(rx.recv().await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err(), "no frame may be delivered twice");
    assert_eq!(client.queued_frames(), 0);

    let on = |channel: &str| -> Vec<String> {
        received
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, text)| text.clone())
            .collect()
    };
    assert_eq!(on("/"), vec!["a1", "a2"]);
    assert_eq!(on("/chat"), vec!["c1", "c2"]);
    assert_eq!(faults.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn acks_in_flight_fail_when_the_link_drops() {
    let (connector, _server) = start_server("in-flight", |_socket| {});
    let faults = connector.clone();
    let client = connect(
        connector,
        ClientConfig::default().with_reconnect(fast_reconnect()),
    );
    client.wait_for_state(ConnectionState::Open).await;

    let call = client.call("never", vec![], Duration::from_secs(30));
    tokio::task::yield_now().await;
    faults.sever_all();

    assert!(matches!(call.await, Err(SessionError::Disconnected(_))));
    assert_eq!(
        client.wait_for_state(ConnectionState::Open).await,
        ConnectionState::Open
    );
}

#[tokio::test]
async fn closing_a_channel_fails_its_calls_only() {
    let (connector, _server) = start_server("close-cascade", echo_handlers);
    let (client, mut events) = connect_with_events(connector, ClientConfig::default());
    let chat = client.channel("/chat").unwrap();
    wait_for_channel(&mut events, "/chat").await;

    let pending = chat.call("unanswered", vec![], Duration::from_secs(30));
    chat.close();

    assert!(matches!(
        pending.await,
        Err(SessionError::ChannelClosed(channel)) if channel == "/chat"
    ));
    assert!(matches!(
        chat.emit("late", vec![]),
        Err(SessionError::ChannelClosed(_))
    ));
    wait_for_event(&mut events, |event| {
        matches!(event, LifecycleEvent::ChannelDisconnect { channel } if channel == "/chat")
    })
    .await;

    let reply = client
        .call("echo", vec![Value::from(7)], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::from(7)]);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn server_disconnect_closes_without_reconnecting() {
    let (connector, server) = start_server("remote-close", |_socket| {});
    let faults = connector.clone();
    let (client, mut events) = connect_with_events(connector, ClientConfig::default());
    client.wait_for_state(ConnectionState::Open).await;

    let sid = client.id().unwrap();
    server.socket(&sid).unwrap().close();

    let event = wait_for_event(&mut events, |event| {
        matches!(event, LifecycleEvent::Disconnect { .. })
    })
    .await;
    assert!(matches!(
        event,
        LifecycleEvent::Disconnect {
            reason: DisconnectReason::RemoteClose
        }
    ));
    assert_eq!(
        client.wait_for_state(ConnectionState::Closed).await,
        ConnectionState::Closed
    );
    assert_eq!(faults.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_closes_and_fails_pending_calls() {
    let (connector, _server) = start_server("budget", |_socket| {});
    connector.set_refusing(true);
    let faults = connector.clone();
    let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_secs(1))
        .without_jitter()
        .with_max_attempts(3);
    let (client, mut events) =
        connect_with_events(connector, ClientConfig::default().with_reconnect(policy));
    let pending = client.call("never", vec![], Duration::from_secs(60));

    let mut delays = Vec::new();
    let attempts = loop {
        match events.recv().await.unwrap() {
            LifecycleEvent::ReconnectAttempt { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            LifecycleEvent::ReconnectFailed { attempts } => break attempts,
            _ => {}
        }
    };

    assert_eq!(attempts, 3);
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40)
        ]
    );
    assert_eq!(faults.attempts(), 4);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        pending.await,
        Err(SessionError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn cancelled_and_dropped_calls_are_released() {
    let (connector, _server) = start_server("cancel", |_socket| {});
    let client = connect(connector, ClientConfig::default());
    client.wait_for_state(ConnectionState::Open).await;

    let call = client.call("never", vec![], Duration::from_secs(30));
    let id = call.id().unwrap();
    assert!(call.cancel());
    assert!(!call.cancel());
    assert!(matches!(call.await, Err(SessionError::Cancelled(got)) if got == id));

    let dropped = client.call("never", vec![], Duration::from_secs(30));
    assert_eq!(client.pending_acks(), 1);
    drop(dropped);
    assert_eq!(client.pending_acks(), 0);
}

#[tokio::test]
async fn closed_socket_refuses_new_work() {
    let (connector, _server) = start_server("closed", echo_handlers);
    let client = connect(connector, ClientConfig::default());
    client.wait_for_state(ConnectionState::Open).await;

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);

    let call = client.call("echo", vec![], Duration::from_secs(1));
    assert_eq!(call.id(), None);
    assert!(matches!(call.await, Err(SessionError::ChannelClosed(_))));
    assert!(matches!(
        client.emit("echo", vec![]),
        Err(SessionError::ChannelClosed(_))
    ));
    assert!(client.channel("/later").is_err());
}

#[tokio::test(start_paused = true)]
async fn oversized_emit_fails_alone_and_keeps_the_link() {
    let (connector, _server) = start_server("oversized", |socket| {
        socket.on_async("slow", |args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            args
        });
    });
    let frame = FrameConfig {
        max_frame_size: 1024,
        ..FrameConfig::default()
    };
    let client = connect(connector, ClientConfig::default().with_frame(frame));
    client.wait_for_state(ConnectionState::Open).await;

    let in_flight = client.call("slow", vec![Value::from("kept")], Duration::from_secs(5));
    let err = client
        .emit("big", vec![Value::from("x".repeat(2048))])
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::FrameTooLarge { max: 1024, .. })
    ));

    let big_call = client.call("big", vec![Value::from("x".repeat(2048))], Duration::from_secs(5));
    assert!(matches!(
        big_call.await,
        Err(SessionError::Protocol(ProtocolError::FrameTooLarge { .. }))
    ));

    assert_eq!(in_flight.await.unwrap(), vec![Value::from("kept")]);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn resumed_acks_keep_their_original_deadline() {
    let (connector, _server) = start_server("resume", echo_handlers);
    let faults = connector.clone();
    let (client, mut events) = connect_with_events(
        connector,
        ClientConfig::default()
            .with_reconnect(fast_reconnect())
            .with_resume_pending_on_reconnect(true),
    );
    client.wait_for_state(ConnectionState::Open).await;

    let started = Instant::now();
    let call = client.call("unanswered", vec![], Duration::from_secs(2));
    tokio::task::yield_now().await;
    assert_eq!(faults.sever_all(), 1);

    wait_for_event(&mut events, |event| {
        matches!(event, LifecycleEvent::Reconnect { .. })
    })
    .await;
    assert_eq!(client.pending_acks(), 1);

    let err = call.await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, SessionError::AckTimeout { .. }), "{err:?}");
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2100), "{elapsed:?}");
    assert_eq!(client.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn evicted_queued_call_fails_with_queue_full() {
    let (connector, _server) = start_server("evict", echo_handlers);
    connector.set_refusing(true);
    let faults = connector.clone();
    let client = connect(
        connector,
        ClientConfig::default()
            .with_reconnect(fast_reconnect())
            .with_queue(1, OverflowPolicy::DropOldest),
    );

    let first = client.call("echo", vec![Value::from("first")], Duration::from_secs(30));
    let second = client.call("echo", vec![Value::from("second")], Duration::from_secs(30));
    assert!(matches!(
        first.await,
        Err(SessionError::QueueFull { capacity: 1 })
    ));
    assert_eq!(client.queued_frames(), 1);

    faults.set_refusing(false);
    assert_eq!(second.await.unwrap(), vec![Value::from("second")]);
    assert_eq!(client.queued_frames(), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_reconnects_back_off_up_to_the_cap() {
    let (connector, _acceptor) = memory::listener("backoff");
    connector.set_refusing(true);
    let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(1000))
        .with_max_attempts(6);
    let (client, mut events) = connect_with_events(
        connector.clone(),
        ClientConfig::default().with_reconnect(policy.clone()),
    );

    let mut failures = Vec::new();
    let mut scheduled = Vec::new();
    loop {
        match events.recv().await.expect("event stream should stay open") {
            LifecycleEvent::ConnectError { .. } => failures.push(Instant::now()),
            LifecycleEvent::ReconnectAttempt { attempt, delay } => scheduled.push((attempt, delay)),
            LifecycleEvent::ReconnectFailed { attempts } => {
                assert_eq!(attempts, 6);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(failures.len(), 7);
    assert_eq!(scheduled.len(), 6);
    let mut previous = Duration::ZERO;
    for (i, (attempt, delay)) in scheduled.iter().enumerate() {
        assert_eq!(*attempt as usize, i + 1);
        let (low, high) = policy.window(attempt - 1);
        assert!(
            *delay >= low && *delay <= high,
            "attempt {attempt}: {delay:?} outside {low:?}..={high:?}"
        );
        assert!(*delay >= previous, "attempt {attempt}: delay went down");
        assert!(*delay <= Duration::from_millis(1000));
        previous = *delay;

        let observed = failures[i + 1] - failures[i];
        assert!(observed >= *delay, "attempt {attempt}: retried after {observed:?}");
        assert!(observed < *delay + Duration::from_millis(10));
    }
    assert_eq!(scheduled[4].1, Duration::from_millis(1000));
    assert_eq!(scheduled[5].1, Duration::from_millis(1000));
    assert_eq!(connector.attempts(), 7);
    assert_eq!(
        client.wait_for_state(ConnectionState::Closed).await,
        ConnectionState::Closed
    );
}
