use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventwire_codec::Value;
use eventwire_frame::DEFAULT_CHANNEL;
use eventwire_transport::{Acceptor, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AllowAll, Authorizer, ChannelGate};
use crate::config::ServerConfig;
use crate::connection::{Connection, Role, Settings};
use crate::driver::{read_loop, spawn_writer, Liveness};
use crate::error::{Result, SessionError};
use crate::handshake::{server_handshake, ConnectAccept, SessionInfo};
use crate::registry::{fan_out, Registry};
use crate::socket::Socket;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type ConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

/// Accepts clients and runs one server-side [`Socket`] per connection.
pub struct Server {
    acceptor: Box<dyn Acceptor>,
    config: ServerConfig,
    allowed: Option<BTreeSet<String>>,
    authorizer: Arc<dyn Authorizer>,
    callbacks: Vec<ConnectionCallback>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new<A>(acceptor: A, config: ServerConfig) -> Self
    where
        A: Acceptor + 'static,
    {
        Self::from_boxed(Box::new(acceptor), config)
    }

    pub fn from_boxed(acceptor: Box<dyn Acceptor>, config: ServerConfig) -> Self {
        Self {
            acceptor,
            config,
            allowed: None,
            authorizer: Arc::new(AllowAll),
            callbacks: Vec::new(),
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Restrict joinable channels. The default channel is always served.
    ///
    /// This is the authorization boundary for channel joins; anything else is
    /// answered with an `invalid namespace` error.
    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        self.allowed = Some(channels.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Called with every handshaken socket before its reader loop starts, so
    /// handlers registered here see the first event.
    pub fn on_connection<F>(mut self, callback: F) -> Self
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn local_addr(&self) -> String {
        self.acceptor.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    fn next_sid(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.config.sid_prefix)
    }

    fn admission(&self) -> Arc<Admission> {
        Arc::new(Admission {
            config: self.config.clone(),
            gate: Arc::new(ChannelGate::new(
                self.allowed.clone(),
                self.authorizer.clone(),
            )),
            callbacks: self.callbacks.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Accept and handshake a single connection.
    pub async fn accept(&mut self) -> Result<Socket> {
        let transport = self.acceptor.accept().await?;
        let sid = self.next_sid();
        self.admission().admit(transport, sid).await
    }

    /// Accept connections until the acceptor shuts down or
    /// [`ServerHandle::shutdown`] is called. Handshakes run concurrently.
    pub async fn run(mut self) -> Result<()> {
        let admission = self.admission();
        let shutdown = self.shutdown.clone();
        info!(addr = %self.acceptor.local_addr(), "server running");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.acceptor.accept() => accepted,
            };
            let transport = match accepted {
                Ok(transport) => transport,
                Err(TransportError::Shutdown) => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let sid = self.next_sid();
            let admission = admission.clone();
            tokio::spawn(async move {
                if let Err(err) = admission.admit(transport, sid.clone()).await {
                    warn!(sid = %sid, error = %err, "connection rejected");
                }
            });
        }

        self.handle().shutdown();
        info!("server stopped");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.acceptor.local_addr())
            .field("allowed", &self.allowed)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct Admission {
    config: ServerConfig,
    gate: Arc<ChannelGate>,
    callbacks: Vec<ConnectionCallback>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl Admission {
    async fn admit(&self, mut transport: Transport, sid: String) -> Result<Socket> {
        let peer = transport.peer.clone();
        let accept = ConnectAccept {
            sid: sid.clone(),
            version: self.config.handshake.protocol_version.clone(),
            ping_interval: self.config.ping_interval.map(millis),
            ping_timeout: Some(millis(self.config.ping_timeout)),
        };
        let request = server_handshake(
            &mut transport,
            self.config.codec.as_ref(),
            &self.config.frame,
            &self.config.handshake,
            &self.gate,
            accept,
        )
        .await?;

        let conn = Connection::new(
            Role::Server(self.gate.clone()),
            Settings::server(&self.config),
            self.shutdown.child_token(),
        );
        let live = Liveness {
            send_pings: false,
            interval: self.config.ping_interval,
            timeout: self.config.ping_timeout,
        };
        let (sink, mut stream) = transport.into_parts();
        let lost = CancellationToken::new();
        let (tx, drained) = spawn_writer(sink, lost.clone());
        conn.attach(
            tx,
            drained,
            SessionInfo {
                sid: sid.clone(),
                peer: peer.clone(),
                protocol_version: request.version,
                ping_interval: live.interval,
                ping_timeout: live.timeout,
                codec: self.config.codec.name(),
                epoch: 1,
            },
        );

        let socket = Socket::served(conn.clone(), DEFAULT_CHANNEL, &self.registry);
        self.registry.insert(sid.clone(), socket.clone());
        info!(sid = %sid, peer = %peer, "client connected");
        for callback in &self.callbacks {
            callback(socket.clone());
        }

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let reason = read_loop(&conn, stream.as_mut(), 1, &lost, live).await;
            lost.cancel();
            conn.terminate(Some(reason.clone()), false, SessionError::Disconnected);
            let rooms = registry.remove(&sid);
            info!(sid = %sid, %reason, rooms = rooms.len(), "client disconnected");
        });
        Ok(socket)
    }
}

/// Cloneable control handle for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Live sockets, ordered by id.
    pub fn sockets(&self) -> Vec<Socket> {
        self.registry.sockets()
    }

    pub fn socket(&self, sid: &str) -> Option<Socket> {
        self.registry.socket(sid)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// How many live sockets have joined `room`.
    pub fn room_len(&self, room: &str) -> usize {
        self.registry.room_len(room)
    }

    /// Members of `room`, ordered by id.
    pub fn room_members(&self, room: &str) -> Vec<Socket> {
        self.registry.members(room)
    }

    /// Emit on the default channel of every member of `room`. Returns how
    /// many got it. See [`Socket::broadcast_to`] to skip the sender.
    pub fn broadcast_to(&self, room: &str, event: &str, args: Vec<Value>) -> usize {
        fan_out(self.registry.members(room), event, &args)
    }

    /// Emit on the default channel of every live socket.
    pub fn broadcast_all(&self, event: &str, args: Vec<Value>) -> usize {
        fan_out(self.registry.sockets(), event, &args)
    }

    /// Emit to every socket that has `channel` open. Returns how many got it.
    pub fn broadcast(&self, channel: &str, event: &str, args: Vec<Value>) -> usize {
        let mut delivered = 0;
        for socket in self.sockets() {
            match socket.emit_on(channel, event, args.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(sid = ?socket.id(), channel, error = %err, "broadcast skipped socket"),
            }
        }
        delivered
    }

    /// Close every socket and stop accepting.
    pub fn shutdown(&self) {
        let sockets = self.sockets();
        info!(sockets = sockets.len(), "server shutting down");
        for socket in sockets {
            socket.close();
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("connections", &self.connection_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::INVALID_NAMESPACE;
    use crate::client::{connect, connect_with_events};
    use crate::config::ClientConfig;
    use crate::config::ReconnectPolicy;
    use crate::event::{ConnectionState, DisconnectReason, LifecycleEvent};
    use crate::handshake::{client_handshake, recv_frame, send_frame};
    use crate::multiplexer::ChannelState;
    use bytes::Bytes;
    use eventwire_frame::{Frame, PacketKind};
    use eventwire_transport::{memory, Connector};
    use tokio::sync::mpsc;

    /// Accept one connection whose client side is driven by hand.
    async fn accept_raw(server: &mut Server, connector: &memory::MemoryConnector) -> (Socket, Transport) {
        let config = ClientConfig::default();
        let raw = async {
            let mut transport = connector.connect().await.unwrap();
            client_handshake(
                &mut transport,
                config.codec.as_ref(),
                &config.frame,
                &config.handshake,
            )
            .await
            .unwrap();
            transport
        };
        let (accepted, transport) = tokio::join!(server.accept(), raw);
        (accepted.unwrap(), transport)
    }

    async fn send_raw(transport: &mut Transport, frame: Frame) {
        let config = ClientConfig::default();
        send_frame(transport, &frame, config.codec.as_ref(), &config.frame)
            .await
            .unwrap();
    }

    async fn recv_reply(transport: &mut Transport) -> Frame {
        let config = ClientConfig::default();
        loop {
            let frame = recv_frame(
                transport,
                config.codec.as_ref(),
                &config.frame,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
            if frame.kind() == PacketKind::AckReply {
                return frame;
            }
        }
    }

    async fn next_channel_error(
        events: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>,
    ) -> (String, String) {
        loop {
            if let LifecycleEvent::ChannelError { channel, message } = events.recv().await.unwrap() {
                return (channel, message);
            }
        }
    }

    #[tokio::test]
    async fn accept_assigns_prefixed_session_ids() {
        let (connector, acceptor) = memory::listener("sids");
        let mut server = Server::new(acceptor, ServerConfig::default().with_sid_prefix("node"));

        let first = connect(connector.clone(), ClientConfig::default());
        let accepted = server.accept().await.unwrap();
        assert_eq!(accepted.id().as_deref(), Some("node-1"));
        assert_eq!(
            first.wait_for_state(ConnectionState::Open).await,
            ConnectionState::Open
        );
        assert_eq!(first.id().as_deref(), Some("node-1"));

        let second = connect(connector, ClientConfig::default());
        let accepted = server.accept().await.unwrap();
        assert_eq!(accepted.id().as_deref(), Some("node-2"));
        second.wait_for_state(ConnectionState::Open).await;

        let handle = server.handle();
        assert_eq!(handle.connection_count(), 2);
        assert!(handle.socket("node-1").is_some());
        assert!(handle.socket("node-3").is_none());
    }

    #[tokio::test]
    async fn channels_outside_the_allow_list_are_refused() {
        let (connector, acceptor) = memory::listener("allow");
        let mut server = Server::new(acceptor, ServerConfig::default()).with_channels(&["/chat"]);

        let (client, mut events) = connect_with_events(connector, ClientConfig::default());
        let _accepted = server.accept().await.unwrap();
        let admin = client.channel("/admin").unwrap();

        let (channel, message) = next_channel_error(&mut events).await;
        assert_eq!(channel, "/admin");
        assert_eq!(message, INVALID_NAMESPACE);
        assert_eq!(admin.state(), Some(ChannelState::Closed));
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn authorizer_message_reaches_the_client() {
        let (connector, acceptor) = memory::listener("authz");
        let mut server = Server::new(acceptor, ServerConfig::default()).with_authorizer(
            |channel: &str, auth: Option<&str>| match (channel, auth) {
                ("/ops", Some("letmein")) | ("/", _) => Ok(()),
                ("/ops", _) => Err("not allowed".to_string()),
                _ => Ok(()),
            },
        );

        let (client, mut events) = connect_with_events(connector, ClientConfig::default());
        let _accepted = server.accept().await.unwrap();
        client.channel("/ops").unwrap();

        let (channel, message) = next_channel_error(&mut events).await;
        assert_eq!(channel, "/ops");
        assert_eq!(message, "not allowed");
    }

    #[tokio::test]
    async fn broadcast_reaches_sockets_with_the_channel_open() {
        let (connector, acceptor) = memory::listener("fanout");
        let mut server = Server::new(acceptor, ServerConfig::default());
        let handle = server.handle();

        let joined = connect(connector.clone(), ClientConfig::default());
        server.accept().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let news = joined.channel("/news").unwrap();
        news.on("headline", move |args: Vec<Value>| {
            let _ = tx.send(args);
        });
        let mut events = joined.subscribe();
        loop {
            if let LifecycleEvent::ChannelConnect { channel } = events.recv().await.unwrap() {
                assert_eq!(channel, "/news");
                break;
            }
        }

        let _idle = connect(connector, ClientConfig::default());
        server.accept().await.unwrap();

        // The server records the join before it answers CONNECT_OK.
        let delivered = handle.broadcast("/news", "headline", vec![Value::from("hello")]);
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), vec![Value::from("hello")]);
    }

    #[tokio::test]
    async fn shutdown_closes_sockets_and_stops_run() {
        let (connector, acceptor) = memory::listener("stop");
        let server = Server::new(acceptor, ServerConfig::default());
        let handle = server.handle();
        let running = tokio::spawn(server.run());

        let client = connect(
            connector,
            ClientConfig::default().with_reconnect(crate::config::ReconnectPolicy::disabled()),
        );
        client.wait_for_state(ConnectionState::Open).await;

        handle.shutdown();
        assert!(handle.is_shutdown());
        running.await.unwrap().unwrap();
        assert_eq!(
            client.wait_for_state(ConnectionState::Closed).await,
            ConnectionState::Closed
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("server sockets should be unregistered");
    }

    #[tokio::test]
    async fn events_on_unknown_channels_leave_no_trace() {
        let (connector, acceptor) = memory::listener("junk");
        let mut server = Server::new(acceptor, ServerConfig::default());
        let (accepted, mut transport) = accept_raw(&mut server, &connector).await;
        accepted.on("echo", |args: Vec<Value>| args);

        for i in 0..1000 {
            let frame = Frame::event(format!("/junk{i}"), "spam", vec![Value::from("x")]);
            send_raw(&mut transport, frame).await;
        }
        send_raw(
            &mut transport,
            Frame::ack_request(DEFAULT_CHANNEL, 1, "echo", vec![Value::from("done")]),
        )
        .await;

        let reply = recv_reply(&mut transport).await;
        assert_eq!(reply.correlation_id(), Some(1));
        assert_eq!(reply.payload(), [Value::from("done")]);
        assert_eq!(
            accepted.channels(),
            vec![(DEFAULT_CHANNEL.to_string(), ChannelState::Open)]
        );
    }

    #[tokio::test]
    async fn lenient_server_skips_a_malformed_frame() {
        let (connector, acceptor) = memory::listener("lenient");
        let mut server = Server::new(acceptor, ServerConfig::default());
        let (accepted, mut transport) = accept_raw(&mut server, &connector).await;
        accepted.on("echo", |args: Vec<Value>| args);

        transport
            .sink
            .send(Bytes::from_static(&[0xff, 0x00]))
            .await
            .unwrap();
        send_raw(
            &mut transport,
            Frame::ack_request(DEFAULT_CHANNEL, 7, "echo", vec![Value::from("still here")]),
        )
        .await;

        let reply = recv_reply(&mut transport).await;
        assert_eq!(reply.payload(), [Value::from("still here")]);
        assert_eq!(accepted.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn strict_server_drops_a_connection_on_a_malformed_frame() {
        let (connector, acceptor) = memory::listener("strict");
        let mut server = Server::new(acceptor, ServerConfig::default().with_strict(true));
        let handle = server.handle();
        let (accepted, mut transport) = accept_raw(&mut server, &connector).await;
        let mut events = accepted.subscribe();

        transport
            .sink
            .send(Bytes::from_static(&[0xff, 0x00]))
            .await
            .unwrap();

        accepted.wait_for_state(ConnectionState::Closed).await;
        loop {
            if let LifecycleEvent::Disconnect { reason } = events.recv().await.unwrap() {
                assert!(matches!(reason, DisconnectReason::ProtocolError(_)), "{reason:?}");
                break;
            }
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.stream.recv().await.unwrap().is_some() {}
        })
        .await
        .expect("the link should be closed");
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("the socket should be unregistered");
    }

    #[tokio::test]
    async fn rooms_scope_broadcasts_and_forget_departed_sockets() {
        let (connector, acceptor) = memory::listener("rooms");
        let mut server = Server::new(acceptor, ServerConfig::default());
        let handle = server.handle();

        let mut clients = Vec::new();
        let mut served = Vec::new();
        let mut inboxes = Vec::new();
        for _ in 0..3 {
            let client = connect(
                connector.clone(),
                ClientConfig::default().with_reconnect(ReconnectPolicy::disabled()),
            );
            let (tx, rx) = mpsc::unbounded_channel();
            client.on("news", move |args: Vec<Value>| {
                let _ = tx.send(args);
            });
            served.push(server.accept().await.unwrap());
            client.wait_for_state(ConnectionState::Open).await;
            clients.push(client);
            inboxes.push(rx);
        }

        served[0].join("lobby").unwrap();
        served[1].join("lobby").unwrap();
        served[1].join("lobby").unwrap();
        assert_eq!(handle.room_len("lobby"), 2);
        assert_eq!(served[0].rooms(), vec!["lobby".to_string()]);
        let members: Vec<_> = handle.room_members("lobby").iter().map(Socket::id).collect();
        assert_eq!(members, vec![served[0].id(), served[1].id()]);

        // The sender does not hear its own room broadcast.
        let sent = served[0].broadcast_to("lobby", "news", vec![Value::from("from 1")]);
        assert_eq!(sent.unwrap(), 1);
        assert_eq!(inboxes[1].recv().await.unwrap(), vec![Value::from("from 1")]);

        assert_eq!(handle.broadcast_to("lobby", "news", vec![Value::from("lobby")]), 2);
        assert_eq!(inboxes[0].recv().await.unwrap(), vec![Value::from("lobby")]);
        assert_eq!(inboxes[1].recv().await.unwrap(), vec![Value::from("lobby")]);

        assert_eq!(handle.broadcast_all("news", vec![Value::from("all")]), 3);
        for inbox in &mut inboxes {
            assert_eq!(inbox.recv().await.unwrap(), vec![Value::from("all")]);
        }

        assert!(served[1].leave("lobby").unwrap());
        assert!(!served[1].leave("lobby").unwrap());
        assert_eq!(handle.room_len("lobby"), 1);

        clients[0].close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.room_len("lobby") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("a departed socket should leave its rooms");
        assert!(served[0].rooms().is_empty());
        assert!(matches!(
            served[0].join("lobby"),
            Err(SessionError::ChannelClosed(_))
        ));

        assert!(matches!(clients[2].join("lobby"), Err(SessionError::ServerOnly)));
        assert!(clients[2].rooms().is_empty());
        assert_eq!(served[2].peer().as_deref(), Some("memory:left"));
        assert_eq!(clients[2].peer().as_deref(), Some("memory:right"));
    }
}
