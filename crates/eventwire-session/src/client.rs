use std::sync::Arc;
use std::time::Duration;

use eventwire_frame::DEFAULT_CHANNEL;
use eventwire_transport::{Connector, Transport};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Backoff, ClientConfig};
use crate::connection::{Connection, Role, Settings};
use crate::driver::{read_loop, spawn_writer, Liveness};
use crate::error::{Result, SessionError};
use crate::event::{ConnectionState, LifecycleEvent};
use crate::handshake::{client_handshake, ConnectAccept, SessionInfo};
use crate::socket::Socket;

/// Connect in the background and return the socket immediately.
///
/// The socket starts `Connecting`; sends made before the handshake completes
/// are queued. The connection keeps reconnecting per `config.reconnect` until
/// it is closed or the retry budget runs out. Must run inside a tokio runtime.
pub fn connect<C>(connector: C, config: ClientConfig) -> Socket
where
    C: Connector + 'static,
{
    connect_with_events(connector, config).0
}

/// Like [`connect`], also returning a lifecycle receiver subscribed before
/// the first connection attempt, so no event is missed.
pub fn connect_with_events<C>(
    connector: C,
    config: ClientConfig,
) -> (Socket, broadcast::Receiver<LifecycleEvent>)
where
    C: Connector + 'static,
{
    let conn = Connection::new(
        Role::Client,
        Settings::client(&config),
        CancellationToken::new(),
    );
    let events = conn.subscribe();
    let mut channel = config.channel.clone();
    if let Err(err) = conn.open_channel(&channel) {
        warn!(channel = %channel, error = %err, "invalid default channel; using {DEFAULT_CHANNEL}");
        channel = DEFAULT_CHANNEL.to_string();
    }
    let socket = Socket::new(conn.clone(), &channel);
    tokio::spawn(run(conn, Box::new(connector), config));
    (socket, events)
}

async fn establish(
    conn: &Connection,
    connector: &dyn Connector,
    config: &ClientConfig,
) -> Result<(Transport, ConnectAccept)> {
    let timeout = config.handshake.timeout;
    let mut transport = tokio::time::timeout(timeout, connector.connect())
        .await
        .map_err(|_| SessionError::Timeout(timeout))??;
    let accept = client_handshake(
        &mut transport,
        conn.codec(),
        conn.frame_config(),
        &config.handshake,
    )
    .await?;
    Ok((transport, accept))
}

fn liveness(accept: &ConnectAccept, config: &ClientConfig) -> Liveness {
    let interval = match accept.ping_interval {
        Some(ms) => Some(Duration::from_millis(ms)),
        None => config.ping_interval,
    };
    let timeout = accept
        .ping_timeout
        .map(Duration::from_millis)
        .unwrap_or(config.ping_timeout);
    Liveness {
        send_pings: true,
        interval,
        timeout,
    }
}

/// The client lifecycle: connect, serve the link, back off, repeat.
async fn run(conn: Arc<Connection>, connector: Box<dyn Connector>, config: ClientConfig) {
    let shutdown = conn.shutdown_token().clone();
    let mut backoff = Backoff::new(config.reconnect.clone());
    let mut epoch = 0u64;
    info!(endpoint = %connector.describe(), codec = conn.codec().name(), "client starting");

    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            attempt = establish(&conn, connector.as_ref(), &config) => attempt,
        };

        match attempt {
            Ok((transport, accept)) => {
                epoch += 1;
                let reconnected_after = backoff.attempt();
                backoff.reset();

                let live = liveness(&accept, &config);
                let peer = transport.peer.clone();
                let (sink, mut stream) = transport.into_parts();
                let lost = CancellationToken::new();
                let (tx, drained) = spawn_writer(sink, lost.clone());
                conn.attach(
                    tx,
                    drained,
                    SessionInfo {
                        sid: accept.sid.clone(),
                        peer,
                        protocol_version: accept.version.clone(),
                        ping_interval: live.interval,
                        ping_timeout: live.timeout,
                        codec: conn.codec().name(),
                        epoch,
                    },
                );
                if epoch > 1 {
                    info!(attempt = reconnected_after, epoch, "reconnected");
                    conn.emit_event(LifecycleEvent::Reconnect {
                        attempt: reconnected_after,
                    });
                }

                let reason = read_loop(&conn, stream.as_mut(), epoch, &lost, live).await;
                lost.cancel();
                if conn.state() == ConnectionState::Closed {
                    break;
                }
                if !reason.is_recoverable() {
                    conn.terminate(Some(reason), false, |_| {
                        SessionError::ChannelClosed(DEFAULT_CHANNEL.to_string())
                    });
                    break;
                }
                conn.detach(epoch, reason);
            }
            Err(err) => {
                warn!(error = %err, attempt = backoff.attempt(), "connect attempt failed");
                conn.set_state(ConnectionState::Reconnecting);
                conn.emit_event(LifecycleEvent::ConnectError {
                    message: err.to_string(),
                });
            }
        }

        if backoff.exhausted() {
            let attempts = backoff.attempt();
            warn!(attempts, "reconnect budget exhausted; closing");
            conn.emit_event(LifecycleEvent::ReconnectFailed { attempts });
            conn.terminate(None, false, |_| {
                SessionError::ChannelClosed(DEFAULT_CHANNEL.to_string())
            });
            break;
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempt();
        info!(attempt, ?delay, "scheduling reconnect");
        conn.emit_event(LifecycleEvent::ReconnectAttempt { attempt, delay });
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(epochs = epoch, "client lifecycle finished");
}
