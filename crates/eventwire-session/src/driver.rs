//! Per-link tasks: a writer that owns the sink and a reader loop that owns
//! the stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eventwire_frame::Frame;
use eventwire_transport::{MessageSink, MessageStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, Flow};
use crate::event::DisconnectReason;

/// Liveness settings for one link.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Liveness {
    /// Whether this side sends PING every `interval`.
    pub send_pings: bool,
    pub interval: Option<Duration>,
    pub timeout: Duration,
}

impl Liveness {
    /// Silence longer than this means the link is dead.
    fn window(&self) -> Option<Duration> {
        self.interval.map(|interval| interval + self.timeout)
    }
}

/// Spawn the writer. It drains the returned sender into `sink` until every
/// sender is dropped, then closes the sink. A message the sink refuses on its
/// own (too large) is dropped; any other write failure cancels `lost`.
/// The returned token is cancelled once the writer has exited.
pub(crate) fn spawn_writer(
    mut sink: Box<dyn MessageSink>,
    lost: CancellationToken,
) -> (mpsc::UnboundedSender<Bytes>, CancellationToken) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let drained = CancellationToken::new();
    let guard = drained.clone().drop_guard();
    tokio::spawn(async move {
        let _guard = guard;
        while let Some(message) = rx.recv().await {
            match sink.send(message).await {
                Ok(()) => {}
                Err(err) if err.is_message_error() => {
                    warn!(error = %err, "dropping message the link refused");
                }
                Err(err) => {
                    debug!(error = %err, "link write failed");
                    lost.cancel();
                    return;
                }
            }
        }
        if let Err(err) = sink.close().await {
            debug!(error = %err, "link close failed");
        }
    });
    (tx, drained)
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn silence(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Process inbound messages on link `epoch` in arrival order until the link
/// ends, the connection shuts down or the peer goes quiet.
pub(crate) async fn read_loop(
    conn: &Arc<Connection>,
    stream: &mut dyn MessageStream,
    epoch: u64,
    lost: &CancellationToken,
    liveness: Liveness,
) -> DisconnectReason {
    let mut ping = liveness
        .interval
        .filter(|_| liveness.send_pings)
        .map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    let window = liveness.window();
    let mut deadline = window.map(|window| Instant::now() + window);
    let shutdown = conn.shutdown_token().clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return DisconnectReason::LocalClose,
            _ = lost.cancelled() => {
                return DisconnectReason::TransportError("write failed".to_string());
            }
            _ = next_ping(&mut ping) => {
                conn.send_control(&Frame::ping(), epoch);
            }
            _ = silence(deadline) => return DisconnectReason::PingTimeout,
            message = stream.recv() => match message {
                Ok(Some(message)) => {
                    if let Some(window) = window {
                        deadline = Some(Instant::now() + window);
                    }
                    if let Flow::Exit(reason) = conn.handle_inbound(&message, epoch) {
                        return reason;
                    }
                }
                Ok(None) => return DisconnectReason::TransportClose,
                Err(err) => return DisconnectReason::TransportError(err.to_string()),
            },
        }
    }
}
