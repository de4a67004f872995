use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use eventwire_codec::Value;
use eventwire_frame::DEFAULT_CHANNEL;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::connection::Connection;
use crate::correlator::{AckCorrelator, AckOutcome};
use crate::dispatcher::{Handler, HandlerId, IntoReply};
use crate::error::{Result, SessionError};
use crate::event::{ConnectionState, DisconnectReason, LifecycleEvent};
use crate::handshake::SessionInfo;
use crate::multiplexer::ChannelState;
use crate::registry::{fan_out, Registry};

/// The reply to a [`Socket::call`] or [`ChannelHandle::call`].
///
/// Resolves with the peer's reply, or fails with `AckTimeout`, `Cancelled`,
/// `ChannelClosed`, `Disconnected` or `QueueFull`. Dropping an unfinished
/// call cancels it.
#[must_use = "a call does nothing useful unless awaited"]
pub struct PendingCall {
    id: Option<u64>,
    rx: Option<oneshot::Receiver<AckOutcome>>,
    early: Option<SessionError>,
    correlator: Weak<AckCorrelator>,
    done: bool,
}

impl PendingCall {
    pub(crate) fn new(
        id: u64,
        rx: oneshot::Receiver<AckOutcome>,
        correlator: Weak<AckCorrelator>,
    ) -> Self {
        Self {
            id: Some(id),
            rx: Some(rx),
            early: None,
            correlator,
            done: false,
        }
    }

    /// A call that failed before it was registered.
    pub(crate) fn failed(err: SessionError) -> Self {
        Self {
            id: None,
            rx: None,
            early: Some(err),
            correlator: Weak::new(),
            done: false,
        }
    }

    /// Correlation id, if the call was registered.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Cancel the call. Returns false if it already completed.
    pub fn cancel(&self) -> bool {
        match (self.id, self.correlator.upgrade()) {
            (Some(id), Some(correlator)) if !self.done => correlator.cancel(id),
            _ => false,
        }
    }
}

impl Future for PendingCall {
    type Output = std::result::Result<Vec<Value>, SessionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(err) = this.early.take() {
            this.done = true;
            return Poll::Ready(Err(err));
        }
        let id = this.id.unwrap_or_default();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(SessionError::Cancelled(id)));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(outcome) => {
                this.done = true;
                this.rx = None;
                Poll::Ready(outcome.unwrap_or(Err(SessionError::Cancelled(id))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let (Some(id), Some(correlator)) = (self.id, self.correlator.upgrade()) {
            if correlator.cancel(id) {
                debug!(correlation_id = id, "unfinished call dropped; cancelled");
            }
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// A handle scoped to one channel of a socket.
#[derive(Clone)]
pub struct ChannelHandle {
    conn: Arc<Connection>,
    name: String,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Option<ChannelState> {
        self.conn.channels().state(&self.name)
    }

    /// Register a synchronous handler. Its return value (`()`, `Vec<Value>`
    /// or `Option<Vec<Value>>`) is the ack reply when the event is a call.
    pub fn on<F, R>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Vec<Value>) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        self.conn
            .dispatcher()
            .on(&self.name, event, Handler::sync(handler))
    }

    /// Register an async handler; the future runs on its own task.
    pub fn on_async<F, Fut>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoReply,
    {
        self.conn
            .dispatcher()
            .on(&self.name, event, Handler::from_async(handler))
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.conn.dispatcher().off(&self.name, event, id)
    }

    /// Fire-and-forget. Queued while the channel is not open.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.conn.emit(&self.name, event, args)
    }

    /// Send an event that expects a reply within `timeout`.
    ///
    /// Fails with `NoRuntime` outside a Tokio runtime, like [`Socket::call`].
    pub fn call(&self, event: &str, args: Vec<Value>, timeout: Duration) -> PendingCall {
        self.conn.call(&self.name, event, args, timeout)
    }

    /// Leave the channel. Pending calls on it fail with `ChannelClosed` and its
    /// handlers are removed. Closing the default channel closes the socket.
    pub fn close(&self) {
        if self.name == DEFAULT_CHANNEL {
            close_connection(&self.conn);
        } else {
            self.conn.close_channel(&self.name, true);
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn close_connection(conn: &Connection) {
    conn.terminate(Some(DisconnectReason::LocalClose), true, |_| {
        SessionError::ChannelClosed(DEFAULT_CHANNEL.to_string())
    });
}

/// One logical connection: a client connection that reconnects, or a server
/// side socket for one accepted peer.
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct Socket {
    conn: Arc<Connection>,
    default: ChannelHandle,
    /// Set on server-side sockets only.
    registry: Option<Weak<Registry>>,
}

impl Socket {
    pub(crate) fn new(conn: Arc<Connection>, channel: &str) -> Self {
        let default = ChannelHandle {
            conn: conn.clone(),
            name: channel.to_string(),
        };
        Self {
            conn,
            default,
            registry: None,
        }
    }

    pub(crate) fn served(conn: Arc<Connection>, channel: &str, registry: &Arc<Registry>) -> Self {
        Self {
            registry: Some(Arc::downgrade(registry)),
            ..Self::new(conn, channel)
        }
    }

    fn registry(&self) -> Result<Arc<Registry>> {
        self.registry
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SessionError::ServerOnly)
    }

    /// Session id of the current (or last) connection instance.
    pub fn id(&self) -> Option<String> {
        self.conn.session_info().map(|info| info.sid)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.conn.session_info()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Remote address of the current (or last) link.
    pub fn peer(&self) -> Option<String> {
        self.conn.session_info().map(|info| info.peer)
    }

    pub fn default_channel(&self) -> &str {
        self.default.name()
    }

    /// Open (or look up) a channel. Clients send CONNECT for it now or on the
    /// next (re)connect.
    pub fn channel(&self, name: &str) -> Result<ChannelHandle> {
        self.conn.open_channel(name)?;
        Ok(ChannelHandle {
            conn: self.conn.clone(),
            name: name.to_string(),
        })
    }

    pub fn on<F, R>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Vec<Value>) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        self.default.on(event, handler)
    }

    pub fn on_async<F, Fut>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoReply,
    {
        self.default.on_async(event, handler)
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.default.off(event, id)
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.default.emit(event, args)
    }

    pub(crate) fn emit_on(&self, channel: &str, event: &str, args: Vec<Value>) -> Result<()> {
        self.conn.emit(channel, event, args)
    }

    /// Send an event on the default channel that expects a reply within
    /// `timeout`.
    ///
    /// The deadline runs on the current Tokio runtime. Outside one the call
    /// fails at once with `NoRuntime`.
    pub fn call(&self, event: &str, args: Vec<Value>, timeout: Duration) -> PendingCall {
        self.default.call(event, args, timeout)
    }

    /// Add this socket to `room`. Only server-side sockets have rooms, and a
    /// disconnected socket can no longer join.
    pub fn join(&self, room: &str) -> Result<()> {
        let registry = self.registry()?;
        let sid = self.id().unwrap_or_default();
        if !registry.join(room, &sid) {
            return Err(SessionError::ChannelClosed(DEFAULT_CHANNEL.to_string()));
        }
        debug!(sid = %sid, room, "joined room");
        Ok(())
    }

    /// Remove this socket from `room`. Returns whether it was a member.
    pub fn leave(&self, room: &str) -> Result<bool> {
        let registry = self.registry()?;
        let sid = self.id().unwrap_or_default();
        Ok(registry.leave(room, &sid))
    }

    /// Rooms this socket belongs to. Empty on client sockets.
    pub fn rooms(&self) -> Vec<String> {
        match (self.registry(), self.id()) {
            (Ok(registry), Some(sid)) => registry.rooms_of(&sid),
            _ => Vec::new(),
        }
    }

    /// Emit to every other member of `room`. Returns how many sockets took it.
    pub fn broadcast_to(&self, room: &str, event: &str, args: Vec<Value>) -> Result<usize> {
        let registry = self.registry()?;
        let own = self.id();
        let others = registry
            .members(room)
            .into_iter()
            .filter(|member| member.id() != own)
            .collect();
        Ok(fan_out(others, event, &args))
    }

    /// Close for good: tell the peer, stop reconnecting, fail pending calls.
    pub fn close(&self) {
        close_connection(&self.conn);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.conn.subscribe()
    }

    /// Wait until the state is `target` (or `Closed`, which never changes).
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.conn.watch_state();
        let reached = rx
            .wait_for(|state| *state == target || *state == ConnectionState::Closed)
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Wait until the socket is closed and everything written before the
    /// close (the DISCONNECT included) has been handed to the transport.
    pub async fn closed(&self) {
        self.wait_for_state(ConnectionState::Closed).await;
        if let Some(drained) = self.conn.drained() {
            drained.cancelled().await;
        }
    }

    pub fn channels(&self) -> Vec<(String, ChannelState)> {
        self.conn.channels().snapshot()
    }

    pub fn pending_acks(&self) -> usize {
        self.conn.correlator().len()
    }

    /// Frames waiting in the outbound queue.
    pub fn queued_frames(&self) -> usize {
        self.conn.queued()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("channel", &self.default.name)
            .finish()
    }
}
