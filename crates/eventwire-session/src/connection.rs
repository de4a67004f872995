//! Shared state of one logical connection.
//!
//! A [`Connection`] outlives the physical links it runs over. The client
//! lifecycle attaches a fresh link (a writer channel plus an epoch number)
//! after every successful handshake and detaches it when the link is lost;
//! everything else (channels, handlers, pending acks, the outbound queue)
//! stays put.
//!
//! Lock order is `outbound`, then `channels`, then the correlator. No lock
//! is held across an `.await` or while a handler runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use eventwire_codec::{Codec, Value};
use eventwire_frame::{decode_frame, encode_frame, Frame, FrameConfig, PacketKind, DEFAULT_CHANNEL};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth::ChannelGate;
use crate::config::{ClientConfig, OverflowPolicy, ServerConfig};
use crate::correlator::AckCorrelator;
use crate::dispatcher::{Dispatcher, ReplySender};
use crate::error::{Result, SessionError};
use crate::event::{ConnectionState, DisconnectReason, LifecycleEvent};
use crate::handshake::{channel_connect_payload, connect_auth, SessionInfo};
use crate::multiplexer::{ChannelState, ChannelTable};
use crate::queue::{OutboundQueue, PushOutcome, QueuedFrame};
use crate::socket::PendingCall;

const EVENT_BUFFER: usize = 256;

pub(crate) enum Role {
    Client,
    Server(Arc<ChannelGate>),
}

pub(crate) struct Settings {
    pub codec: Arc<dyn Codec>,
    pub frame: FrameConfig,
    pub auth_token: Option<String>,
    pub strict: bool,
    pub resume_pending: bool,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_pending_acks: usize,
}

impl Settings {
    pub(crate) fn client(config: &ClientConfig) -> Self {
        Self {
            codec: config.codec.clone(),
            frame: config.frame.clone(),
            auth_token: config.handshake.auth_token.clone(),
            strict: config.strict,
            resume_pending: config.resume_pending_on_reconnect,
            queue_capacity: config.outbound_queue_capacity,
            overflow: config.overflow,
            max_pending_acks: config.max_pending_acks,
        }
    }

    /// Server sockets never queue: a socket that is not open is closed for good.
    pub(crate) fn server(config: &ServerConfig) -> Self {
        Self {
            codec: config.codec.clone(),
            frame: config.frame.clone(),
            auth_token: None,
            strict: config.strict,
            resume_pending: false,
            queue_capacity: 0,
            overflow: OverflowPolicy::Reject,
            max_pending_acks: config.max_pending_acks,
        }
    }
}

/// Result of handling one inbound message.
pub(crate) enum Flow {
    Continue,
    Exit(DisconnectReason),
}

struct Link {
    tx: mpsc::UnboundedSender<Bytes>,
    epoch: u64,
}

struct Outbound {
    link: Option<Link>,
    queue: OutboundQueue,
}

impl Outbound {
    /// Hand bytes to the current link's writer. Returns the link epoch on success.
    fn write(&self, bytes: Bytes) -> Option<u64> {
        let link = self.link.as_ref()?;
        link.tx.send(bytes).ok().map(|()| link.epoch)
    }
}

pub(crate) struct Connection {
    role: Role,
    settings: Settings,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
    channels: ChannelTable,
    correlator: Arc<AckCorrelator>,
    dispatcher: Dispatcher,
    outbound: Mutex<Outbound>,
    session: Mutex<Option<SessionInfo>>,
    /// Cancelled when the writer of the most recent link has exited.
    drained: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(role: Role, settings: Settings, shutdown: CancellationToken) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let queue = OutboundQueue::new(settings.queue_capacity, settings.overflow);
        Arc::new(Self {
            role,
            correlator: AckCorrelator::new(settings.max_pending_acks),
            settings,
            state,
            events,
            channels: ChannelTable::new(),
            dispatcher: Dispatcher::new(),
            outbound: Mutex::new(Outbound { link: None, queue }),
            session: Mutex::new(None),
            drained: Mutex::new(None),
            shutdown,
        })
    }

    fn is_client(&self) -> bool {
        matches!(self.role, Role::Client)
    }

    pub(crate) fn codec(&self) -> &dyn Codec {
        self.settings.codec.as_ref()
    }

    pub(crate) fn frame_config(&self) -> &FrameConfig {
        &self.settings.frame
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub(crate) fn correlator(&self) -> &Arc<AckCorrelator> {
        &self.correlator
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn session_info(&self) -> Option<SessionInfo> {
        lock(&self.session).clone()
    }

    /// Writer-exit token of the most recent link, if one was ever attached.
    pub(crate) fn drained(&self) -> Option<CancellationToken> {
        lock(&self.drained).clone()
    }

    pub(crate) fn queued(&self) -> usize {
        lock(&self.outbound).queue.len()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Move to `next`. `Closed` is terminal. Returns whether the state changed.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = %next, "connection state changed");
        }
        changed
    }

    pub(crate) fn emit_event(&self, event: LifecycleEvent) {
        trace!(?event, "lifecycle event");
        let _ = self.events.send(event);
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_frame(frame, self.codec(), &self.settings.frame, &mut buf)?;
        Ok(buf.freeze())
    }

    fn validate_channel(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.settings.frame.max_channel_len {
            return Err(SessionError::InvalidChannel(name.to_string()));
        }
        Ok(())
    }

    /// Send an application frame, or queue it while its channel is not open.
    pub(crate) fn submit(&self, frame: Frame, ack: Option<u64>) -> Result<()> {
        let channel = frame.channel().to_string();
        let bytes = self.encode(&frame)?;

        let mut out = lock(&self.outbound);
        if self.state() == ConnectionState::Closed {
            return Err(SessionError::ChannelClosed(channel));
        }
        match self.channels.state(&channel) {
            Some(ChannelState::Closed) => return Err(SessionError::ChannelClosed(channel)),
            Some(ChannelState::Open) => {
                if let Some(epoch) = out.write(bytes.clone()) {
                    if let Some(id) = ack {
                        self.correlator.mark_sent(id, epoch);
                    }
                    trace!(channel = %channel, correlation_id = ?ack, epoch, "frame sent");
                    return Ok(());
                }
            }
            _ => {}
        }
        if !self.is_client() {
            return Err(SessionError::ChannelNotOpen(channel));
        }

        let capacity = out.queue.capacity();
        let outcome = out.queue.push(QueuedFrame {
            channel: channel.clone(),
            bytes,
            ack,
        });
        drop(out);
        match outcome {
            PushOutcome::Queued => {
                trace!(channel = %channel, correlation_id = ?ack, "frame queued");
                Ok(())
            }
            PushOutcome::Evicted(oldest) => {
                warn!(channel = %oldest.channel, capacity, "outbound queue full; dropped oldest frame");
                if let Some(id) = oldest.ack {
                    self.correlator.fail(id, SessionError::QueueFull { capacity });
                }
                Ok(())
            }
            PushOutcome::Dropped(newest) => {
                warn!(channel = %newest.channel, capacity, "outbound queue full; dropped frame");
                if let Some(id) = newest.ack {
                    self.correlator.fail(id, SessionError::QueueFull { capacity });
                }
                Ok(())
            }
            PushOutcome::Rejected => {
                warn!(channel = %channel, capacity, "outbound queue full; rejecting send");
                Err(SessionError::QueueFull { capacity })
            }
        }
    }

    /// Send a connection-scoped frame (PING, PONG, ack replies) on link `epoch` only.
    pub(crate) fn send_control(&self, frame: &Frame, epoch: u64) -> bool {
        let bytes = match self.encode(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, kind = %frame.kind(), "failed to encode frame");
                return false;
            }
        };
        let out = lock(&self.outbound);
        match &out.link {
            Some(link) if link.epoch == epoch => link.tx.send(bytes).is_ok(),
            _ => false,
        }
    }

    pub(crate) fn emit(&self, channel: &str, event: &str, args: Vec<Value>) -> Result<()> {
        self.submit(Frame::event(channel, event, args), None)
    }

    pub(crate) fn call(
        &self,
        channel: &str,
        event: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> PendingCall {
        if self.state() == ConnectionState::Closed
            || self.channels.state(channel) == Some(ChannelState::Closed)
        {
            return PendingCall::failed(SessionError::ChannelClosed(channel.to_string()));
        }
        let (id, rx) = match self.correlator.register(channel, timeout) {
            Ok(registered) => registered,
            Err(err) => return PendingCall::failed(err),
        };
        let call = PendingCall::new(id, rx, Arc::downgrade(&self.correlator));
        if let Err(err) = self.submit(Frame::ack_request(channel, id, event, args), Some(id)) {
            self.correlator.fail(id, err);
        }
        call
    }

    fn flush(&self, out: &mut Outbound, items: Vec<QueuedFrame>) {
        let total = items.len();
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            match out.write(item.bytes.clone()) {
                Some(epoch) => {
                    if let Some(id) = item.ack {
                        self.correlator.mark_sent(id, epoch);
                    }
                }
                None => {
                    let mut rest = vec![item];
                    rest.extend(items);
                    debug!(requeued = rest.len(), "link went away while flushing");
                    out.queue.restore_front(rest);
                    return;
                }
            }
        }
        if total > 0 {
            debug!(flushed = total, "flushed queued frames");
        }
    }

    /// Install a freshly handshaken link and bring the connection up.
    pub(crate) fn attach(
        &self,
        tx: mpsc::UnboundedSender<Bytes>,
        drained: CancellationToken,
        info: SessionInfo,
    ) {
        let epoch = info.epoch;
        let sid = info.sid.clone();
        {
            let mut out = lock(&self.outbound);
            if self.state() == ConnectionState::Closed {
                return;
            }
            *lock(&self.session) = Some(info);
            *lock(&self.drained) = Some(drained);
            out.link = Some(Link { tx, epoch });
            self.channels.set(DEFAULT_CHANNEL, ChannelState::Open);

            if self.is_client() {
                let payload = channel_connect_payload(self.settings.auth_token.as_deref());
                for name in self.channels.reconnect_targets() {
                    match self.encode(&Frame::connect(name.as_str(), payload.clone())) {
                        Ok(bytes) => {
                            out.write(bytes);
                            debug!(channel = %name, epoch, "channel connect sent");
                        }
                        Err(err) => warn!(channel = %name, error = %err, "failed to encode channel connect"),
                    }
                }
            }

            let queued = out.queue.take_channel(DEFAULT_CHANNEL);
            self.flush(&mut out, queued);
            self.set_state(ConnectionState::Open);
        }
        info!(sid = %sid, epoch, "connection open");
        self.emit_event(LifecycleEvent::Connect { sid });
    }

    /// Drop link `epoch` after it was lost. Channels fall back to pending and
    /// acks already written on that link fail unless configured to resume.
    pub(crate) fn detach(&self, epoch: u64, reason: DisconnectReason) -> bool {
        let suspended = {
            let mut out = lock(&self.outbound);
            if out.link.as_ref().map(|link| link.epoch) != Some(epoch) {
                return false;
            }
            out.link = None;
            self.channels.suspend_all()
        };
        self.set_state(ConnectionState::Reconnecting);
        let failed = if self.settings.resume_pending {
            0
        } else {
            self.correlator.fail_sent_in(epoch, SessionError::Disconnected)
        };
        warn!(%reason, epoch, failed, channels = suspended.len(), "connection lost");
        self.emit_event(LifecycleEvent::Disconnect { reason });
        true
    }

    /// Terminal close. Later calls are no-ops.
    pub(crate) fn terminate(
        &self,
        reason: Option<DisconnectReason>,
        notify_peer: bool,
        ack_error: impl Fn(u64) -> SessionError,
    ) {
        let previous = self.state();
        let goodbye = if notify_peer {
            self.encode(&Frame::disconnect(DEFAULT_CHANNEL)).ok()
        } else {
            None
        };
        let dropped = {
            let mut out = lock(&self.outbound);
            if !self.set_state(ConnectionState::Closed) {
                return;
            }
            if let Some(bytes) = goodbye {
                out.write(bytes);
            }
            out.link = None;
            out.queue.clear().len()
        };
        self.channels.close_all();
        self.shutdown.cancel();
        let failed = self.correlator.fail_all(ack_error);
        info!(reason = ?reason, failed, dropped, "connection closed");
        if previous == ConnectionState::Open {
            if let Some(reason) = reason {
                self.emit_event(LifecycleEvent::Disconnect { reason });
            }
        }
    }

    /// Open (or re-open) a channel. Clients send CONNECT now if a link is up,
    /// otherwise on the next attach.
    pub(crate) fn open_channel(&self, name: &str) -> Result<ChannelState> {
        self.validate_channel(name)?;
        let connect = if self.is_client() && name != DEFAULT_CHANNEL {
            let payload = channel_connect_payload(self.settings.auth_token.as_deref());
            Some(self.encode(&Frame::connect(name, payload))?)
        } else {
            None
        };

        let out = lock(&self.outbound);
        if self.state() == ConnectionState::Closed {
            return Err(SessionError::ChannelClosed(name.to_string()));
        }
        let (state, created) = self.channels.open(name);
        if created {
            if let Some(bytes) = connect {
                if out.write(bytes).is_some() {
                    debug!(channel = name, "channel connect sent");
                }
            }
        }
        Ok(state)
    }

    /// Peer confirmed a channel: open it and flush what was queued for it.
    fn confirm_channel(&self, name: &str) {
        {
            let mut out = lock(&self.outbound);
            if !self.channels.mark_open(name) {
                debug!(channel = name, "ignoring CONNECT_OK for a channel that is not pending");
                return;
            }
            let queued = out.queue.take_channel(name);
            self.flush(&mut out, queued);
        }
        info!(channel = name, "channel open");
        self.emit_event(LifecycleEvent::ChannelConnect {
            channel: name.to_string(),
        });
    }

    /// Close one channel: fail its acks, drop its handlers and queued frames.
    pub(crate) fn close_channel(&self, name: &str, notify_peer: bool) -> bool {
        let goodbye = if notify_peer {
            self.encode(&Frame::disconnect(name)).ok()
        } else {
            None
        };
        let dropped = {
            let mut out = lock(&self.outbound);
            if !self.channels.close(name) {
                return false;
            }
            if let Some(bytes) = goodbye {
                out.write(bytes);
            }
            out.queue.take_channel(name)
        };
        let handlers = self.dispatcher.remove_channel(name);
        let failed = self
            .correlator
            .fail_channel(name, |_| SessionError::ChannelClosed(name.to_string()));
        info!(channel = name, handlers, failed, dropped = dropped.len(), "channel closed");
        self.emit_event(LifecycleEvent::ChannelDisconnect {
            channel: name.to_string(),
        });
        true
    }

    fn reject_channel(&self, name: &str, message: String) {
        warn!(channel = name, %message, "peer rejected channel");
        self.emit_event(LifecycleEvent::ChannelError {
            channel: name.to_string(),
            message,
        });
        self.close_channel(name, false);
    }

    /// Server side of a channel CONNECT.
    fn join_channel(&self, frame: &Frame, epoch: u64) {
        let name = frame.channel();
        let Role::Server(gate) = &self.role else {
            warn!(channel = name, "ignoring CONNECT from server");
            return;
        };
        if name == DEFAULT_CHANNEL {
            warn!(epoch, "duplicate connection handshake; ignoring");
            return;
        }
        match gate.admit(name, connect_auth(frame)) {
            Ok(()) => {
                self.channels.set(name, ChannelState::Open);
                self.send_control(&Frame::connect_ok(name, Vec::new()), epoch);
                info!(channel = name, "client joined channel");
                self.emit_event(LifecycleEvent::ChannelConnect {
                    channel: name.to_string(),
                });
            }
            Err(message) => {
                warn!(channel = name, %message, "refusing channel join");
                self.send_control(&Frame::error(name, &message), epoch);
            }
        }
    }

    fn dispatch_event(self: &Arc<Self>, frame: Frame, epoch: u64) {
        let channel = frame.channel().to_string();
        let kind = frame.kind();
        // Servers only take events on joined channels and never record others.
        let state = match self.role {
            Role::Client => Some(self.channels.track_inbound(&channel)),
            Role::Server(_) => self.channels.route_inbound(&channel),
        };
        let accepted = match self.role {
            Role::Client => state != Some(ChannelState::Closed),
            Role::Server(_) => state == Some(ChannelState::Open),
        };
        if !accepted {
            warn!(channel = %channel, %kind, ?state, "event on a channel that is not open; dropping");
            return;
        }

        let correlation_id = frame.correlation_id();
        let Some((event, args)) = frame.into_event() else {
            return;
        };
        let reply = correlation_id.map(|id| {
            let conn = Arc::downgrade(self);
            let channel = channel.clone();
            Box::new(move |payload: Vec<Value>| {
                if let Some(conn) = conn.upgrade() {
                    conn.send_reply(&channel, id, payload, epoch);
                }
            }) as ReplySender
        });
        let invoked = self.dispatcher.dispatch(&channel, &event, args, reply);
        if invoked == 0 {
            debug!(channel = %channel, event = %event, ?correlation_id, "no handler registered; dropping");
        }
    }

    fn send_reply(&self, channel: &str, id: u64, payload: Vec<Value>, epoch: u64) {
        let frame = Frame::ack_reply(channel, id, payload);
        if !self.send_control(&frame, epoch) {
            debug!(channel, correlation_id = id, epoch, "reply dropped; connection instance is gone");
        }
    }

    /// Decode and act on one inbound message from link `epoch`.
    pub(crate) fn handle_inbound(self: &Arc<Self>, message: &[u8], epoch: u64) -> Flow {
        let frame = match decode_frame(message, self.codec(), &self.settings.frame) {
            Ok(frame) => frame,
            Err(err) if self.settings.strict => {
                warn!(error = %err, epoch, "malformed frame in strict mode; dropping connection");
                return Flow::Exit(DisconnectReason::ProtocolError(err.to_string()));
            }
            Err(err) => {
                warn!(error = %err, epoch, "dropping malformed frame");
                return Flow::Continue;
            }
        };
        trace!(
            kind = %frame.kind(),
            channel = frame.channel(),
            correlation_id = ?frame.correlation_id(),
            epoch,
            "inbound frame"
        );

        match frame.kind() {
            PacketKind::Ping => {
                self.send_control(&Frame::pong(), epoch);
            }
            PacketKind::Pong => {}
            PacketKind::Connect => self.join_channel(&frame, epoch),
            PacketKind::ConnectOk => {
                if self.is_client() && frame.channel() != DEFAULT_CHANNEL {
                    self.confirm_channel(frame.channel());
                }
            }
            PacketKind::Event | PacketKind::AckRequest => self.dispatch_event(frame, epoch),
            PacketKind::AckReply => {
                if let Some(id) = frame.correlation_id() {
                    let channel = frame.channel().to_string();
                    self.correlator.resolve(id, &channel, frame.into_payload());
                }
            }
            PacketKind::Disconnect => {
                if frame.channel() == DEFAULT_CHANNEL {
                    return Flow::Exit(DisconnectReason::RemoteClose);
                }
                self.close_channel(frame.channel(), false);
            }
            PacketKind::Error => {
                let message = frame.message().unwrap_or("unspecified error").to_string();
                if frame.channel() == DEFAULT_CHANNEL {
                    warn!(%message, "peer reported a connection error");
                    self.emit_event(LifecycleEvent::ChannelError {
                        channel: DEFAULT_CHANNEL.to_string(),
                        message,
                    });
                } else {
                    self.reject_channel(frame.channel(), message);
                }
            }
        }
        Flow::Continue
    }
}
