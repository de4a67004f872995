//! Event sessions over a single connection.
//!
//! This is the layer applications talk to. A [`Socket`] multiplexes named
//! channels over one transport link, dispatches inbound events to
//! registered handlers, correlates acknowledgement replies with their calls,
//! and (on the client side) reconnects with exponential backoff while
//! keeping handlers, queued sends and channel memberships intact.
//!
//! Clients start with [`connect`]; servers wrap an acceptor in a [`Server`].

pub mod auth;
pub mod client;
pub mod config;
mod connection;
pub mod correlator;
pub mod dispatcher;
mod driver;
pub mod error;
pub mod event;
pub mod handshake;
pub mod multiplexer;
mod queue;
mod registry;
pub mod server;
pub mod socket;

pub use auth::{AllowAll, Authorizer, INVALID_NAMESPACE};
pub use client::{connect, connect_with_events};
pub use config::{
    Backoff, ClientConfig, OverflowPolicy, ReconnectPolicy, ServerConfig,
    DEFAULT_MAX_PENDING_ACKS, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
pub use correlator::{AckCorrelator, AckOutcome};
pub use dispatcher::{Dispatcher, Handler, HandlerId, IntoReply, ReplySender};
pub use error::{Result, SessionError};
pub use event::{ConnectionState, DisconnectReason, LifecycleEvent};
pub use handshake::{
    is_version_compatible, ConnectAccept, ConnectRequest, HandshakeConfig, SessionInfo,
    PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use multiplexer::{ChannelState, ChannelTable};
pub use server::{Server, ServerHandle};
pub use socket::{ChannelHandle, PendingCall, Socket};

pub use eventwire_codec::{CodecKind, Value};
pub use eventwire_frame::DEFAULT_CHANNEL;
