//! Message transport boundary for eventwire.
//!
//! The session layer only needs a duplex stream of whole messages plus a
//! close signal. This crate provides that contract ([`MessageSink`],
//! [`MessageStream`], [`Connector`], [`Acceptor`]) and three implementations:
//! - an in-memory pair for tests and embedding
//! - TCP streams with length-prefixed message framing
//! - Unix domain sockets with the same framing
//!
//! Raw websocket framing, long-polling fallback and TLS live outside the core
//! and plug in through the same traits.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod stream;
pub mod traits;
#[cfg(unix)]
pub mod uds;

pub use codec::{MessageCodec, MessageConfig, DEFAULT_MAX_MESSAGE, HEADER_SIZE, MAGIC};
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use stream::{framed_transport, TcpAcceptor, TcpConnector};
pub use traits::{Acceptor, BoxFuture, Connector, MessageSink, MessageStream, Transport};

#[cfg(unix)]
pub use uds::{UnixAcceptor, UnixConnector};
