use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;

/// Boxed `Send` future, used to keep the transport traits object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound half of a link.
pub trait MessageSink: Send {
    /// Send one whole message.
    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Flush and close the outbound direction. The peer observes end of stream.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Inbound half of a link.
pub trait MessageStream: Send {
    /// Receive the next whole message.
    ///
    /// `Ok(None)` means the peer closed the link; an error means the link
    /// failed. Both are the connectivity-loss notification.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;
}

/// An established duplex link.
pub struct Transport {
    pub sink: Box<dyn MessageSink>,
    pub stream: Box<dyn MessageStream>,
    /// Human-readable description of the remote side.
    pub peer: String,
}

impl Transport {
    pub fn new(
        sink: impl MessageSink + 'static,
        stream: impl MessageStream + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    pub fn into_parts(self) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        (self.sink, self.stream)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

/// Client-side factory: every call opens a fresh link to the same remote.
///
/// The session layer calls this again on each reconnect attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Transport>>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

impl<C: Connector + ?Sized> Connector for Box<C> {
    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        (**self).connect()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Server-side source of inbound links.
pub trait Acceptor: Send {
    fn accept(&mut self) -> BoxFuture<'_, Result<Transport>>;

    /// Where this acceptor listens, for logs.
    fn local_addr(&self) -> String;
}
