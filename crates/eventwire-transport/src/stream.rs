use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::codec::{MessageCodec, MessageConfig};
use crate::error::{Result, TransportError};
use crate::traits::{Acceptor, BoxFuture, Connector, MessageSink, MessageStream, Transport};

struct FramedSink<T> {
    inner: SplitSink<Framed<T, MessageCodec>, Bytes>,
}

struct FramedStream<T> {
    inner: SplitStream<Framed<T, MessageCodec>>,
}

impl<T> MessageSink for FramedSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.send(message))
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.close())
    }
}

impl<T> MessageStream for FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move { self.inner.next().await.transpose() })
    }
}

/// Wrap any async byte stream in the length-prefixed message framing.
pub fn framed_transport<T>(io: T, config: &MessageConfig, peer: impl Into<String>) -> Transport
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = Framed::new(io, MessageCodec::new(config)).split();
    Transport::new(
        FramedSink { inner: sink },
        FramedStream { inner: stream },
        peer,
    )
}

/// Connects to a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    config: MessageConfig,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(addr, MessageConfig::default())
    }

    pub fn with_config(addr: impl Into<String>, config: MessageConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            let stream =
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|source| TransportError::Connect {
                        endpoint: self.addr.clone(),
                        source,
                    })?;
            stream.set_nodelay(true)?;
            debug!(addr = %self.addr, "connected over tcp");
            Ok(framed_transport(stream, &self.config, self.addr.clone()))
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Accepts TCP connections.
pub struct TcpAcceptor {
    listener: TcpListener,
    config: MessageConfig,
    local: String,
}

impl TcpAcceptor {
    /// Bind a TCP listener. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str, config: MessageConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?.to_string();
        info!(addr = %local, "listening on tcp");
        Ok(Self {
            listener,
            config,
            local,
        })
    }

    /// The bound socket address, with the resolved port.
    pub fn local_socket_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(TransportError::Accept)?;
            stream.set_nodelay(true)?;
            debug!(%peer, "accepted tcp connection");
            Ok(framed_transport(stream, &self.config, peer.to_string()))
        })
    }

    fn local_addr(&self) -> String {
        format!("tcp://{}", self.local)
    }
}
