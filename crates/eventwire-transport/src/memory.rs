//! In-process transport over tokio channels.
//!
//! Each link is a pair of unbounded message queues sharing one cancellation
//! token. Closing a sink is graceful: the peer drains what was sent and then
//! sees end of stream. Severing a link ([`MemoryConnector::sever_all`]) is
//! abrupt: both directions fail at once, like a dropped network connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{Acceptor, BoxFuture, Connector, MessageSink, MessageStream, Transport};

/// Outbound half of an in-memory link.
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    token: CancellationToken,
}

/// Inbound half of an in-memory link.
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
}

impl MessageSink for MemorySink {
    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        let result = match &self.tx {
            Some(tx) if !self.token.is_cancelled() => {
                tx.send(message).map_err(|_| TransportError::Closed)
            }
            _ => Err(TransportError::Closed),
        };
        Box::pin(std::future::ready(result))
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.tx = None;
        Box::pin(std::future::ready(Ok(())))
    }
}

impl MessageStream for MemoryStream {
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Ok(None),
                message = self.rx.recv() => Ok(message),
            }
        })
    }
}

fn linked(token: CancellationToken) -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let left = Transport::new(
        MemorySink {
            tx: Some(a_tx),
            token: token.clone(),
        },
        MemoryStream {
            rx: b_rx,
            token: token.clone(),
        },
        "memory:right",
    );
    let right = Transport::new(
        MemorySink {
            tx: Some(b_tx),
            token: token.clone(),
        },
        MemoryStream { rx: a_rx, token },
        "memory:left",
    );
    (left, right)
}

/// Create a connected pair of in-memory transports.
pub fn pair() -> (Transport, Transport) {
    linked(CancellationToken::new())
}

/// Create an in-memory listener: a cloneable connector and its acceptor.
pub fn listener(name: impl Into<String>) -> (MemoryConnector, MemoryAcceptor) {
    let name = name.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        shared: Arc::new(ConnectorShared {
            incoming: tx,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            live: Mutex::new(Vec::new()),
            name: name.clone(),
        }),
    };
    let acceptor = MemoryAcceptor { incoming: rx, name };
    (connector, acceptor)
}

struct ConnectorShared {
    incoming: mpsc::UnboundedSender<Transport>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
    live: Mutex<Vec<CancellationToken>>,
    name: String,
}

/// Client side of an in-memory listener.
///
/// Clones share state, so a test can keep one clone to inject faults while
/// the session owns another.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<ConnectorShared>,
}

impl MemoryConnector {
    /// Make subsequent connect attempts fail with [`TransportError::Refused`].
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of connect attempts made so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Abruptly break every live link created by this connector.
    pub fn sever_all(&self) -> usize {
        let mut live = self
            .shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = live.iter().filter(|t| !t.is_cancelled()).count();
        for token in live.drain(..) {
            token.cancel();
        }
        debug!(listener = %self.shared.name, count, "severed memory links");
        count
    }

    fn open_link(&self) -> Result<Transport> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Refused);
        }
        let token = CancellationToken::new();
        let (client, server) = linked(token.clone());
        self.shared
            .incoming
            .send(server)
            .map_err(|_| TransportError::Refused)?;
        let mut live = self
            .shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        live.retain(|t| !t.is_cancelled());
        live.push(token);
        Ok(client)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(std::future::ready(self.open_link()))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.shared.name)
    }
}

/// Server side of an in-memory listener.
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<Transport>,
    name: String,
}

impl Acceptor for MemoryAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move { self.incoming.recv().await.ok_or(TransportError::Shutdown) })
    }

    fn local_addr(&self) -> String {
        format!("memory://{}", self.name)
    }
}
