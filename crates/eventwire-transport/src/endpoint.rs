use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::codec::MessageConfig;
use crate::error::{Result, TransportError};
use crate::stream::{TcpAcceptor, TcpConnector};
use crate::traits::{Acceptor, Connector};

/// A parsed stream endpoint.
///
/// Accepted forms: `tcp://host:port`, `unix:///path/to.sock`, a bare
/// `host:port`, or a bare filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// A connector that opens a fresh link on every call.
    pub fn connector(&self, config: MessageConfig) -> Result<Box<dyn Connector>> {
        match self {
            Endpoint::Tcp(addr) => Ok(Box::new(TcpConnector::with_config(addr.clone(), config))),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(crate::uds::UnixConnector::with_config(
                path.clone(),
                config,
            ))),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    /// Bind an acceptor. Must run inside a tokio runtime.
    pub async fn bind(&self, config: MessageConfig) -> Result<Box<dyn Acceptor>> {
        match self {
            Endpoint::Tcp(addr) => Ok(Box::new(TcpAcceptor::bind(addr, config).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(crate::uds::UnixAcceptor::bind(path, config)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return parse_tcp(addr).ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if s.contains("://") {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        if s.contains('/') || s.ends_with(".sock") {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        parse_tcp(s).ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))
    }
}

fn parse_tcp(addr: &str) -> Option<Endpoint> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(Endpoint::Tcp(addr.to_string()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
