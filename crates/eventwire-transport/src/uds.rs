use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::codec::MessageConfig;
use crate::error::{Result, TransportError};
use crate::stream::framed_transport;
use crate::traits::{Acceptor, BoxFuture, Connector, Transport};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Default permission mode for created socket paths.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

fn bind_error(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Bind {
        endpoint: path.display().to_string(),
        source,
    }
}

/// Accepts connections on a filesystem-path Unix domain socket.
///
/// A stale socket file at the path is replaced on bind; any other kind of
/// file is left alone and the bind fails. The socket file is removed on drop
/// unless something else has replaced it in the meantime.
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
    config: MessageConfig,
}

impl UnixAcceptor {
    /// Bind with the default 0600 mode. Must run inside a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, config: MessageConfig) -> Result<Self> {
        Self::bind_with_mode(path, DEFAULT_SOCKET_MODE, config)
    }

    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32, config: MessageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_error(&path, e))?;
            } else {
                return Err(bind_error(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_error(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_error(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_error(&path, e))?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: (created.dev(), created.ino()),
            config,
        })
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Acceptor for UnixAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(TransportError::Accept)?;
            debug!(path = ?self.path, "accepted unix connection");
            Ok(framed_transport(
                stream,
                &self.config,
                format!("unix:{}", self.path.display()),
            ))
        })
    }

    fn local_addr(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

/// Connects to a Unix domain socket path.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    config: MessageConfig,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, MessageConfig::default())
    }

    pub fn with_config(path: impl Into<PathBuf>, config: MessageConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

impl Connector for UnixConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            check_path_len(&self.path)?;
            let stream = UnixStream::connect(&self.path)
                .await
                .map_err(|source| TransportError::Connect {
                    endpoint: self.path.display().to_string(),
                    source,
                })?;
            debug!(path = ?self.path, "connected to unix domain socket");
            Ok(framed_transport(
                stream,
                &self.config,
                format!("unix:{}", self.path.display()),
            ))
        })
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}
