//! Host stdio connections.
//!
//! The host listens on one port per standard stream; the agent dials each
//! configured port over its transport and hands the resulting connections
//! to a relay.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use gcs_shared::constants::network::VMADDR_CID_HOST;
use gcs_shared::{GcsError, GcsResult, ResultExt, Transport};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{debug, info};

/// Host ports for each standard stream. `None` leaves the stream unconnected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionSettings {
    pub stdin: Option<u32>,
    pub stdout: Option<u32>,
    pub stderr: Option<u32>,
}

/// One connected socket to the host.
pub enum Connection {
    Vsock(VsockStream),
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Connection::Vsock(_) => "vsock",
            Connection::Unix(_) => "unix",
            Connection::Tcp(_) => "tcp",
        };
        f.debug_struct("Connection")
            .field("kind", &kind)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Connection::Vsock(s) => s.as_raw_fd(),
            Connection::Unix(s) => s.as_raw_fd(),
            Connection::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Vsock(s) => Pin::new(s).poll_flush(cx),
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connect to a single host endpoint.
pub async fn dial(endpoint: &Transport) -> io::Result<Connection> {
    let conn = match endpoint {
        Transport::Vsock { port } => {
            Connection::Vsock(VsockStream::connect(VsockAddr::new(VMADDR_CID_HOST, *port)).await?)
        }
        Transport::Unix { socket_path } => Connection::Unix(UnixStream::connect(socket_path).await?),
        Transport::Tcp { port } => {
            Connection::Tcp(TcpStream::connect(("127.0.0.1", *port)).await?)
        }
    };
    debug!(endpoint = %endpoint, "connected to host");
    Ok(conn)
}

/// Signal readiness by connecting once to the host's notify endpoint.
///
/// The connection itself is the signal; no data is sent.
pub async fn notify_host_ready(endpoint: &Transport) -> GcsResult<()> {
    info!("Notifying host via {}", endpoint);
    let _conn = dial(endpoint)
        .await
        .with_context(|| format!("failed to connect to notify endpoint {}", endpoint))?;
    info!("Host notified successfully");
    Ok(())
}

/// The connections for one process's standard streams.
#[derive(Debug, Default)]
pub struct StdioSet {
    pub stdin: Option<Connection>,
    pub stdout: Option<Connection>,
    pub stderr: Option<Connection>,
}

impl StdioSet {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }

    /// Drop every connection, closing the sockets.
    pub fn close(&mut self) {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
    }
}

/// Opens a [`StdioSet`] for connection settings.
#[async_trait]
pub trait StdioConnector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> GcsResult<StdioSet>;
}

/// Dials host ports over the agent transport.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    transport: Transport,
}

impl TransportConnector {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    async fn dial_port(&self, port: Option<u32>, stream: &str) -> GcsResult<Option<Connection>> {
        let Some(port) = port else {
            return Ok(None);
        };
        let endpoint = self
            .transport
            .with_port(port)
            .map_err(GcsError::InvalidRequest)?;
        let conn = dial(&endpoint)
            .await
            .with_context(|| format!("failed to connect {} to {}", stream, endpoint))?;
        Ok(Some(conn))
    }
}

#[async_trait]
impl StdioConnector for TransportConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> GcsResult<StdioSet> {
        // A failure drops the connections opened so far.
        let stdin = self.dial_port(settings.stdin, "stdin").await?;
        let stdout = self.dial_port(settings.stdout, "stdout").await?;
        let stderr = self.dial_port(settings.stderr, "stderr").await?;
        Ok(StdioSet {
            stdin,
            stdout,
            stderr,
        })
    }
}
