//! Transport module - byte streams the framing runs over.
//!
//! Provides abstraction over:
//! - TCP sockets
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! Both transports carry the same length-prefixed frames; nothing above this
//! module knows which one it is talking to.

mod pipe;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{GroundlinkError, Result};

pub use pipe::{connect_pipe, generate_pipe_path, ipc_path_for, PipeListener, PipeStream};

/// Any connected byte stream.
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// Boxed connected stream, TCP or IPC.
pub type BoxedStream = Box<dyn StreamTrait>;

/// Where to connect or listen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP `host:port`.
    Tcp(String),
    /// Local IPC path (socket file or pipe name).
    Ipc(String),
}

impl Endpoint {
    /// TCP endpoint.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// IPC endpoint at an explicit path.
    pub fn ipc(path: impl Into<String>) -> Self {
        Endpoint::Ipc(path.into())
    }

    /// IPC endpoint at the well-known path for `id`.
    pub fn ipc_id(id: &str) -> Self {
        Endpoint::Ipc(ipc_path_for(id))
    }

    /// Open a connection to this endpoint.
    pub async fn connect(&self) -> io::Result<BoxedStream> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Endpoint::Ipc(path) => Ok(Box::new(connect_pipe(path).await?)),
        }
    }

    /// Start listening on this endpoint.
    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Endpoint::Ipc(path) => Ok(Listener::Ipc(PipeListener::bind(path).await?)),
        }
    }

    /// True if `err` from [`Endpoint::connect`] means nobody is listening
    /// yet, as opposed to a hard failure.
    pub fn is_not_listening(&self, err: &io::Error) -> bool {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => true,
            io::ErrorKind::NotFound => matches!(self, Endpoint::Ipc(_)),
            _ => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path),
        }
    }
}

impl FromStr for Endpoint {
    type Err = GroundlinkError;

    /// `tcp://host:port`, `ipc://path`, `unix://path`, or a bare path.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.rsplit_once(':').map_or(true, |(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(GroundlinkError::Transport(format!(
                    "Invalid TCP endpoint '{}': expected tcp://host:port",
                    s
                )));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }

        let path = s
            .strip_prefix("ipc://")
            .or_else(|| s.strip_prefix("unix://"))
            .unwrap_or(s);

        if path.is_empty() {
            return Err(GroundlinkError::Transport("Empty IPC path".into()));
        }

        Ok(Endpoint::Ipc(path.to_string()))
    }
}

/// Bound listener for either transport.
pub enum Listener {
    Tcp(TcpListener),
    Ipc(PipeListener),
}

impl Listener {
    /// Accept the next connection and describe its peer.
    pub async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), addr.to_string()))
            }
            Listener::Ipc(listener) => {
                let stream = listener.accept().await?;
                Ok((Box::new(stream), listener.path().to_string()))
            }
        }
    }

    /// The endpoint actually bound (resolves TCP port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Listener::Ipc(listener) => Ok(Endpoint::Ipc(listener.path().to_string())),
        }
    }

    /// Local TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Ipc(_) => None,
        }
    }
}
