//! Upstream address parsing and dialing.
//!
//! The upstream URL's scheme selects the dial network: `unix` treats the
//! path as a socket path, `tcp` treats the authority as host:port.

use monoio::BufResult;
use monoio::buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut};
use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoio::net::{TcpStream, UnixStream};
use plugboard_core::ProxyError;
use std::path::PathBuf;

/// Parsed upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    /// UNIX-domain socket path, e.g. `unix:///var/run/docker.sock`.
    Unix(PathBuf),
    /// TCP host:port, e.g. `tcp://127.0.0.1:2375`.
    Tcp(String),
}

impl UpstreamAddr {
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ProxyError::Config(format!("upstream has no socket path: {url}")));
            }
            return Ok(UpstreamAddr::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = url.strip_prefix("tcp://") {
            let hostport = rest.split('/').next().unwrap_or("");
            if hostport.is_empty() {
                return Err(ProxyError::Config(format!("upstream has no host:port: {url}")));
            }
            return Ok(UpstreamAddr::Tcp(hostport.to_string()));
        }
        Err(ProxyError::Config(format!(
            "upstream scheme must be unix:// or tcp://: {url}"
        )))
    }
}

impl std::fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            UpstreamAddr::Tcp(hostport) => write!(f, "tcp://{hostport}"),
        }
    }
}

/// A connected upstream, TCP or UNIX, behind one rent-IO surface.
pub enum UpstreamStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Open a connection to the upstream.
pub async fn dial(addr: &UpstreamAddr) -> Result<UpstreamStream, ProxyError> {
    match addr {
        UpstreamAddr::Tcp(hostport) => {
            let stream = TcpStream::connect(hostport.as_str())
                .await
                .map_err(ProxyError::UpstreamDial)?;
            let _ = stream.set_nodelay(true);
            Ok(UpstreamStream::Tcp(stream))
        }
        UpstreamAddr::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(ProxyError::UpstreamDial)?;
            Ok(UpstreamStream::Unix(stream))
        }
    }
}

impl AsyncReadRent for UpstreamStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(s) => s.read(buf).await,
            UpstreamStream::Unix(s) => s.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(s) => s.readv(buf).await,
            UpstreamStream::Unix(s) => s.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for UpstreamStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(s) => s.write(buf).await,
            UpstreamStream::Unix(s) => s.write(buf).await,
        }
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(s) => s.writev(buf_vec).await,
            UpstreamStream::Unix(s) => s.writev(buf_vec).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            UpstreamStream::Tcp(s) => s.flush().await,
            UpstreamStream::Unix(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            UpstreamStream::Tcp(s) => s.shutdown().await,
            UpstreamStream::Unix(s) => s.shutdown().await,
        }
    }
}
