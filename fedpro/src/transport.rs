//! Transport connector: dials the RTI and splits the stream into a framed
//! reader (owned by the dispatch loop) and a shared, lock-serialized writer.
//!
//! Any `AsyncRead + AsyncWrite` stream can carry a session, so TCP, unix
//! sockets and in-memory duplex pipes all go through [`Connection::from_stream`].

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::wire::{CodecError, Frame, FrameCodec, MalformedFrame};

/// Port the RTI listens on when an endpoint does not name one.
pub const DEFAULT_PORT: u16 = 15164;

const TCP_SCHEME: &str = "tcp://";
#[cfg(unix)]
const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint is empty")]
    Empty,

    #[error("unsupported endpoint scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// Where the RTI listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    fn parse_host_port(s: &str) -> Result<Self, EndpointError> {
        // [v6]:port or [v6]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::InvalidPort(s.to_string()))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => match tail.strip_prefix(':') {
                    Some(port) => parse_port(port, s)?,
                    None => return Err(EndpointError::InvalidPort(s.to_string())),
                },
            };
            return Ok(Self::tcp(host, port));
        }

        match s.matches(':').count() {
            0 => Ok(Self::tcp(s, DEFAULT_PORT)),
            1 => {
                let (host, port) = s
                    .rsplit_once(':')
                    .ok_or_else(|| EndpointError::InvalidPort(s.to_string()))?;
                if host.is_empty() {
                    return Err(EndpointError::Empty);
                }
                Ok(Self::tcp(host, parse_port(port, s)?))
            }
            // Bare IPv6 literal without brackets.
            _ => Ok(Self::tcp(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, EndpointError> {
    port.parse::<u16>()
        .map_err(|_| EndpointError::InvalidPort(input.to_string()))
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }
        if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            if rest.is_empty() {
                return Err(EndpointError::Empty);
            }
            return Self::parse_host_port(rest.trim_end_matches('/'));
        }
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(EndpointError::Empty);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.contains("://") {
            return Err(EndpointError::UnsupportedScheme(s.to_string()));
        }
        Self::parse_host_port(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => {
                write!(f, "{TCP_SCHEME}[{host}]:{port}")
            }
            Self::Tcp { host, port } => write!(f, "{TCP_SCHEME}{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

/// Errors surfaced by [`FrameReader::receive`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(String),

    /// Orderly end of stream between frames.
    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Malformed(#[from] MalformedFrame),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(reason) => SessionError::ConnectionLost(reason),
            TransportError::Closed => SessionError::connection_lost("connection closed by peer"),
            TransportError::Malformed(e) => SessionError::MalformedFrame(e),
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Dial `endpoint`, giving up after `timeout`.
pub async fn connect(
    endpoint: &Endpoint,
    timeout: Duration,
    max_frame_length: usize,
) -> Result<Connection, SessionError> {
    let connect_error = |reason: String| SessionError::Connect {
        endpoint: endpoint.to_string(),
        reason,
    };

    tracing::debug!(%endpoint, ?timeout, "Dialing RTI");

    let dial = async {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok::<_, io::Error>(Connection::from_stream(stream, max_frame_length))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Connection::from_stream(stream, max_frame_length))
            }
        }
    };

    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(connection)) => {
            tracing::debug!(%endpoint, "Transport connected");
            Ok(connection.with_peer(endpoint.to_string()))
        }
        Ok(Err(e)) => Err(connect_error(e.to_string())),
        Err(_) => Err(connect_error(format!("timed out after {timeout:?}"))),
    }
}

/// An established byte stream to the RTI, not yet split.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer: String,
}

impl Connection {
    pub fn from_stream<S>(stream: S, max_frame_length: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedRead = Box::new(read_half);
        let write_half: BoxedWrite = Box::new(write_half);

        Self {
            reader: FrameReader {
                inner: FramedRead::new(read_half, FrameCodec::new(max_frame_length)),
            },
            writer: FrameWriter {
                sink: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                    write_half,
                    FrameCodec::new(max_frame_length),
                ))),
                closed: Arc::new(AtomicBool::new(false)),
                failed: CancellationToken::new(),
            },
            peer: "stream".to_string(),
        }
    }

    fn with_peer(mut self, peer: String) -> Self {
        self.peer = peer;
        self
    }

    /// Human-readable description of the remote end, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read side. Exactly one exists per connection.
pub struct FrameReader {
    inner: FramedRead<BoxedRead, FrameCodec>,
}

impl FrameReader {
    /// Next complete frame. Cancel-safe: a frame is either returned whole or
    /// left buffered.
    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(CodecError::Io(e))) => Err(TransportError::Io(e.to_string())),
            Some(Err(CodecError::Malformed(e))) => Err(TransportError::Malformed(e)),
            None => Err(TransportError::Closed),
        }
    }
}

type SharedSink = Arc<tokio::sync::Mutex<FramedWrite<BoxedWrite, FrameCodec>>>;

/// Write side, shared by callers, the heartbeat task and callback
/// acknowledgements. The mutex is the send-serialization lock.
#[derive(Clone)]
pub struct FrameWriter {
    sink: SharedSink,
    closed: Arc<AtomicBool>,
    /// Cancelled when a write fails, so the dispatch loop can tear down.
    failed: CancellationToken,
}

impl FrameWriter {
    /// Acquire the send lock. Frames written through one guard are contiguous
    /// on the wire.
    pub async fn lock(&self) -> SendGuard<'_> {
        SendGuard {
            sink: self.sink.lock().await,
            writer: self,
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.lock().await.send(frame).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once a write has failed on this connection.
    pub fn failed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.failed.cancelled()
    }

    /// Refuse further sends and shut the write half down so the peer sees EOF.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.get_mut().shutdown().await {
                tracing::debug!(error = %e, "Transport shutdown failed");
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), shutdown)
            .await
            .is_err()
        {
            tracing::debug!("Transport shutdown timed out waiting for send lock");
        }
    }

    fn mark_failed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.failed.cancel();
    }
}

/// Held send lock.
pub struct SendGuard<'a> {
    sink: tokio::sync::MutexGuard<'a, FramedWrite<BoxedWrite, FrameCodec>>,
    writer: &'a FrameWriter,
}

impl SendGuard<'_> {
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Encode and flush one frame.
    ///
    /// An oversized frame is rejected locally and leaves the connection usable;
    /// an I/O failure marks the writer failed.
    pub async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        if self.writer.is_closed() {
            return Err(SessionError::connection_lost("connection is closed"));
        }
        match self.sink.send(frame).await {
            Ok(()) => Ok(()),
            Err(CodecError::Malformed(e)) => Err(SessionError::MalformedFrame(e)),
            Err(CodecError::Io(e)) => {
                tracing::debug!(error = %e, "Frame write failed");
                self.writer.mark_failed();
                Err(SessionError::Transport(e.to_string()))
            }
        }
    }
}
