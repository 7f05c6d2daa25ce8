use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// A connection as the session pipeline sees it: a byte duplex with a remote address.
///
/// Closing is done by shutting down the write half.
pub trait MqttSocket: Send + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: AsyncWrite + Send + Unpin + 'static;

    fn remote_addr(&self) -> SocketAddr;

    /// Split into independently owned halves: one for the receiver loop, one for the sender.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Any byte stream used as-is, e.g. a `TcpStream` or one end of a `tokio::io::duplex()`.
pub struct DirectSocket<S> {
    remote_addr: SocketAddr,
    stream: S,
}

impl<S> DirectSocket<S> {
    pub fn new(remote_addr: SocketAddr, stream: S) -> Self {
        Self {
            remote_addr,
            stream,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> MqttSocket for DirectSocket<S> {
    type Reader = ReadHalf<S>;
    type Writer = WriteHalf<S>;

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.stream)
    }
}
