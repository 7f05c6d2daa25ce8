use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::OptionFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mqtt::middleware::DynHandler;
use crate::mqtt::Error;
use crate::protocol::{self, Packet};

/// The longest a [`Receiver`] waits for a complete packet, shared with the handlers that adjust it.
///
/// Changes apply from the next packet on.
#[derive(Clone, Debug, Default)]
pub struct ReadTimeout(Arc<AtomicU64>);

impl ReadTimeout {
    pub fn new(timeout: Option<Duration>) -> Self {
        let this = Self::default();
        this.set(timeout);
        this
    }

    pub fn set(&self, timeout: Option<Duration>) {
        // 0 means no timeout; round anything shorter up so it doesn't turn into that.
        let millis = timeout.map_or(0, |it| u64::try_from(it.as_millis()).unwrap_or(u64::MAX).max(1));
        self.0.store(millis, Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

/// The read half of a connection, decoding packets and feeding them to the ingress chain.
pub struct Receiver<R> {
    reader: R,
    buf: BytesMut,
    max_packet_size: usize,
    timeout: ReadTimeout,
}

impl<R: AsyncRead + Unpin> Receiver<R> {
    pub fn new(reader: R, max_packet_size: usize, timeout: ReadTimeout) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            max_packet_size,
            timeout,
        }
    }

    /// Hand every packet read to `handler`, one at a time in arrival order.
    ///
    /// Returns `Ok(())` when the peer closes the connection. Errors from `handler` are logged
    /// unless [fatal](Error::is_fatal), in which case they end the loop.
    pub async fn run(&mut self, handler: DynHandler, token: &CancellationToken) -> Result<(), Error> {
        while let Some(packet) = self.recv(token).await? {
            match handler.handle(token, packet).await {
                Ok(()) => (),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("error handling packet: {e}"),
            }
        }

        Ok(())
    }

    /// Read one packet, `None` on end of stream.
    pub async fn recv(&mut self, token: &CancellationToken) -> Result<Option<Packet>, Error> {
        // The deadline covers the whole packet, so a peer can't keep the connection alive
        // by trickling one byte at a time.
        let read_timeout: OptionFuture<_> = self
            .timeout
            .get()
            .map(|timeout| tokio::time::sleep_until(Instant::now() + timeout))
            .into();
        tokio::pin!(read_timeout);

        loop {
            let read_len = match protocol::read(&mut self.buf, self.max_packet_size) {
                Ok(packet) => return Ok(Some(packet)),
                Err(protocol::Error::InsufficientBytes(expected)) => expected,
                Err(e) => return Err(e.into()),
            };

            self.buf.reserve(read_len);

            tokio::select! {
                res = self.reader.read_buf(&mut self.buf) => {
                    if res? == 0 {
                        if !self.buf.is_empty() {
                            tracing::debug!(
                                "connection closed with {} bytes of a partial packet",
                                self.buf.len()
                            );
                        }

                        return Ok(None);
                    }
                }
                Some(()) = &mut read_timeout => {
                    return Err(Error::ReadTimeout);
                }
                _ = token.cancelled() => {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}
