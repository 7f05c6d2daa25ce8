use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::mqtt::middleware::{handler_fn, DynHandler};
use crate::mqtt::Error;
use crate::protocol::Packet;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write half of a connection.
///
/// Every packet is encoded and written whole while holding the lock, so concurrent senders
/// never interleave on the wire. Packets reach the wire in lock acquisition order.
pub struct Sender {
    writer: Mutex<Option<BoxWriter>>,
}

impl Sender {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
        }
    }

    /// Write `packet`, returning [`Error::Closed`] once [`close()`](Self::close) has been called.
    ///
    /// A failed write doesn't close the sender.
    pub async fn send(&self, packet: &Packet) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        packet.write(&mut buf)?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::Closed)?;

        writer.write_all(&buf).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Shut down and drop the writer, waiting for any write in progress.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("error shutting down writer: {e}");
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    /// The sender as the base handler of an egress chain.
    ///
    /// Gives up with [`Error::Cancelled`] if the token is cancelled before the write completes.
    pub fn handler(self: &Arc<Self>) -> DynHandler {
        let this = self.clone();

        handler_fn(move |token, packet| {
            let this = this.clone();

            async move {
                tokio::select! {
                    res = this.send(&packet) => res,
                    _ = token.cancelled() => Err(Error::Cancelled),
                }
            }
        })
    }
}
