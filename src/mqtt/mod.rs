//! The packet pipeline shared by the broker and the client.
//!
//! A connection is driven by a [`receiver`] loop pumping decoded packets through an ingress chain
//! of [`middleware`]s. Replies and application packets go through an egress chain ending in a
//! [`sender`]. The broker shares one [`router`] between all of its sessions.

use color_eyre::eyre;

use crate::protocol::{self, ReasonCode};

/// Return [`Error::Disconnect`] from the current function.
///
/// The session emits a `DISCONNECT` with the given reason code before closing the connection.
macro_rules! disconnect (
    ($reason:ident, $($message:tt)*) => {
        return Err($crate::mqtt::Error::Disconnect {
            reason: $crate::protocol::ReasonCode::$reason,
            message: format!($($message)*),
        })
    };
);

pub mod broker;
pub mod client;
pub mod id_pool;
pub mod keep_alive;
pub mod middleware;
pub mod receiver;
pub mod router;
pub mod sender;
pub mod session;
pub mod socket;
pub mod topic;
pub mod trie;

pub use broker::{BrokerCore, MqttBroker, Stats};
pub use client::{Client, ClientHandle};
pub use id_pool::IdPool;
pub use keep_alive::KeepAlive;
pub use middleware::{handler_fn, DynHandler, Handler};
pub use socket::{DirectSocket, MqttSocket};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A protocol violation: the connection must be closed after sending a `DISCONNECT`.
    #[error("closing connection due to packet error: {message}")]
    Disconnect { reason: ReasonCode, message: String },
    #[error("no packet identifiers available")]
    NoPacketIds,
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out waiting for a packet")]
    ReadTimeout,
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(
        #[from]
        #[source]
        protocol::Error,
    ),
    #[error("I/O error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// An error from application code. Logged, never fatal to the connection.
    #[error("handler error: {0}")]
    Handler(eyre::Error),
}

impl Error {
    /// Whether the receiver loop must stop after this error.
    ///
    /// Only application errors and id pool exhaustion leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Handler(_) | Self::NoPacketIds)
    }

    /// The reason code to close the connection with, if a `DISCONNECT` should be sent at all.
    pub fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Disconnect { reason, .. } => Some(*reason),
            Self::Protocol(e) if e.is_malformed() => Some(match e {
                protocol::Error::PacketTooLarge { .. } => ReasonCode::PACKET_TOO_LARGE,
                protocol::Error::UnsupportedProtocol { .. } => {
                    ReasonCode::UNSUPPORTED_PROTOCOL_VERSION
                }
                _ => ReasonCode::MALFORMED_PACKET,
            }),
            _ => None,
        }
    }
}
