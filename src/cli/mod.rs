use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre;

use publish::PublishArgs;
use server::ServerArgs;
use subscribe::SubscribeArgs;

use crate::config::ClientConfig;
use crate::mqtt::middleware::handler_fn;
use crate::mqtt::{DynHandler, KeepAlive};
use crate::protocol::{Packet, QoS};

pub mod publish;
pub mod server;
pub mod subscribe;

pub const DEFAULT_PORT: u16 = 1883;

/// A small MQTT v5 broker and client.
#[derive(clap::Parser, Debug)]
#[command(name = "tt", version)]
pub struct Args {
    /// Set the format of log output.
    #[clap(long, global = true, default_value = "full")]
    pub log: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum Command {
    /// Publish one message.
    Pub(PublishArgs),
    /// Subscribe to topics and print every message received as `topic payload`.
    Sub(SubscribeArgs),
    /// Run the broker.
    Srv(ServerArgs),
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
    Json,
}

/// Options shared by the client commands.
#[derive(clap::Args, Clone, Debug)]
pub struct ClientArgs {
    /// The server to connect to.
    #[clap(short, long, default_value = "tcp://localhost:1883")]
    pub server: BrokerUrl,

    /// The client identifier. If empty, the server assigns one.
    #[clap(short = 'c', long, default_value = "")]
    pub client_id: String,

    #[clap(short, long)]
    pub username: Option<String>,

    #[clap(short = 'P', long)]
    pub password: Option<String>,

    /// The Keep Alive interval, in seconds. 0 disables it.
    #[clap(long, default_value = "30")]
    pub keep_alive: u16,

    /// Give up on any step (connect, acknowledgement) taking longer than this.
    #[clap(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
}

impl ClientArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            client_id: self.client_id.clone(),
            keep_alive: KeepAlive::from_seconds(self.keep_alive),
            username: self.username.clone(),
            password: self.password.clone(),
            ..Default::default()
        }
    }
}

pub fn main() -> crate::Result<()> {
    let args = Args::parse();

    crate::bootstrap(args.log)?;

    tracing::debug!("Parsed arguments: {args:?}");

    match args.command {
        Command::Pub(args) => publish::main(args),
        Command::Sub(args) => subscribe::main(args),
        Command::Srv(args) => server::main(args),
    }
}

/// An application handler forwarding every packet to a channel.
///
/// The channel closes when the connection does.
pub(crate) fn forward_packets() -> (
    impl FnOnce(crate::mqtt::ClientHandle) -> DynHandler,
    tokio::sync::mpsc::UnboundedReceiver<Packet>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let app = move |_: crate::mqtt::ClientHandle| {
        handler_fn(move |_, packet| {
            // The receiving end is only dropped once we're shutting down anyway.
            let _ = tx.send(packet);
            async { Ok(()) }
        })
    };

    (app, rx)
}

/// Wait for the next packet matching `select`, skipping the others.
///
/// Fails with `FAIL` if the connection closed first, or `timeout` if `timeout` elapsed first.
pub(crate) async fn expect<T>(
    packets: &mut tokio::sync::mpsc::UnboundedReceiver<Packet>,
    timeout: Duration,
    mut select: impl FnMut(Packet) -> Option<T>,
) -> crate::Result<T> {
    let wait = async {
        while let Some(packet) = packets.recv().await {
            if let Packet::Disconnect(disconnect) = &packet {
                eyre::bail!("FAIL: disconnected by server ({})", disconnect.reason);
            }

            if let Some(found) = select(packet) {
                return Ok(found);
            }
        }

        eyre::bail!("FAIL: connection closed")
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| eyre::eyre!("timeout"))?
}

pub fn parse_qos(s: &str) -> Result<QoS, String> {
    let level: u8 = s.parse().map_err(|e| format!("{e}"))?;
    QoS::try_from(level).map_err(|e| e.to_string())
}

/// `500ms`, `5s`, `2m`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (digits, unit_ms) = if let Some(digits) = s.strip_suffix("ms") {
        (digits, 1)
    } else if let Some(digits) = s.strip_suffix('s') {
        (digits, 1_000)
    } else if let Some(digits) = s.strip_suffix('m') {
        (digits, 60_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration {s:?}: {e}"))?;

    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration {s:?} is too long"))
}

/// `tcp://host:port`, with the scheme and port optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerUrl {
    pub host: String,
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UrlParseError {
    #[error("unsupported scheme {0:?}, only tcp:// is supported")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

impl BrokerUrl {
    /// `host:port`, as accepted by [`tokio::net::TcpStream::connect()`].
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BrokerUrl {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => return Err(UrlParseError::UnsupportedScheme(scheme.to_string())),
            None => s,
        };

        let rest = rest.trim_end_matches('/');

        // IPv6 literals are bracketed: `[::1]:1883`
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or(UrlParseError::MissingHost)?;
            (host, after.strip_prefix(':'))
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(UrlParseError::MissingHost);
        }

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| UrlParseError::InvalidPort(port.to_string()))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl Display for BrokerUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.addr())
    }
}
