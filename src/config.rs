use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use color_eyre::eyre::{self, WrapErr};

use crate::mqtt::id_pool;
use crate::mqtt::KeepAlive;
use crate::protocol::QoS;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_POOL_SIZE: u16 = 1024;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// A new connection must deliver its `CONNECT` within this.
    pub connect_timeout: Duration,
    /// How often the accept loop wakes up when no connections arrive.
    pub accept_timeout: Duration,
    /// Packet identifiers available to each session for outbound publishes.
    pub pool_size: u16,
    /// How long to wait for a packet identifier when all are in flight.
    pub id_timeout: Duration,
    pub max_qos: QoS,
    pub max_packet_size: usize,
    /// The Keep Alive granted to clients asking for more, or for none. Zero lifts the limit.
    pub max_keep_alive: KeepAlive,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            id_timeout: id_pool::DEFAULT_TIMEOUT,
            max_qos: QoS::AtLeastOnce,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_keep_alive: KeepAlive::from_seconds(3600),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Empty to have the server assign one.
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive: KeepAlive,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: u16,
    pub id_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_start: true,
            keep_alive: KeepAlive::from_seconds(30),
            username: None,
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
            id_timeout: id_pool::DEFAULT_TIMEOUT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Broker settings read from a TOML file. Every field is optional.
///
/// ```toml
/// connect-timeout-ms = 500
/// pool-size = 256
/// max-qos = 0
/// ```
#[derive(serde::Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BrokerConfigFile {
    pub bind: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub accept_timeout_ms: Option<u64>,
    pub pool_size: Option<u16>,
    pub id_timeout_ms: Option<u64>,
    pub max_qos: Option<u8>,
    pub max_packet_size: Option<usize>,
    pub max_keep_alive: Option<u16>,
}

impl BrokerConfigFile {
    /// Overlay the values set in the file on `config`.
    pub fn apply(&self, config: &mut BrokerConfig) -> crate::Result<()> {
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = self.accept_timeout_ms {
            config.accept_timeout = Duration::from_millis(ms);
        }

        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }

        if let Some(ms) = self.id_timeout_ms {
            config.id_timeout = Duration::from_millis(ms);
        }

        if let Some(max_qos) = self.max_qos {
            let max_qos = QoS::try_from(max_qos).wrap_err("invalid `max-qos`")?;

            // QoS 2 flows aren't implemented.
            if max_qos > QoS::AtLeastOnce {
                eyre::bail!("invalid `max-qos`: {} is not supported", max_qos as u8);
            }

            config.max_qos = max_qos;
        }

        if let Some(max_packet_size) = self.max_packet_size {
            config.max_packet_size = max_packet_size;
        }

        if let Some(max_keep_alive) = self.max_keep_alive {
            config.max_keep_alive = KeepAlive::from_seconds(max_keep_alive);
        }

        Ok(())
    }
}

/// NOTE: uses blocking I/O internally.
pub fn read(path: &Path) -> crate::Result<BrokerConfigFile> {
    let config_toml = if path == Path::new("-") {
        io::read_to_string(io::stdin().lock()).wrap_err("error reading from stdin")?
    } else {
        fs::read_to_string(path)
            .wrap_err_with(|| format!("error reading from {}", path.display()))?
    };

    parse(&config_toml)
}

pub fn parse(config_toml: &str) -> crate::Result<BrokerConfigFile> {
    toml::from_str(config_toml).wrap_err("error parsing config from TOML")
}
