use std::path::PathBuf;
use std::time::Duration;

use color_eyre::eyre::WrapErr;

use crate::cli::{parse_duration, BrokerUrl};
use crate::config::{self, BrokerConfig};
use crate::mqtt::{KeepAlive, MqttBroker};

pub const DEFAULT_BIND: &str = "tcp://0.0.0.0:1883";

#[derive(clap::Args, Clone, Debug)]
pub struct ServerArgs {
    /// The URL to listen for MQTT connections on [default: tcp://0.0.0.0:1883].
    #[clap(short, long, env = "TT_BIND_TCP")]
    pub bind: Option<BrokerUrl>,

    /// How often the accept loop checks for shutdown, e.g. `1s` or `500ms`.
    #[clap(long, value_parser = parse_duration)]
    pub accept_timeout: Option<Duration>,

    /// How long a new connection may take to send its `CONNECT`.
    #[clap(long, value_parser = parse_duration)]
    pub connect_timeout: Option<Duration>,

    /// Packet identifiers available to each session for delivering QoS 1 messages.
    #[clap(short, long)]
    pub pool_size: Option<u16>,

    /// Set the maximum Keep Alive interval for MQTT connections, in seconds.
    ///
    /// A client may specify a nonzero interval smaller than this.
    /// This also becomes the Keep Alive interval if a client does not specify one.
    ///
    /// Set to 0 to allow the client to set any Keep Alive interval, including 0 (no timeout).
    #[clap(long)]
    pub max_keep_alive: Option<u16>,

    /// Read settings from a TOML file (`-` for stdin). Command-line flags take precedence.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    /// Defaults, overlaid with the config file, overlaid with the command line.
    pub fn resolve(&self) -> crate::Result<(BrokerUrl, BrokerConfig)> {
        let mut config = BrokerConfig::default();
        let mut bind = None;

        if let Some(path) = &self.config {
            let file = config::read(path)?;
            file.apply(&mut config)
                .wrap_err_with(|| format!("invalid config in {}", path.display()))?;

            bind = file
                .bind
                .map(|bind| bind.parse::<BrokerUrl>())
                .transpose()
                .wrap_err("invalid `bind` in config file")?;
        }

        if let Some(accept_timeout) = self.accept_timeout {
            config.accept_timeout = accept_timeout;
        }

        if let Some(connect_timeout) = self.connect_timeout {
            config.connect_timeout = connect_timeout;
        }

        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }

        if let Some(max_keep_alive) = self.max_keep_alive {
            config.max_keep_alive = KeepAlive::from_seconds(max_keep_alive);
        }

        let bind = match (&self.bind, bind) {
            (Some(bind), _) => bind.clone(),
            (None, Some(bind)) => bind,
            (None, None) => DEFAULT_BIND.parse().wrap_err("BUG: invalid default bind URL")?,
        };

        Ok((bind, config))
    }
}

pub fn main(args: ServerArgs) -> crate::Result<()> {
    let (bind, config) = args.resolve()?;

    main_async(bind, config)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`, and it can accept args
#[tokio::main]
async fn main_async(bind: BrokerUrl, config: BrokerConfig) -> crate::Result<()> {
    tracing::debug!(?config, "starting broker");

    let mut broker = MqttBroker::bind(&bind.addr(), config).await?;

    loop {
        tokio::select! {
            res = broker.run() => {
                res?;
                break;
            }

            res = tokio::signal::ctrl_c() => {
                res.wrap_err("error from ctrl_c() handler")?;
                break;
            }
        }
    }

    tracing::info!(
        "Ctrl-C received; waiting for {} connections to close",
        broker.connections()
    );

    broker.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;
    use crate::cli::{Args, Command};

    fn parse(argv: &[&str]) -> ServerArgs {
        let args = Args::try_parse_from(argv).unwrap();

        let Command::Srv(args) = args.command else {
            panic!("expected srv");
        };

        args
    }

    #[test]
    fn defaults() {
        let (bind, config) = parse(&["tt", "srv"]).resolve().unwrap();

        // `TT_BIND_TCP` isn't set in tests.
        assert_eq!(bind.addr(), "0.0.0.0:1883");
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let dir = std::env::temp_dir().join(format!("tt-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broker.toml");

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "bind = \"tcp://127.0.0.1:1999\"\npool-size = 8\nconnect-timeout-ms = 900"
        )
        .unwrap();

        let path = path.to_str().unwrap();

        let (bind, config) = parse(&["tt", "srv", "--config", path]).resolve().unwrap();
        assert_eq!(bind.addr(), "127.0.0.1:1999");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.connect_timeout, Duration::from_millis(900));

        let (bind, config) = parse(&[
            "tt",
            "srv",
            "--config",
            path,
            "-b",
            "tcp://127.0.0.1:2000",
            "-p",
            "4",
            "--accept-timeout",
            "250ms",
        ])
        .resolve()
        .unwrap();
        assert_eq!(bind.addr(), "127.0.0.1:2000");
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.accept_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_millis(900));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
