use color_eyre::eyre::{self, WrapErr};

use crate::cli::{expect, forward_packets, parse_qos, ClientArgs};
use crate::mqtt::Client;
use crate::protocol::{Packet, QoS};

#[derive(clap::Args, Clone, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// The topic to publish to.
    #[clap(short, long)]
    pub topic: String,

    /// The message to publish.
    #[clap(short, long, default_value = "")]
    pub payload: String,

    /// 0 or 1. At 1, waits for the server's acknowledgement.
    #[clap(short, long, default_value = "0", value_parser = parse_qos)]
    pub qos: QoS,
}

pub fn main(args: PublishArgs) -> crate::Result<()> {
    main_async(args)
}

#[tokio::main]
async fn main_async(args: PublishArgs) -> crate::Result<()> {
    let (app, mut packets) = forward_packets();
    let timeout = args.client.timeout;

    let client = tokio::time::timeout(
        timeout,
        Client::connect(&args.client.server.addr(), args.client.config(), app),
    )
    .await
    .map_err(|_| eyre::eyre!("timeout"))?
    .wrap_err_with(|| format!("FAIL: error connecting to {}", args.client.server))?;

    let connack = expect(&mut packets, timeout, |packet| match packet {
        Packet::ConnAck(connack) => Some(connack),
        _ => None,
    })
    .await?;

    if connack.reason.is_error() {
        eyre::bail!("FAIL: connection refused ({})", connack.reason);
    }

    client
        .handle()
        .publish(args.topic.clone(), args.qos, args.payload)
        .await
        .wrap_err("FAIL: error sending PUBLISH")?;

    if args.qos == QoS::AtLeastOnce {
        let puback = expect(&mut packets, timeout, |packet| match packet {
            Packet::PubAck(puback) => Some(puback),
            _ => None,
        })
        .await?;

        if puback.reason.is_error() {
            eyre::bail!("FAIL: publish rejected ({})", puback.reason);
        }
    }

    tracing::info!(topic = %args.topic, qos = args.qos as u8, "published");

    client.handle().disconnect().await?;
    client.wait().await
}
