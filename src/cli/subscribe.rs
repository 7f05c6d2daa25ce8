use std::io::{self, Write};

use color_eyre::eyre::{self, WrapErr};

use crate::cli::{expect, forward_packets, parse_qos, ClientArgs};
use crate::mqtt::Client;
use crate::protocol::{Packet, Publish, QoS, SubscribeFilter};

#[derive(clap::Args, Clone, Debug)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// The topic filters to subscribe to. May be repeated.
    #[clap(short, long, required = true)]
    pub topic: Vec<String>,

    /// The maximum QoS to receive messages at.
    #[clap(short, long, default_value = "0", value_parser = parse_qos)]
    pub qos: QoS,

    /// Exit after receiving this many messages.
    #[clap(short = 'n', long)]
    pub count: Option<usize>,
}

pub fn main(args: SubscribeArgs) -> crate::Result<()> {
    main_async(args)
}

#[tokio::main]
async fn main_async(args: SubscribeArgs) -> crate::Result<()> {
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

    let filters = args
        .topic
        .iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), args.qos))
        .collect();

    client
        .handle()
        .subscribe(filters)
        .await
        .wrap_err("FAIL: error sending SUBSCRIBE")?;

    let suback = expect(&mut packets, timeout, |packet| match packet {
        Packet::SubAck(suback) => Some(suback),
        _ => None,
    })
    .await?;

    for (topic, reason) in args.topic.iter().zip(&suback.reasons) {
        if reason.is_error() {
            eyre::bail!("FAIL: subscription to {topic:?} rejected ({reason})");
        }

        tracing::info!(%topic, granted = reason.0, "subscribed");
    }

    let mut received = 0;

    loop {
        if args.count.is_some_and(|count| received >= count) {
            break;
        }

        let packet = tokio::select! {
            packet = packets.recv() => packet,
            res = tokio::signal::ctrl_c() => {
                res.wrap_err("error from ctrl_c() handler")?;
                tracing::info!("Ctrl-C received; disconnecting");
                break;
            }
        };

        match packet {
            Some(Packet::Publish(publish)) => {
                print_message(&publish).wrap_err("error writing to stdout")?;
                received += 1;
            }
            Some(Packet::Disconnect(disconnect)) => {
                eyre::bail!("FAIL: disconnected by server ({})", disconnect.reason);
            }
            Some(_) => (),
            None => eyre::bail!("FAIL: connection closed"),
        }
    }

    client.handle().disconnect().await?;
    client.wait().await
}

fn print_message(publish: &Publish) -> io::Result<()> {
    let mut stdout = io::stdout().lock();

    writeln!(
        stdout,
        "{} {}",
        publish.topic,
        String::from_utf8_lossy(&publish.payload)
    )?;

    stdout.flush()
}
