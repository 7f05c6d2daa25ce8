//! Sessions driven end to end over in-memory pipes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tt::config::BrokerConfig;
use tt::mqtt::{BrokerCore, DirectSocket};
use tt::protocol::{
    self, Connect, Packet, Property, Publish, QoS, ReasonCode, Subscribe, SubscribeFilter,
    Unsubscribe,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The client side of a pipe, speaking raw packets.
struct TestClient {
    stream: DuplexStream,
    buf: BytesMut,
    session: JoinHandle<Result<(), tt::mqtt::Error>>,
}

impl TestClient {
    fn open(core: &BrokerCore, token: &CancellationToken) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let remote_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let core = core.clone();
        let token = token.clone();

        let session = tokio::spawn(async move {
            core.serve(DirectSocket::new(remote_addr, server), token)
                .await
        });

        Self {
            stream: client,
            buf: BytesMut::new(),
            session,
        }
    }

    /// Open a connection and complete the `CONNECT` handshake.
    async fn connect(core: &BrokerCore, token: &CancellationToken, client_id: &str) -> Self {
        let mut client = Self::open(core, token);

        client.send(Packet::Connect(Connect::new(client_id))).await;

        let Packet::ConnAck(connack) = client.recv().await.expect("connection closed") else {
            panic!("expected CONNACK");
        };
        assert_eq!(connack.reason, ReasonCode::SUCCESS);

        client
    }

    async fn send(&mut self, packet: Packet) {
        self.try_send(packet).await.unwrap();
    }

    async fn try_send(&mut self, packet: Packet) -> std::io::Result<()> {
        self.stream.write_all(&packet.to_bytes().unwrap()).await
    }

    /// The next packet from the server, or `None` at EOF.
    async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a packet")
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            match protocol::read(&mut self.buf, usize::MAX) {
                Ok(packet) => return Some(packet),
                Err(protocol::Error::InsufficientBytes(_)) => (),
                Err(e) => panic!("server sent a bad packet: {e}"),
            }

            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    /// Nothing arrives within `wait`.
    async fn assert_idle(&mut self, wait: Duration) {
        if let Ok(packet) = tokio::time::timeout(wait, self.recv_inner()).await {
            panic!("expected nothing, got {packet:?}");
        }
    }

    async fn expect_disconnect(&mut self, reason: ReasonCode) {
        let Some(Packet::Disconnect(disconnect)) = self.recv().await else {
            panic!("expected DISCONNECT");
        };
        assert_eq!(disconnect.reason, reason);
    }
}

fn broker() -> (BrokerCore, CancellationToken) {
    let config = BrokerConfig {
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    };

    (BrokerCore::new(config), CancellationToken::new())
}

#[tokio::test]
async fn assigns_client_id() {
    let (core, token) = broker();
    let mut client = TestClient::open(&core, &token);

    client.send(Packet::Connect(Connect::new(""))).await;

    let Some(Packet::ConnAck(connack)) = client.recv().await else {
        panic!("expected CONNACK");
    };

    assert_eq!(connack.reason, ReasonCode::SUCCESS);

    let assigned = connack
        .properties
        .assigned_client_id()
        .expect("no AssignedClientIdentifier");
    assert!(!assigned.is_empty());

    // QoS 2 is never granted.
    assert!(connack
        .properties
        .0
        .contains(&Property::MaximumQos(QoS::AtLeastOnce as u8)));
}

#[tokio::test(start_paused = true)]
async fn connect_timeout() {
    // Default `connect_timeout`.
    let core = BrokerCore::new(BrokerConfig::default());
    let token = CancellationToken::new();
    let mut client = TestClient::open(&core, &token);

    let start = tokio::time::Instant::now();

    // Never connected, so no DISCONNECT.
    assert_eq!(client.recv().await, None);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");

    assert!(matches!(
        client.session.await.unwrap(),
        Err(tt::mqtt::Error::ReadTimeout)
    ));
}

#[tokio::test]
async fn connect_must_come_first() {
    let (core, token) = broker();
    let mut client = TestClient::open(&core, &token);

    client.send(Packet::PingReq).await;

    let Some(Packet::Disconnect(disconnect)) = client.recv().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason, ReasonCode::PROTOCOL_ERROR);
    assert_eq!(
        disconnect.properties.reason_string(),
        Some("expected CONNECT, got PINGREQ")
    );

    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn undecodable_packet() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "garbled").await;

    // A QoS 0 PUBLISH whose topic length runs past the end of the packet.
    client.stream.write_all(&[0x30, 0x02, 0xFF, 0xFF]).await.unwrap();

    client
        .expect_disconnect(ReasonCode::MALFORMED_PACKET)
        .await;
    assert_eq!(client.recv().await, None);

    match client.session.await.unwrap() {
        Err(tt::mqtt::Error::Protocol(e)) => assert!(e.is_malformed(), "{e}"),
        res => panic!("expected a protocol error, got {res:?}"),
    }
}

#[tokio::test]
async fn subscribe_then_unsubscribe() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "sub-unsub").await;

    client
        .send(Packet::Subscribe(Subscribe::new(
            1,
            vec![SubscribeFilter::new("a/b/#", QoS::AtMostOnce)],
        )))
        .await;

    let Some(Packet::SubAck(suback)) = client.recv().await else {
        panic!("expected SUBACK");
    };
    assert_eq!(suback.packet_id, 1);
    assert_eq!(suback.reasons, [ReasonCode::GRANTED_QOS_0]);
    assert_eq!(core.router().len().await, 1);

    client
        .send(Packet::Unsubscribe(Unsubscribe::new(1, vec!["a/b/#".into()])))
        .await;

    let Some(Packet::UnsubAck(unsuback)) = client.recv().await else {
        panic!("expected UNSUBACK");
    };
    assert_eq!(unsuback.packet_id, 1);
    assert_eq!(unsuback.reasons, [ReasonCode::SUCCESS]);
    assert_eq!(core.router().len().await, 0);

    // A second time there is nothing left to remove.
    client
        .send(Packet::Unsubscribe(Unsubscribe::new(2, vec!["a/b/#".into()])))
        .await;

    let Some(Packet::UnsubAck(unsuback)) = client.recv().await else {
        panic!("expected UNSUBACK");
    };
    assert_eq!(unsuback.reasons, [ReasonCode::NO_SUBSCRIPTION_EXISTED]);
}

#[tokio::test]
async fn malformed_subscribe() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "malformed").await;

    client
        .send(Packet::Subscribe(Subscribe::new(
            1,
            vec![SubscribeFilter::new("a/#/c", QoS::AtMostOnce)],
        )))
        .await;

    client
        .expect_disconnect(ReasonCode::MALFORMED_PACKET)
        .await;
    assert_eq!(client.recv().await, None);

    let res = client.session.await.unwrap();
    assert!(matches!(
        res,
        Err(tt::mqtt::Error::Disconnect {
            reason: ReasonCode::MALFORMED_PACKET,
            ..
        })
    ));

    // The server end of the pipe is gone.
    assert!(client.stream.write_all(b"\xC0\x00").await.is_err());
    assert_eq!(core.router().len().await, 0);
}

#[tokio::test]
async fn qos_exceeded() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "greedy").await;

    let mut publish = Publish::new("hello", QoS::ExactlyOnce, "world");
    publish.packet_id = 1;

    client.send(Packet::Publish(publish)).await;

    client
        .expect_disconnect(ReasonCode::QOS_NOT_SUPPORTED)
        .await;
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn qos2_declined_whatever_the_config() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_secs(5),
        max_qos: QoS::ExactlyOnce,
        ..Default::default()
    };

    let core = BrokerCore::new(config);
    let token = CancellationToken::new();
    let mut client = TestClient::open(&core, &token);

    client.send(Packet::Connect(Connect::new("greedy"))).await;

    let Some(Packet::ConnAck(connack)) = client.recv().await else {
        panic!("expected CONNACK");
    };
    assert!(connack
        .properties
        .0
        .contains(&Property::MaximumQos(QoS::AtLeastOnce as u8)));

    let mut publish = Publish::new("hello", QoS::ExactlyOnce, "world");
    publish.packet_id = 1;
    client.send(Packet::Publish(publish)).await;

    client
        .expect_disconnect(ReasonCode::QOS_NOT_SUPPORTED)
        .await;
}

#[tokio::test]
async fn publish_fanout() {
    let (core, token) = broker();

    let mut subscribers = Vec::new();

    for (client_id, filter) in [("first", "sport/#"), ("second", "sport/tennis/player1/#")] {
        let mut client = TestClient::connect(&core, &token, client_id).await;

        client
            .send(Packet::Subscribe(Subscribe::new(
                1,
                vec![SubscribeFilter::new(filter, QoS::AtMostOnce)],
            )))
            .await;

        let Some(Packet::SubAck(suback)) = client.recv().await else {
            panic!("expected SUBACK");
        };
        assert_eq!(suback.reasons, [ReasonCode::GRANTED_QOS_0]);

        subscribers.push(client);
    }

    let mut publisher = TestClient::connect(&core, &token, "publisher").await;

    publisher
        .send(Packet::Publish(Publish::new(
            "sport/tennis/player1/ranking",
            QoS::AtMostOnce,
            "1",
        )))
        .await;

    for subscriber in &mut subscribers {
        let Some(Packet::Publish(publish)) = subscriber.recv().await else {
            panic!("expected PUBLISH");
        };

        assert_eq!(publish.topic, "sport/tennis/player1/ranking");
        assert_eq!(&publish.payload[..], b"1");
        assert_eq!(publish.qos, QoS::AtMostOnce);

        subscriber.assert_idle(Duration::from_millis(100)).await;
    }

    // Nobody subscribed to this.
    publisher
        .send(Packet::Publish(Publish::new("news", QoS::AtMostOnce, "")))
        .await;

    for subscriber in &mut subscribers {
        subscriber.assert_idle(Duration::from_millis(100)).await;
    }

    publisher.assert_idle(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn qos1_delivery() {
    let (core, token) = broker();
    let mut subscriber = TestClient::connect(&core, &token, "subscriber").await;

    subscriber
        .send(Packet::Subscribe(Subscribe::new(
            7,
            vec![SubscribeFilter::new("a/+", QoS::AtLeastOnce)],
        )))
        .await;

    let Some(Packet::SubAck(suback)) = subscriber.recv().await else {
        panic!("expected SUBACK");
    };
    assert_eq!(suback.reasons, [ReasonCode::GRANTED_QOS_1]);

    let mut publisher = TestClient::connect(&core, &token, "publisher").await;

    let mut publish = Publish::new("a/b", QoS::AtLeastOnce, "payload");
    publish.packet_id = 42;
    publisher.send(Packet::Publish(publish)).await;

    let Some(Packet::PubAck(puback)) = publisher.recv().await else {
        panic!("expected PUBACK");
    };
    assert_eq!(puback.packet_id, 42);

    let Some(Packet::Publish(delivered)) = subscriber.recv().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    // Assigned from the subscriber's own pool.
    assert_eq!(delivered.packet_id, 1);
}

#[tokio::test]
async fn second_connect_is_a_protocol_error() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "twice").await;

    client.send(Packet::Connect(Connect::new("twice"))).await;

    client
        .expect_disconnect(ReasonCode::PROTOCOL_ERROR)
        .await;
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn ping() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "pinger").await;

    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_timeout() {
    let (core, token) = broker();
    let mut client = TestClient::open(&core, &token);

    let mut connect = Connect::new("sleepy");
    connect.keep_alive = 2;
    client.send(Packet::Connect(connect)).await;

    let Some(Packet::ConnAck(_)) = client.recv().await else {
        panic!("expected CONNACK");
    };

    // One and a half times the Keep Alive.
    tokio::time::sleep(Duration::from_millis(2900)).await;
    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    client
        .expect_disconnect(ReasonCode::KEEP_ALIVE_TIMEOUT)
        .await;
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn shutdown() {
    let (core, token) = broker();
    let mut client = TestClient::connect(&core, &token, "bystander").await;

    token.cancel();

    client
        .expect_disconnect(ReasonCode::SERVER_SHUTTING_DOWN)
        .await;
    assert_eq!(client.recv().await, None);

    client.session.await.unwrap().unwrap();
    assert_eq!(core.stats().total(), 1);
    assert_eq!(core.stats().active(), 0);
}
