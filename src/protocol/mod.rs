//! MQTT v5 wire codec.
//!
//! The rest of the crate only talks to this module through [`read()`], [`Packet::write()`]
//! and [`Packet::validate()`].
//!
//! Docs: https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html

use std::fmt::{self, Debug, Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

mod codec;
mod connect;
mod disconnect;
mod properties;
mod publish;
mod subscribe;

pub use codec::VAR_INT_MAX;
pub use connect::{ConnAck, Connect, LastWill};
pub use disconnect::Disconnect;
pub use properties::{Properties, Property};
pub use publish::{Ack, Publish};
pub use subscribe::{RetainHandling, SubAck, Subscribe, SubscribeFilter, UnsubAck, Unsubscribe};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not an error as such: the stream needs at least this many more bytes to make progress.
    #[error("insufficient bytes, need at least {0} more")]
    InsufficientBytes(usize),
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("invalid fixed header flags {flags:#06b} for {kind}")]
    InvalidFlags { kind: PacketType, flags: u8 },
    #[error("malformed variable byte integer")]
    MalformedVarInt,
    #[error("packet of {size} bytes exceeds the maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("field of {0} bytes is too long to encode")]
    PayloadTooLong(usize),
    #[error("unsupported protocol {name:?} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },
    #[error("invalid QoS {0}")]
    InvalidQos(u8),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("invalid property identifier {0:#04x}")]
    InvalidProperty(u32),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl Error {
    /// Every error except [`Error::InsufficientBytes`] means the stream is corrupt.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::InsufficientBytes(_))
    }
}

/// Quality of Service level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(Error::InvalidQos(other)),
        }
    }
}

/// An MQTT v5 Reason Code.
///
/// These are constants rather than enum variants because the same value means different things
/// depending on the packet it appears in (`0x00` is `Success`, `Normal disconnection` and
/// `Granted QoS 0`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const NORMAL_DISCONNECTION: Self = Self(0x00);
    pub const GRANTED_QOS_0: Self = Self(0x00);
    pub const GRANTED_QOS_1: Self = Self(0x01);
    pub const GRANTED_QOS_2: Self = Self(0x02);
    pub const NO_MATCHING_SUBSCRIBERS: Self = Self(0x10);
    pub const NO_SUBSCRIPTION_EXISTED: Self = Self(0x11);
    pub const UNSPECIFIED_ERROR: Self = Self(0x80);
    pub const MALFORMED_PACKET: Self = Self(0x81);
    pub const PROTOCOL_ERROR: Self = Self(0x82);
    pub const IMPLEMENTATION_SPECIFIC_ERROR: Self = Self(0x83);
    pub const UNSUPPORTED_PROTOCOL_VERSION: Self = Self(0x84);
    pub const CLIENT_IDENTIFIER_NOT_VALID: Self = Self(0x85);
    pub const NOT_AUTHORIZED: Self = Self(0x87);
    pub const SERVER_SHUTTING_DOWN: Self = Self(0x8B);
    pub const KEEP_ALIVE_TIMEOUT: Self = Self(0x8D);
    pub const TOPIC_FILTER_INVALID: Self = Self(0x8F);
    pub const TOPIC_NAME_INVALID: Self = Self(0x90);
    pub const PACKET_IDENTIFIER_IN_USE: Self = Self(0x91);
    pub const PACKET_IDENTIFIER_NOT_FOUND: Self = Self(0x92);
    pub const PACKET_TOO_LARGE: Self = Self(0x95);
    pub const QOS_NOT_SUPPORTED: Self = Self(0x9B);

    /// The reason code granting `qos` in a `SUBACK`.
    pub fn granted(qos: QoS) -> Self {
        Self(qos as u8)
    }

    pub fn is_error(self) -> bool {
        self.0 >= 0x80
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x00 => "Success",
            0x01 => "GrantedQoS1",
            0x02 => "GrantedQoS2",
            0x04 => "DisconnectWithWillMessage",
            0x10 => "NoMatchingSubscribers",
            0x11 => "NoSubscriptionExisted",
            0x80 => "UnspecifiedError",
            0x81 => "MalformedPacket",
            0x82 => "ProtocolError",
            0x83 => "ImplementationSpecificError",
            0x84 => "UnsupportedProtocolVersion",
            0x85 => "ClientIdentifierNotValid",
            0x86 => "BadUserNameOrPassword",
            0x87 => "NotAuthorized",
            0x8B => "ServerShuttingDown",
            0x8D => "KeepAliveTimeout",
            0x8E => "SessionTakenOver",
            0x8F => "TopicFilterInvalid",
            0x90 => "TopicNameInvalid",
            0x91 => "PacketIdentifierInUse",
            0x92 => "PacketIdentifierNotFound",
            0x95 => "PacketTooLarge",
            0x9B => "QoSNotSupported",
            _ => return None,
        })
    }
}

impl Debug for ReasonCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "ReasonCode({:#04x})", self.0),
        }
    }
}

impl Display for ReasonCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.0)
    }
}

/// The 4-bit control packet type from the fixed header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            // 15 is AUTH, which we don't support.
            other => return Err(Error::InvalidPacketType(other)),
        })
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

/// Read one packet from the front of `stream`.
///
/// On success the packet's bytes are removed from `stream`. If `stream` doesn't hold a complete
/// packet yet, returns [`Error::InsufficientBytes`] and leaves `stream` untouched.
pub fn read(stream: &mut BytesMut, max_packet_size: usize) -> Result<Packet, Error> {
    let (byte1, remaining_len, header_len) = codec::fixed_header(stream)?;
    let size = header_len + remaining_len;

    if size > max_packet_size {
        return Err(Error::PacketTooLarge {
            size,
            max: max_packet_size,
        });
    }

    if stream.len() < size {
        return Err(Error::InsufficientBytes(size - stream.len()));
    }

    let kind = PacketType::try_from(byte1 >> 4)?;
    let flags = byte1 & 0x0F;

    let mut body = stream.split_to(size).freeze();
    body.advance(header_len);

    let expected_flags = match kind {
        PacketType::Publish => flags,
        PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
        _ => 0,
    };

    if flags != expected_flags {
        return Err(Error::InvalidFlags { kind, flags });
    }

    let packet = match kind {
        PacketType::Connect => Packet::Connect(Connect::read(body)?),
        PacketType::ConnAck => Packet::ConnAck(ConnAck::read(body)?),
        PacketType::Publish => Packet::Publish(Publish::read(flags, body)?),
        PacketType::PubAck => Packet::PubAck(Ack::read(body)?),
        PacketType::PubRec => Packet::PubRec(Ack::read(body)?),
        PacketType::PubRel => Packet::PubRel(Ack::read(body)?),
        PacketType::PubComp => Packet::PubComp(Ack::read(body)?),
        PacketType::Subscribe => Packet::Subscribe(Subscribe::read(body)?),
        PacketType::SubAck => Packet::SubAck(SubAck::read(body)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(body)?),
        PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(body)?),
        PacketType::PingReq => {
            codec::expect_empty(&body)?;
            Packet::PingReq
        }
        PacketType::PingResp => {
            codec::expect_empty(&body)?;
            Packet::PingResp
        }
        PacketType::Disconnect => Packet::Disconnect(Disconnect::read(body)?),
    };

    Ok(packet)
}

/// Convenience wrapper around [`read()`] for a buffer expected to hold exactly one packet.
pub fn read_bytes(bytes: &[u8]) -> Result<Packet, Error> {
    let mut stream = BytesMut::from(bytes);
    let packet = read(&mut stream, usize::MAX)?;

    if !stream.is_empty() {
        return Err(Error::Malformed("trailing bytes after packet"));
    }

    Ok(packet)
}

impl Packet {
    pub fn kind(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Encode the packet onto the end of `buf`, returning the number of bytes written.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize, Error> {
        let mut body = BytesMut::new();

        let flags = match self {
            Self::Connect(connect) => connect.write(&mut body)?,
            Self::ConnAck(connack) => connack.write(&mut body)?,
            Self::Publish(publish) => publish.write(&mut body)?,
            Self::PubAck(ack) | Self::PubRec(ack) | Self::PubComp(ack) => ack.write(&mut body)?,
            Self::PubRel(ack) => ack.write(&mut body)? | 0b0010,
            Self::Subscribe(subscribe) => subscribe.write(&mut body)?,
            Self::SubAck(suback) => suback.write(&mut body)?,
            Self::Unsubscribe(unsubscribe) => unsubscribe.write(&mut body)?,
            Self::UnsubAck(unsuback) => unsuback.write(&mut body)?,
            Self::PingReq | Self::PingResp => 0,
            Self::Disconnect(disconnect) => disconnect.write(&mut body)?,
        };

        let start = buf.len();

        buf.put_u8((self.kind() as u8) << 4 | flags);
        codec::write_var_int(buf, body.len())?;
        buf.extend_from_slice(&body);

        Ok(buf.len() - start)
    }

    /// Encode the packet into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Check the invariants the decoder alone doesn't enforce.
    ///
    /// A packet that fails this check must never reach application logic.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::Publish(publish) => publish.validate(),
            Self::PubAck(ack) | Self::PubRec(ack) | Self::PubRel(ack) | Self::PubComp(ack) => {
                nonzero_packet_id(ack.packet_id)
            }
            Self::Subscribe(subscribe) => {
                nonzero_packet_id(subscribe.packet_id)?;

                // It is a Protocol Error to have no filters [MQTT-3.8.3-2]
                if subscribe.filters.is_empty() {
                    return Err(Error::Malformed("SUBSCRIBE without topic filters"));
                }

                Ok(())
            }
            Self::SubAck(suback) => nonzero_packet_id(suback.packet_id),
            Self::Unsubscribe(unsubscribe) => {
                nonzero_packet_id(unsubscribe.packet_id)?;

                if unsubscribe.filters.is_empty() {
                    return Err(Error::Malformed("UNSUBSCRIBE without topic filters"));
                }

                Ok(())
            }
            Self::UnsubAck(unsuback) => nonzero_packet_id(unsuback.packet_id),
            Self::Connect(connect) => connect.validate(),
            Self::ConnAck(_) | Self::PingReq | Self::PingResp | Self::Disconnect(_) => Ok(()),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Connect(connect) => Some(&connect.client_id),
            _ => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Publish(publish) => Some(&publish.topic),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Publish(publish) => Some(&publish.payload),
            _ => None,
        }
    }

    pub fn qos(&self) -> Option<QoS> {
        match self {
            Self::Publish(publish) => Some(publish.qos),
            _ => None,
        }
    }

    /// The packet identifier, for the packet kinds that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(publish) => Some(publish.packet_id),
            Self::PubAck(ack) | Self::PubRec(ack) | Self::PubRel(ack) | Self::PubComp(ack) => {
                Some(ack.packet_id)
            }
            Self::Subscribe(subscribe) => Some(subscribe.packet_id),
            Self::SubAck(suback) => Some(suback.packet_id),
            Self::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            Self::UnsubAck(unsuback) => Some(unsuback.packet_id),
            _ => None,
        }
    }

    pub fn set_packet_id(&mut self, packet_id: u16) {
        match self {
            Self::Publish(publish) => publish.packet_id = packet_id,
            Self::PubAck(ack) | Self::PubRec(ack) | Self::PubRel(ack) | Self::PubComp(ack) => {
                ack.packet_id = packet_id
            }
            Self::Subscribe(subscribe) => subscribe.packet_id = packet_id,
            Self::SubAck(suback) => suback.packet_id = packet_id,
            Self::Unsubscribe(unsubscribe) => unsubscribe.packet_id = packet_id,
            Self::UnsubAck(unsuback) => unsuback.packet_id = packet_id,
            _ => (),
        }
    }

    /// The single reason code of packets that carry exactly one.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::ConnAck(connack) => Some(connack.reason),
            Self::PubAck(ack) | Self::PubRec(ack) | Self::PubRel(ack) | Self::PubComp(ack) => {
                Some(ack.reason)
            }
            Self::Disconnect(disconnect) => Some(disconnect.reason),
            _ => None,
        }
    }

    pub fn assigned_client_id(&self) -> Option<&str> {
        match self {
            Self::ConnAck(connack) => connack.properties.assigned_client_id(),
            _ => None,
        }
    }

    pub fn topic_filters(&self) -> Option<Vec<&str>> {
        match self {
            Self::Subscribe(subscribe) => {
                Some(subscribe.filters.iter().map(|it| it.path.as_str()).collect())
            }
            Self::Unsubscribe(unsubscribe) => {
                Some(unsubscribe.filters.iter().map(String::as_str).collect())
            }
            _ => None,
        }
    }

    pub fn subscription_id(&self) -> Option<u32> {
        match self {
            Self::Subscribe(subscribe) => subscribe.properties.subscription_id(),
            Self::Publish(publish) => publish.properties.subscription_id(),
            _ => None,
        }
    }

    pub fn keep_alive(&self) -> Option<u16> {
        match self {
            Self::Connect(connect) => Some(connect.keep_alive),
            _ => None,
        }
    }

    pub fn clean_start(&self) -> Option<bool> {
        match self {
            Self::Connect(connect) => Some(connect.clean_start),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Connect(connect) => connect.username.as_deref(),
            _ => None,
        }
    }

    pub fn password(&self) -> Option<&Bytes> {
        match self {
            Self::Connect(connect) => connect.password.as_ref(),
            _ => None,
        }
    }
}

fn nonzero_packet_id(packet_id: u16) -> Result<(), Error> {
    if packet_id == 0 {
        return Err(Error::Malformed("packet identifier cannot be zero"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn round_trip(packet: Packet) {
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(read_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn encode_decode_every_kind() {
        round_trip(Packet::Connect(Connect {
            client_id: "dev-1".into(),
            clean_start: true,
            keep_alive: 30,
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"secret")),
            will: Some(LastWill {
                topic: "dev-1/status".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: Properties::from(vec![Property::WillDelayInterval(5)]),
            }),
            properties: Properties::from(vec![Property::SessionExpiryInterval(0)]),
        }));
        round_trip(Packet::ConnAck(ConnAck {
            session_present: false,
            reason: ReasonCode::SUCCESS,
            properties: Properties::from(vec![
                Property::AssignedClientIdentifier("abc".into()),
                Property::MaximumQos(1),
            ]),
        }));
        round_trip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: 7,
            payload: Bytes::from_static(b"hello"),
            properties: Properties::from(vec![Property::SubscriptionIdentifier(300)]),
        }));
        round_trip(Packet::PubAck(Ack::new(7)));
        round_trip(Packet::PubRec(Ack {
            packet_id: 8,
            reason: ReasonCode::PACKET_IDENTIFIER_IN_USE,
            properties: Properties::default(),
        }));
        round_trip(Packet::PubRel(Ack::new(9)));
        round_trip(Packet::PubComp(Ack {
            packet_id: 10,
            reason: ReasonCode::SUCCESS,
            properties: Properties::from(vec![Property::ReasonString("done".into())]),
        }));
        round_trip(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![
                SubscribeFilter::new("a/b/#", QoS::AtLeastOnce),
                SubscribeFilter {
                    path: "c/+".into(),
                    qos: QoS::AtMostOnce,
                    no_local: true,
                    retain_as_published: true,
                    retain_handling: RetainHandling::DoNotSend,
                },
            ],
            properties: Properties::from(vec![Property::SubscriptionIdentifier(1)]),
        }));
        round_trip(Packet::SubAck(SubAck {
            packet_id: 1,
            reasons: vec![ReasonCode::GRANTED_QOS_1, ReasonCode::GRANTED_QOS_0],
            properties: Properties::default(),
        }));
        round_trip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["a/b/#".into()],
            properties: Properties::default(),
        }));
        round_trip(Packet::UnsubAck(UnsubAck {
            packet_id: 2,
            reasons: vec![ReasonCode::NO_SUBSCRIPTION_EXISTED],
            properties: Properties::default(),
        }));
        round_trip(Packet::PingReq);
        round_trip(Packet::PingResp);
        round_trip(Packet::Disconnect(Disconnect::new(ReasonCode::QOS_NOT_SUPPORTED)));
        round_trip(Packet::Disconnect(Disconnect::default()));
    }

    #[test]
    fn known_encodings() {
        expect_test::expect![[r#"
            [
                192,
                0,
            ]
        "#]]
        .assert_debug_eq(&Packet::PingReq.to_bytes().unwrap().to_vec());

        // The short form: Reason Code 0x00 with no properties may be omitted.
        expect_test::expect![[r#"
            [
                64,
                2,
                0,
                7,
            ]
        "#]]
        .assert_debug_eq(&Packet::PubAck(Ack::new(7)).to_bytes().unwrap().to_vec());

        expect_test::expect![[r#"
            [
                224,
                1,
                155,
            ]
        "#]]
        .assert_debug_eq(
            &Packet::Disconnect(Disconnect::new(ReasonCode::QOS_NOT_SUPPORTED))
                .to_bytes()
                .unwrap()
                .to_vec(),
        );
    }

    #[test]
    fn partial_reads() {
        let bytes = Packet::Publish(Publish::new("a/b", QoS::AtMostOnce, "payload"))
            .to_bytes()
            .unwrap();

        let mut stream = BytesMut::new();

        for (i, &byte) in bytes.iter().enumerate() {
            if i > 0 {
                assert!(
                    matches!(read(&mut stream, usize::MAX), Err(Error::InsufficientBytes(_))),
                    "{i}"
                );
                assert_eq!(stream.len(), i, "stream must not be consumed on a partial read");
            }

            stream.put_u8(byte);
        }

        assert!(matches!(read(&mut stream, usize::MAX), Ok(Packet::Publish(_))));
        assert!(stream.is_empty());
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(
            read_bytes(&[0xF0, 0x00]),
            Err(Error::InvalidPacketType(15))
        );
        assert_eq!(
            read_bytes(&[0x80, 0x00]),
            Err(Error::InvalidFlags {
                kind: PacketType::Subscribe,
                flags: 0
            })
        );
        assert_eq!(read_bytes(&[0x36, 0x00]), Err(Error::InvalidQos(3)));
        assert_eq!(
            read(&mut BytesMut::from(&[0x30, 0x7F][..]), 16),
            Err(Error::PacketTooLarge { size: 129, max: 16 })
        );
        assert!(read_bytes(&[0xC0, 0x01, 0x00]).unwrap_err().is_malformed());
    }

    #[test]
    fn validate() {
        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, "x");
        assert!(Packet::Publish(publish.clone()).validate().is_err());

        publish.packet_id = 1;
        assert_eq!(Packet::Publish(publish.clone()).validate(), Ok(()));

        publish.topic = "a/+".into();
        assert!(Packet::Publish(publish).validate().is_err());

        assert!(Packet::Subscribe(Subscribe::new(1, vec![])).validate().is_err());
        assert!(Packet::Subscribe(Subscribe::new(0, vec![SubscribeFilter::new(
            "a",
            QoS::AtMostOnce
        )]))
        .validate()
        .is_err());
        assert!(Packet::PubAck(Ack::new(0)).validate().is_err());

        // QoS 2 is well-formed; whether it is supported is a policy decision.
        let mut publish = Publish::new("hello", QoS::ExactlyOnce, "x");
        publish.packet_id = 3;
        assert_eq!(Packet::Publish(publish).validate(), Ok(()));
    }

    #[test]
    fn accessors() {
        let mut packet = Packet::Subscribe(Subscribe::new(
            0,
            vec![SubscribeFilter::new("sport/#", QoS::AtLeastOnce)],
        ));

        packet.set_packet_id(4);
        assert_eq!(packet.packet_id(), Some(4));
        assert_eq!(packet.topic_filters(), Some(vec!["sport/#"]));
        assert_eq!(packet.client_id(), None);
        assert_eq!(Packet::PingReq.packet_id(), None);
        assert_eq!(
            format!("{}", ReasonCode::QOS_NOT_SUPPORTED),
            "QoSNotSupported (0x9b)"
        );
    }
}
