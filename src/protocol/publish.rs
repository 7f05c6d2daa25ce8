use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{expect_empty, read_string, read_u16, read_u8, write_string};
use super::{Error, Properties, QoS, ReasonCode};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero for QoS 0, assigned from the sender's pool otherwise.
    pub packet_id: u16,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub(super) fn read(flags: u8, mut buf: Bytes) -> Result<Self, Error> {
        let qos = QoS::try_from((flags >> 1) & 0b11)?;
        let topic = read_string(&mut buf)?;

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => read_u16(&mut buf)?,
        };

        let properties = Properties::read(&mut buf)?;

        Ok(Self {
            dup: flags & 0b1000 != 0,
            qos,
            retain: flags & 1 != 0,
            topic,
            packet_id,
            payload: buf,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        write_string(buf, &self.topic)?;

        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.packet_id);
        }

        self.properties.write(buf)?;
        buf.extend_from_slice(&self.payload);

        Ok((self.dup as u8) << 3 | (self.qos as u8) << 1 | self.retain as u8)
    }

    pub(super) fn validate(&self) -> Result<(), Error> {
        match self.qos {
            QoS::AtMostOnce if self.packet_id != 0 => {
                return Err(Error::Malformed("QoS 0 PUBLISH with a packet identifier"));
            }
            // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2]
            QoS::AtMostOnce if self.dup => {
                return Err(Error::Malformed("QoS 0 PUBLISH with DUP set"));
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce if self.packet_id == 0 => {
                return Err(Error::Malformed("QoS > 0 PUBLISH without a packet identifier"));
            }
            _ => (),
        }

        // The Topic Name in the PUBLISH packet MUST NOT contain wildcard characters [MQTT-3.3.2-2]
        if self.topic.contains(['+', '#']) {
            return Err(Error::Malformed("wildcard in PUBLISH topic name"));
        }

        // An empty topic is only allowed if it's standing in for a Topic Alias.
        if self.topic.is_empty() && self.properties.topic_alias().is_none() {
            return Err(Error::Malformed("empty PUBLISH topic name"));
        }

        Ok(())
    }
}

/// The body shared by `PUBACK`, `PUBREC`, `PUBREL` and `PUBCOMP`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason: ReasonCode,
    pub properties: Properties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let packet_id = read_u16(&mut buf)?;

        // The Reason Code and Property Length can be omitted if the Reason Code is 0x00 (Success)
        // and there are no Properties.
        let reason = if buf.has_remaining() {
            ReasonCode(read_u8(&mut buf)?)
        } else {
            ReasonCode::SUCCESS
        };

        let properties = if buf.has_remaining() {
            Properties::read(&mut buf)?
        } else {
            Properties::default()
        };

        expect_empty(&buf)?;

        Ok(Self {
            packet_id,
            reason,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u16(self.packet_id);

        if self.reason != ReasonCode::SUCCESS || !self.properties.is_empty() {
            buf.put_u8(self.reason.0);
            self.properties.write(buf)?;
        }

        Ok(0)
    }
}
