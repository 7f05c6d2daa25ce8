use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{read_string, read_u16, read_u8, write_string};
use super::{Error, Properties, QoS, ReasonCode};

/// Whether retained messages are sent when a subscription is established.
///
/// Retained messages aren't supported by this broker, but the option is still carried on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendAtNewSubscribe = 1,
    DoNotSend = 2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::default(),
        }
    }

    fn read(buf: &mut Bytes) -> Result<Self, Error> {
        let path = read_string(buf)?;
        let options = read_u8(buf)?;

        // Bits 6 and 7 of the Subscription Options byte are reserved for future use.
        // The Server MUST treat a SUBSCRIBE packet as malformed if any of Reserved bits
        // in the Payload are non-zero [MQTT-3.8.3-5].
        if options & 0b1100_0000 != 0 {
            return Err(Error::Malformed("reserved subscription option bits are set"));
        }

        let retain_handling = match (options >> 4) & 0b11 {
            0 => RetainHandling::SendAtSubscribe,
            1 => RetainHandling::SendAtNewSubscribe,
            2 => RetainHandling::DoNotSend,
            _ => return Err(Error::Malformed("retain handling of 3")),
        };

        Ok(Self {
            path,
            qos: QoS::try_from(options & 0b11)?,
            no_local: options & 0b0100 != 0,
            retain_as_published: options & 0b1000 != 0,
            retain_handling,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        write_string(buf, &self.path)?;
        buf.put_u8(
            (self.retain_handling as u8) << 4
                | (self.retain_as_published as u8) << 3
                | (self.no_local as u8) << 2
                | self.qos as u8,
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

impl Subscribe {
    pub fn new(packet_id: u16, filters: Vec<SubscribeFilter>) -> Self {
        Self {
            packet_id,
            filters,
            properties: Properties::default(),
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let packet_id = read_u16(&mut buf)?;
        let properties = Properties::read(&mut buf)?;

        let mut filters = Vec::new();

        while buf.has_remaining() {
            filters.push(SubscribeFilter::read(&mut buf)?);
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;

        for filter in &self.filters {
            filter.write(buf)?;
        }

        Ok(0b0010)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One per filter in the `SUBSCRIBE`, in the same order.
    pub reasons: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubAck {
    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let packet_id = read_u16(&mut buf)?;
        let properties = Properties::read(&mut buf)?;
        let reasons = buf.iter().copied().map(ReasonCode).collect();

        Ok(Self {
            packet_id,
            reasons,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        buf.extend(self.reasons.iter().map(|it| it.0));
        Ok(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub fn new(packet_id: u16, filters: Vec<String>) -> Self {
        Self {
            packet_id,
            filters,
            properties: Properties::default(),
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let packet_id = read_u16(&mut buf)?;
        let properties = Properties::read(&mut buf)?;

        let mut filters = Vec::new();

        while buf.has_remaining() {
            filters.push(read_string(&mut buf)?);
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;

        for filter in &self.filters {
            write_string(buf, filter)?;
        }

        Ok(0b0010)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub reasons: Vec<ReasonCode>,
    pub properties: Properties,
}

impl UnsubAck {
    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let packet_id = read_u16(&mut buf)?;
        let properties = Properties::read(&mut buf)?;
        let reasons = buf.iter().copied().map(ReasonCode).collect();

        Ok(Self {
            packet_id,
            reasons,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        buf.extend(self.reasons.iter().map(|it| it.0));
        Ok(0)
    }
}
