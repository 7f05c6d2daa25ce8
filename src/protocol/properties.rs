use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    read_binary, read_string, read_u16, read_u32, read_u8, read_var_int, write_binary,
    write_string, write_var_int,
};
use super::Error;

/// A single MQTT v5 property.
///
/// https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901027
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQos(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    fn read(buf: &mut Bytes) -> Result<Self, Error> {
        let id = read_var_int(buf)?;

        Ok(match id {
            0x01 => Self::PayloadFormatIndicator(read_u8(buf)?),
            0x02 => Self::MessageExpiryInterval(read_u32(buf)?),
            0x03 => Self::ContentType(read_string(buf)?),
            0x08 => Self::ResponseTopic(read_string(buf)?),
            0x09 => Self::CorrelationData(read_binary(buf)?),
            0x0B => {
                let id = read_var_int(buf)?;

                // It is a Protocol Error if the Subscription Identifier has a value of 0.
                if id == 0 {
                    return Err(Error::Malformed("subscription identifier of 0"));
                }

                Self::SubscriptionIdentifier(id)
            }
            0x11 => Self::SessionExpiryInterval(read_u32(buf)?),
            0x12 => Self::AssignedClientIdentifier(read_string(buf)?),
            0x13 => Self::ServerKeepAlive(read_u16(buf)?),
            0x15 => Self::AuthenticationMethod(read_string(buf)?),
            0x16 => Self::AuthenticationData(read_binary(buf)?),
            0x17 => Self::RequestProblemInformation(read_u8(buf)?),
            0x18 => Self::WillDelayInterval(read_u32(buf)?),
            0x19 => Self::RequestResponseInformation(read_u8(buf)?),
            0x1A => Self::ResponseInformation(read_string(buf)?),
            0x1C => Self::ServerReference(read_string(buf)?),
            0x1F => Self::ReasonString(read_string(buf)?),
            0x21 => Self::ReceiveMaximum(read_u16(buf)?),
            0x22 => Self::TopicAliasMaximum(read_u16(buf)?),
            0x23 => Self::TopicAlias(read_u16(buf)?),
            0x24 => Self::MaximumQos(read_u8(buf)?),
            0x25 => Self::RetainAvailable(read_u8(buf)?),
            0x26 => Self::UserProperty(read_string(buf)?, read_string(buf)?),
            0x27 => Self::MaximumPacketSize(read_u32(buf)?),
            0x28 => Self::WildcardSubscriptionAvailable(read_u8(buf)?),
            0x29 => Self::SubscriptionIdentifierAvailable(read_u8(buf)?),
            0x2A => Self::SharedSubscriptionAvailable(read_u8(buf)?),
            other => return Err(Error::InvalidProperty(other)),
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::PayloadFormatIndicator(v) => put_u8(buf, 0x01, *v),
            Self::MessageExpiryInterval(v) => put_u32(buf, 0x02, *v),
            Self::ContentType(v) => put_string(buf, 0x03, v)?,
            Self::ResponseTopic(v) => put_string(buf, 0x08, v)?,
            Self::CorrelationData(v) => {
                buf.put_u8(0x09);
                write_binary(buf, v)?;
            }
            Self::SubscriptionIdentifier(v) => {
                buf.put_u8(0x0B);
                write_var_int(buf, *v as usize)?;
            }
            Self::SessionExpiryInterval(v) => put_u32(buf, 0x11, *v),
            Self::AssignedClientIdentifier(v) => put_string(buf, 0x12, v)?,
            Self::ServerKeepAlive(v) => put_u16(buf, 0x13, *v),
            Self::AuthenticationMethod(v) => put_string(buf, 0x15, v)?,
            Self::AuthenticationData(v) => {
                buf.put_u8(0x16);
                write_binary(buf, v)?;
            }
            Self::RequestProblemInformation(v) => put_u8(buf, 0x17, *v),
            Self::WillDelayInterval(v) => put_u32(buf, 0x18, *v),
            Self::RequestResponseInformation(v) => put_u8(buf, 0x19, *v),
            Self::ResponseInformation(v) => put_string(buf, 0x1A, v)?,
            Self::ServerReference(v) => put_string(buf, 0x1C, v)?,
            Self::ReasonString(v) => put_string(buf, 0x1F, v)?,
            Self::ReceiveMaximum(v) => put_u16(buf, 0x21, *v),
            Self::TopicAliasMaximum(v) => put_u16(buf, 0x22, *v),
            Self::TopicAlias(v) => put_u16(buf, 0x23, *v),
            Self::MaximumQos(v) => put_u8(buf, 0x24, *v),
            Self::RetainAvailable(v) => put_u8(buf, 0x25, *v),
            Self::UserProperty(k, v) => {
                put_string(buf, 0x26, k)?;
                write_string(buf, v)?;
            }
            Self::MaximumPacketSize(v) => put_u32(buf, 0x27, *v),
            Self::WildcardSubscriptionAvailable(v) => put_u8(buf, 0x28, *v),
            Self::SubscriptionIdentifierAvailable(v) => put_u8(buf, 0x29, *v),
            Self::SharedSubscriptionAvailable(v) => put_u8(buf, 0x2A, *v),
        }

        Ok(())
    }
}

fn put_u8(buf: &mut BytesMut, id: u8, value: u8) {
    buf.put_u8(id);
    buf.put_u8(value);
}

fn put_u16(buf: &mut BytesMut, id: u8, value: u16) {
    buf.put_u8(id);
    buf.put_u16(value);
}

fn put_u32(buf: &mut BytesMut, id: u8, value: u32) {
    buf.put_u8(id);
    buf.put_u32(value);
}

fn put_string(buf: &mut BytesMut, id: u8, value: &str) -> Result<(), Error> {
    buf.put_u8(id);
    write_string(buf, value)
}

/// The property list of a packet, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties(pub Vec<Property>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    /// Replace every property for which `same` returns true with `property`.
    pub fn replace(&mut self, property: Property, same: impl Fn(&Property) -> bool) {
        self.0.retain(|it| !same(it));
        self.0.push(property);
    }

    pub fn assigned_client_id(&self) -> Option<&str> {
        self.iter().find_map(|it| match it {
            Property::AssignedClientIdentifier(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn subscription_id(&self) -> Option<u32> {
        self.iter().find_map(|it| match it {
            Property::SubscriptionIdentifier(id) => Some(*id),
            _ => None,
        })
    }

    pub fn maximum_qos(&self) -> Option<u8> {
        self.iter().find_map(|it| match it {
            Property::MaximumQos(qos) => Some(*qos),
            _ => None,
        })
    }

    pub fn reason_string(&self) -> Option<&str> {
        self.iter().find_map(|it| match it {
            Property::ReasonString(reason) => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn server_keep_alive(&self) -> Option<u16> {
        self.iter().find_map(|it| match it {
            Property::ServerKeepAlive(seconds) => Some(*seconds),
            _ => None,
        })
    }

    pub fn topic_alias(&self) -> Option<u16> {
        self.iter().find_map(|it| match it {
            Property::TopicAlias(alias) => Some(*alias),
            _ => None,
        })
    }

    pub(crate) fn read(buf: &mut Bytes) -> Result<Self, Error> {
        let len = read_var_int(buf)? as usize;

        if buf.len() < len {
            return Err(Error::Malformed("property length overruns packet"));
        }

        let mut props = buf.split_to(len);
        let mut properties = Vec::new();

        while !props.is_empty() {
            properties.push(Property::read(&mut props)?);
        }

        Ok(Self(properties))
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let mut props = BytesMut::new();

        for property in &self.0 {
            property.write(&mut props)?;
        }

        write_var_int(buf, props.len())?;
        buf.extend_from_slice(&props);
        Ok(())
    }
}

impl From<Vec<Property>> for Properties {
    fn from(properties: Vec<Property>) -> Self {
        Self(properties)
    }
}
