use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    expect_empty, read_binary, read_string, read_u16, read_u8, write_binary, write_string,
};
use super::{Error, Properties, QoS, ReasonCode};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 5;

mod flags {
    pub const USERNAME: u8 = 0x80;
    pub const PASSWORD: u8 = 0x40;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const WILL_QOS_SHIFT: u8 = 3;
    pub const WILL: u8 = 0x04;
    pub const CLEAN_START: u8 = 0x02;
    pub const RESERVED: u8 = 0x01;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Connect {
    /// May be empty, in which case the server assigns one.
    pub client_id: String,
    pub clean_start: bool,
    /// Keep Alive interval in seconds, `0` disables it.
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
    pub properties: Properties,
}

/// The Will Message of a `CONNECT`. Decoded and carried, never published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_start: true,
            ..Default::default()
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let name = read_string(&mut buf)?;
        let level = read_u8(&mut buf)?;

        if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
            return Err(Error::UnsupportedProtocol { name, level });
        }

        let connect_flags = read_u8(&mut buf)?;

        // The Server MUST validate that the reserved flag in the CONNECT packet is set to 0 [MQTT-3.1.2-3]
        if connect_flags & flags::RESERVED != 0 {
            return Err(Error::Malformed("reserved CONNECT flag is set"));
        }

        let keep_alive = read_u16(&mut buf)?;
        let properties = Properties::read(&mut buf)?;
        let client_id = read_string(&mut buf)?;

        let will = if connect_flags & flags::WILL != 0 {
            let properties = Properties::read(&mut buf)?;
            let topic = read_string(&mut buf)?;
            let payload = read_binary(&mut buf)?;

            Some(LastWill {
                topic,
                payload,
                qos: QoS::try_from((connect_flags >> flags::WILL_QOS_SHIFT) & 0b11)?,
                retain: connect_flags & flags::WILL_RETAIN != 0,
                properties,
            })
        } else {
            // If the Will Flag is set to 0, then the Will QoS MUST be set to 0 (0x00) [MQTT-3.1.2-11]
            // and Will Retain MUST be set to 0 [MQTT-3.1.2-13].
            if connect_flags & (flags::WILL_RETAIN | 0b11 << flags::WILL_QOS_SHIFT) != 0 {
                return Err(Error::Malformed("will QoS or retain set without a will"));
            }

            None
        };

        let username = (connect_flags & flags::USERNAME != 0)
            .then(|| read_string(&mut buf))
            .transpose()?;

        let password = (connect_flags & flags::PASSWORD != 0)
            .then(|| read_binary(&mut buf))
            .transpose()?;

        expect_empty(&buf)?;

        Ok(Self {
            client_id,
            clean_start: connect_flags & flags::CLEAN_START != 0,
            keep_alive,
            username,
            password,
            will,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut connect_flags = 0;

        if self.clean_start {
            connect_flags |= flags::CLEAN_START;
        }

        if let Some(will) = &self.will {
            connect_flags |= flags::WILL | (will.qos as u8) << flags::WILL_QOS_SHIFT;

            if will.retain {
                connect_flags |= flags::WILL_RETAIN;
            }
        }

        if self.username.is_some() {
            connect_flags |= flags::USERNAME;
        }

        if self.password.is_some() {
            connect_flags |= flags::PASSWORD;
        }

        buf.put_u8(connect_flags);
        buf.put_u16(self.keep_alive);
        self.properties.write(buf)?;
        write_string(buf, &self.client_id)?;

        if let Some(will) = &self.will {
            will.properties.write(buf)?;
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        if let Some(username) = &self.username {
            write_string(buf, username)?;
        }

        if let Some(password) = &self.password {
            write_binary(buf, password)?;
        }

        Ok(0)
    }

    pub(super) fn validate(&self) -> Result<(), Error> {
        if let Some(will) = &self.will {
            if will.topic.is_empty() || will.topic.contains(['+', '#']) {
                return Err(Error::Malformed("invalid will topic"));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason: ReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            session_present: false,
            reason,
            properties: Properties::default(),
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        let ack_flags = read_u8(&mut buf)?;

        if ack_flags & !1 != 0 {
            return Err(Error::Malformed("reserved CONNACK flags are set"));
        }

        let reason = ReasonCode(read_u8(&mut buf)?);
        let properties = Properties::read(&mut buf)?;

        expect_empty(&buf)?;

        Ok(Self {
            session_present: ack_flags & 1 != 0,
            reason,
            properties,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        buf.put_u8(self.session_present as u8);
        buf.put_u8(self.reason.0);
        self.properties.write(buf)?;
        Ok(0)
    }
}
