use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{expect_empty, read_u8};
use super::{Error, Properties, ReasonCode};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            reason,
            properties: Properties::default(),
        }
    }

    pub(super) fn read(mut buf: Bytes) -> Result<Self, Error> {
        // The Reason Code and Property Length can be omitted if the Reason Code is 0x00 (Normal
        // disconnection) and there are no Properties. In this case the DISCONNECT has a Remaining
        // Length of 0.
        if !buf.has_remaining() {
            return Ok(Self::default());
        }

        let reason = ReasonCode(read_u8(&mut buf)?);

        let properties = if buf.has_remaining() {
            Properties::read(&mut buf)?
        } else {
            Properties::default()
        };

        expect_empty(&buf)?;

        Ok(Self { reason, properties })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) -> Result<u8, Error> {
        match (self.reason, self.properties.is_empty()) {
            (ReasonCode::NORMAL_DISCONNECTION, true) => (),
            (reason, true) => buf.put_u8(reason.0),
            (reason, false) => {
                buf.put_u8(reason.0);
                self.properties.write(buf)?;
            }
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_bytes, Packet, Property};

    #[test]
    fn empty_body_is_normal_disconnection() {
        assert_eq!(
            read_bytes(&[0xE0, 0x00]),
            Ok(Packet::Disconnect(Disconnect::default()))
        );
    }

    #[test]
    fn reason_string() {
        let mut disconnect = Disconnect::new(ReasonCode::KEEP_ALIVE_TIMEOUT);
        disconnect
            .properties
            .push(Property::ReasonString("keep alive timeout".into()));

        let packet = read_bytes(&Packet::Disconnect(disconnect).to_bytes().unwrap()).unwrap();

        assert_eq!(packet.reason_code(), Some(ReasonCode::KEEP_ALIVE_TIMEOUT));

        let Packet::Disconnect(disconnect) = packet else {
            panic!("expected DISCONNECT, got {packet:?}");
        };

        assert_eq!(disconnect.properties.reason_string(), Some("keep alive timeout"));
    }
}
