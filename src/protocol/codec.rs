//! Primitive encodings shared by every packet: integers, Variable Byte Integers,
//! length-prefixed strings and binary data.
//!
//! https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901006

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

/// The largest value a Variable Byte Integer can hold (`0xFF, 0xFF, 0xFF, 0x7F`).
pub const VAR_INT_MAX: usize = 268_435_455;

pub(crate) fn read_u8(buf: &mut Bytes) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::Malformed("unexpected end of packet"));
    }

    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut Bytes) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(Error::Malformed("unexpected end of packet"));
    }

    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut Bytes) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::Malformed("unexpected end of packet"));
    }

    Ok(buf.get_u32())
}

pub(crate) fn read_var_int(buf: &mut Bytes) -> Result<u32, Error> {
    let mut value = 0u32;

    for shift in (0..4).map(|i| i * 7) {
        let byte = read_u8(buf)?;
        value |= u32::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(Error::MalformedVarInt)
}

pub(crate) fn read_binary(buf: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(buf)? as usize;

    if buf.remaining() < len {
        return Err(Error::Malformed("length-prefixed field overruns packet"));
    }

    Ok(buf.split_to(len))
}

pub(crate) fn read_string(buf: &mut Bytes) -> Result<String, Error> {
    let bytes = read_binary(buf)?;
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)?;

    // UTF-8 Encoded Strings MUST NOT include an encoding of the null character U+0000 [MQTT-1.5.4-2]
    if s.contains('\0') {
        return Err(Error::InvalidUtf8);
    }

    Ok(s)
}

pub(crate) fn write_var_int(buf: &mut BytesMut, value: usize) -> Result<usize, Error> {
    if value > VAR_INT_MAX {
        return Err(Error::PayloadTooLong(value));
    }

    let mut value = value;
    let mut written = 0;

    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

pub(crate) fn write_binary(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(bytes.len()).map_err(|_| Error::PayloadTooLong(bytes.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), Error> {
    write_binary(buf, s.as_bytes())
}

/// Parse the fixed header at the start of `stream` without consuming it.
///
/// Returns the first byte, the Remaining Length and the length of the fixed header itself.
pub(crate) fn fixed_header(stream: &[u8]) -> Result<(u8, usize, usize), Error> {
    let Some((&byte1, rest)) = stream.split_first() else {
        return Err(Error::InsufficientBytes(2));
    };

    let mut remaining_len = 0usize;

    for (i, &byte) in rest.iter().take(4).enumerate() {
        remaining_len |= usize::from(byte & 0x7F) << (i * 7);

        if byte & 0x80 == 0 {
            return Ok((byte1, remaining_len, i + 2));
        }
    }

    if rest.len() >= 4 {
        return Err(Error::MalformedVarInt);
    }

    Err(Error::InsufficientBytes(1))
}

/// Fail if a packet body has bytes left over after decoding.
pub(crate) fn expect_empty(buf: &Bytes) -> Result<(), Error> {
    if buf.has_remaining() {
        return Err(Error::Malformed("trailing bytes after packet"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    fn var_int_len(value: usize) -> usize {
        match value {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }

    #[test]
    fn var_int_boundaries() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, VAR_INT_MAX] {
            let mut buf = BytesMut::new();
            let written = write_var_int(&mut buf, value).unwrap();

            assert_eq!(written, var_int_len(value), "{value}");
            assert_eq!(
                read_var_int(&mut buf.freeze()).unwrap() as usize,
                value,
                "{value}"
            );
        }

        assert_eq!(
            write_var_int(&mut BytesMut::new(), VAR_INT_MAX + 1),
            Err(Error::PayloadTooLong(VAR_INT_MAX + 1))
        );
    }

    #[test]
    fn fixed_header_needs_more() {
        assert_eq!(fixed_header(&[]), Err(Error::InsufficientBytes(2)));
        assert_eq!(fixed_header(&[0x30]), Err(Error::InsufficientBytes(1)));
        assert_eq!(fixed_header(&[0x30, 0x80]), Err(Error::InsufficientBytes(1)));
        assert_eq!(fixed_header(&[0x30, 0x80, 0x01]), Ok((0x30, 128, 3)));
        assert_eq!(
            fixed_header(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(Error::MalformedVarInt)
        );
    }

    #[test]
    fn string_rejects_null() {
        let mut buf = Bytes::from_static(b"\x00\x03a\x00b");
        assert_eq!(read_string(&mut buf), Err(Error::InvalidUtf8));

        let mut buf = Bytes::from_static(b"\x00\x05ab");
        assert!(matches!(read_string(&mut buf), Err(Error::Malformed(_))));
    }
}
