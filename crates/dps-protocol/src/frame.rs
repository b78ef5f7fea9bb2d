//! OpenDPS frame construction, CRC handling and payload unpacking

use bytes::{Buf, Bytes};

use crate::escape::{self, EOF, SOF};
use crate::types::ProtocolError;

/// Minimum frame size on the wire: SOF + CRC(2) + EOF
pub const MIN_FRAME_SIZE: usize = 4;

/// Update a CRC-16/CCITT (XMODEM flavour, initial value 0) with one byte
#[must_use]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut x = ((crc >> 8) as u8) ^ byte;
    x ^= x >> 4;
    let x = u16::from(x);
    (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
}

/// CRC-16/CCITT over a whole buffer
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| crc16_update(crc, b))
}

/// Builds an outgoing frame one field at a time
///
/// Every packed byte is escaped as it is written and folded into the running
/// CRC. [`FrameBuilder::end`] appends the CRC and end marker.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    data: Vec<u8>,
    crc: u16,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(32);
        data.push(SOF);
        Self { data, crc: 0 }
    }

    fn push(&mut self, byte: u8, update_crc: bool) {
        if update_crc {
            self.crc = crc16_update(self.crc, byte);
        }
        escape::escape_into(&mut self.data, byte);
    }

    pub fn pack8(&mut self, value: u8) -> &mut Self {
        self.push(value, true);
        self
    }

    /// Pack a 16 bit value, MSB first
    pub fn pack16(&mut self, value: u16) -> &mut Self {
        for b in value.to_be_bytes() {
            self.push(b, true);
        }
        self
    }

    /// Pack a 32 bit value, MSB first
    pub fn pack32(&mut self, value: u32) -> &mut Self {
        for b in value.to_be_bytes() {
            self.push(b, true);
        }
        self
    }

    /// Pack the bytes of `text` followed by a NUL terminator
    pub fn pack_cstr(&mut self, text: &str) -> &mut Self {
        for &b in text.as_bytes() {
            self.push(b, true);
        }
        self.push(0, true);
        self
    }

    /// Pack raw bytes with no terminator or length prefix
    pub fn pack_bytes(&mut self, data: &[u8]) -> &mut Self {
        for &b in data {
            self.push(b, true);
        }
        self
    }

    /// Pack an `f32` in the device's native (little-endian) memory layout
    pub fn pack_f32_le(&mut self, value: f32) -> &mut Self {
        self.pack_bytes(&value.to_le_bytes())
    }

    /// Seal the frame: append the CRC (MSB first) and the end marker
    #[must_use]
    pub fn end(mut self) -> Frame {
        let [hi, lo] = self.crc.to_be_bytes();
        self.push(hi, false);
        self.push(lo, false);
        self.data.push(EOF);
        Frame { data: self.data }
    }
}

/// A sealed frame ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    /// Escaped wire bytes, markers included
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of bytes on the wire
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A received frame that passed framing and CRC checks
///
/// Fields are read sequentially from the front of the payload.
#[derive(Debug, Clone)]
pub struct FrameReader {
    payload: Bytes,
}

impl FrameReader {
    /// Decode a received frame: unescape, verify and strip the CRC
    pub fn from_received(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::FrameTooShort(raw.len()));
        }

        let mut data = escape::unescape(raw)?;
        if data.len() < 2 {
            return Err(ProtocolError::FrameTooShort(raw.len()));
        }

        let crc_offset = data.len() - 2;
        let received_crc = u16::from_be_bytes([data[crc_offset], data[crc_offset + 1]]);
        let calculated_crc = crc16(&data[..crc_offset]);

        if received_crc != calculated_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: calculated_crc,
                actual: received_crc,
            });
        }

        data.truncate(crc_offset);
        Ok(Self {
            payload: Bytes::from(data),
        })
    }

    fn need(&self, needed: usize) -> Result<(), ProtocolError> {
        let remaining = self.payload.remaining();
        if remaining < needed {
            return Err(ProtocolError::Truncated { needed, remaining });
        }
        Ok(())
    }

    pub fn unpack8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.payload.get_u8())
    }

    pub fn unpack16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.payload.get_u16())
    }

    pub fn unpack32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.payload.get_u32())
    }

    /// Read a 32 bit IEEE-754 float sent as a big-endian word
    pub fn unpack_f32(&mut self) -> Result<f32, ProtocolError> {
        self.unpack32().map(f32::from_bits)
    }

    /// Read bytes up to a NUL or the end of the payload
    ///
    /// The terminator is consumed but not returned. Invalid UTF-8 is replaced
    /// rather than rejected.
    pub fn unpack_cstr(&mut self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        let text = self.payload.split_to(end);
        if self.payload.has_remaining() {
            self.payload.advance(1);
        }
        String::from_utf8_lossy(&text).into_owned()
    }

    /// All unread bytes
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        self.payload.chunk()
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        !self.payload.has_remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc_empty() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_ping_frame_bytes() {
        let mut builder = FrameBuilder::new();
        builder.pack8(0x01);
        let frame = builder.end();

        assert_eq!(crc16(&[0x01]), 0x1021);
        assert_eq!(frame.bytes(), &[SOF, 0x01, 0x10, 0x21, EOF]);

        let mut reader = FrameReader::from_received(frame.bytes()).unwrap();
        assert_eq!(reader.unpack8().unwrap(), 0x01);
        assert!(reader.at_end());
    }

    #[test]
    fn test_roundtrip_full_ranges() {
        let mut builder = FrameBuilder::new();
        builder
            .pack8(0x00)
            .pack8(0xFF)
            .pack16(0x0000)
            .pack16(0xFFFF)
            .pack16(0x7E7F)
            .pack32(0x0000_0000)
            .pack32(0xFFFF_FFFF)
            .pack32(0x7D7E_7F20)
            .pack_cstr("vöut~}\u{7f}");
        let frame = builder.end();

        let mut reader = FrameReader::from_received(frame.bytes()).unwrap();
        assert_eq!(reader.unpack8().unwrap(), 0x00);
        assert_eq!(reader.unpack8().unwrap(), 0xFF);
        assert_eq!(reader.unpack16().unwrap(), 0x0000);
        assert_eq!(reader.unpack16().unwrap(), 0xFFFF);
        assert_eq!(reader.unpack16().unwrap(), 0x7E7F);
        assert_eq!(reader.unpack32().unwrap(), 0x0000_0000);
        assert_eq!(reader.unpack32().unwrap(), 0xFFFF_FFFF);
        assert_eq!(reader.unpack32().unwrap(), 0x7D7E_7F20);
        assert_eq!(reader.unpack_cstr(), "vöut~}\u{7f}");
        assert!(reader.at_end());
    }

    #[test]
    fn test_no_reserved_bytes_is_verbatim() {
        let payload = [0x10, 0x20, 0x30, 0x40];
        let mut builder = FrameBuilder::new();
        builder.pack_bytes(&payload);
        let frame = builder.end();
        assert_eq!(
            frame.bytes(),
            &[SOF, 0x10, 0x20, 0x30, 0x40, 0xD0, 0x30, EOF]
        );
    }

    #[test]
    fn test_reserved_bytes_survive() {
        let payload = [SOF, escape::DLE, EOF];
        let mut builder = FrameBuilder::new();
        builder.pack_bytes(&payload);
        let frame = builder.end();
        let reader = FrameReader::from_received(frame.bytes()).unwrap();
        assert_eq!(reader.remaining(), &payload);
    }

    #[test]
    fn test_any_bit_flip_fails_crc() {
        let mut builder = FrameBuilder::new();
        builder.pack8(0x04).pack16(0x1234).pack_cstr("cv");
        let frame = builder.end().into_bytes();

        for index in 1..frame.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                let result = FrameReader::from_received(&corrupted);
                assert!(
                    matches!(result, Err(ProtocolError::CrcMismatch { .. })),
                    "flip of bit {bit} at {index} was not detected: {result:?}"
                );
            }
        }
    }

    #[test]
    fn test_too_short() {
        let result = FrameReader::from_received(&[SOF, 0x01, EOF]);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort(3))));
    }

    #[test]
    fn test_unpack_past_end() {
        let mut builder = FrameBuilder::new();
        builder.pack8(0x01);
        let mut reader = FrameReader::from_received(builder.end().bytes()).unwrap();
        reader.unpack8().unwrap();
        assert!(matches!(
            reader.unpack16(),
            Err(ProtocolError::Truncated {
                needed: 2,
                remaining: 0
            })
        ));
    }

    #[test]
    fn test_cstr_without_terminator() {
        let mut builder = FrameBuilder::new();
        builder.pack_bytes(b"abc");
        let mut reader = FrameReader::from_received(builder.end().bytes()).unwrap();
        assert_eq!(reader.unpack_cstr(), "abc");
        assert!(reader.at_end());
        assert_eq!(reader.unpack_cstr(), "");
    }

    #[test]
    fn test_f32_le_layout() {
        let mut builder = FrameBuilder::new();
        builder.pack_f32_le(1.0);
        let reader = FrameReader::from_received(builder.end().bytes()).unwrap();
        assert_eq!(reader.remaining(), &[0x00, 0x00, 0x80, 0x3F]);
    }
}
