//! Byte stuffing for OpenDPS frames
//!
//! A frame on the wire is `SOF <escaped payload> EOF`. Any payload byte equal
//! to one of the three marker values is sent as `DLE, byte ^ XOR`.

use crate::types::ProtocolError;

/// Start of frame marker
pub const SOF: u8 = 0x7E;
/// Escape marker
pub const DLE: u8 = 0x7D;
/// End of frame marker
pub const EOF: u8 = 0x7F;
/// Mask applied to an escaped byte
pub const XOR: u8 = 0x20;

/// Returns true if `byte` must be escaped inside a frame
#[must_use]
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, SOF | DLE | EOF)
}

/// Append `byte` to `out`, escaping it if needed
pub fn escape_into(out: &mut Vec<u8>, byte: u8) {
    if is_reserved(byte) {
        out.push(DLE);
        out.push(byte ^ XOR);
    } else {
        out.push(byte);
    }
}

/// Strip the frame markers from `frame` and undo byte stuffing
///
/// `frame` must be a complete frame including its SOF and EOF markers.
pub fn unescape(frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::FrameTooShort(frame.len()));
    }
    if frame[0] != SOF || frame[frame.len() - 1] != EOF {
        return Err(ProtocolError::NotFramed);
    }

    let interior = &frame[1..frame.len() - 1];
    let mut data = Vec::with_capacity(interior.len());
    let mut in_escape = false;

    for &byte in interior {
        if in_escape {
            data.push(byte ^ XOR);
            in_escape = false;
        } else if byte == DLE {
            in_escape = true;
        } else {
            data.push(byte);
        }
    }

    // A trailing escape has nothing left to modify and is dropped; the CRC
    // check rejects the frame afterwards.
    Ok(data)
}

/// Extracts complete frames from a byte stream
///
/// Bytes before a start marker are line noise and are dropped. A start marker
/// seen mid-frame restarts the frame, matching how the device firmware
/// resynchronises.
pub struct FrameAssembler {
    buffer: Vec<u8>,
    in_frame: bool,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            in_frame: false,
        }
    }

    /// Feed bytes into the assembler
    ///
    /// Returns every frame completed by `data`, markers included.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in data {
            if byte == SOF {
                self.buffer.clear();
                self.in_frame = true;
            }
            if !self.in_frame {
                continue;
            }
            self.buffer.push(byte);
            if byte == EOF {
                frames.push(std::mem::take(&mut self.buffer));
                self.in_frame = false;
            }
        }

        frames
    }

    /// Drop any partially received frame
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain_byte() {
        let mut out = Vec::new();
        escape_into(&mut out, 0x41);
        assert_eq!(out, vec![0x41]);
    }

    #[test]
    fn test_escape_markers() {
        let mut out = Vec::new();
        for b in [SOF, DLE, EOF] {
            escape_into(&mut out, b);
        }
        assert_eq!(out, vec![DLE, 0x5E, DLE, 0x5D, DLE, 0x5F]);
    }

    #[test]
    fn test_unescape_markers() {
        let frame = [SOF, 0x01, DLE, 0x5E, DLE, 0x5D, DLE, 0x5F, EOF];
        assert_eq!(unescape(&frame).unwrap(), vec![0x01, SOF, DLE, EOF]);
    }

    #[test]
    fn test_unescape_too_short() {
        assert!(matches!(
            unescape(&[SOF, 0x01, EOF]),
            Err(ProtocolError::FrameTooShort(3))
        ));
    }

    #[test]
    fn test_unescape_not_framed() {
        assert!(matches!(
            unescape(&[0x00, 0x01, 0x02, EOF]),
            Err(ProtocolError::NotFramed)
        ));
        assert!(matches!(
            unescape(&[SOF, 0x01, 0x02, 0x03]),
            Err(ProtocolError::NotFramed)
        ));
    }

    #[test]
    fn test_unescape_dangling_escape() {
        assert_eq!(unescape(&[SOF, 0x01, 0x02, DLE, EOF]).unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn test_assembler_skips_noise() {
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&[0x00, 0x11, SOF, 0x01, 0x02, EOF, 0x33]);
        assert_eq!(frames, vec![vec![SOF, 0x01, 0x02, EOF]]);
    }

    #[test]
    fn test_assembler_partial() {
        let mut asm = FrameAssembler::new();
        assert!(asm.feed(&[SOF, 0x01]).is_empty());
        assert_eq!(asm.feed(&[0x02, EOF]), vec![vec![SOF, 0x01, 0x02, EOF]]);
    }

    #[test]
    fn test_assembler_restarts_on_sof() {
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&[SOF, 0x01, SOF, 0x02, 0x03, 0x04, EOF]);
        assert_eq!(frames, vec![vec![SOF, 0x02, 0x03, 0x04, EOF]]);
    }
}
