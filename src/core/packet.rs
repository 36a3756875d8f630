//! # Packet Headers
//!
//! Every frame starts with a marker byte that selects one of two header layouts:
//!
//! ```text
//! C1 / C3: [marker] [len: u8]      [code] [sub-code?]
//! C2 / C4: [marker] [len: u16 BE]  [code] [sub-code?]
//! ```
//!
//! The sub-code byte is only meaningful for main codes that the current routing
//! mode declares as polymorphic. That decision is passed in as a predicate so a
//! single parser serves both the relay and the gameplay rule sets.

use crate::error::{ProtocolError, Result};

/// Short frame, plaintext body
pub const MARKER_C1: u8 = 0xC1;
/// Long frame, plaintext body
pub const MARKER_C2: u8 = 0xC2;
/// Short frame, encrypted body
pub const MARKER_C3: u8 = 0xC3;
/// Long frame, encrypted body
pub const MARKER_C4: u8 = 0xC4;

/// Largest frame a long header can describe
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Length-field encoding selected by the frame marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One-byte length field (C1, C3)
    Short,
    /// Two-byte big-endian length field (C2, C4)
    Long,
}

impl FrameKind {
    /// Classify a marker byte, `None` for anything that is not a frame marker.
    #[inline]
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            MARKER_C1 | MARKER_C3 => Some(FrameKind::Short),
            MARKER_C2 | MARKER_C4 => Some(FrameKind::Long),
            _ => None,
        }
    }

    /// Offset of the main code byte
    #[inline]
    pub fn code_offset(self) -> usize {
        match self {
            FrameKind::Short => 2,
            FrameKind::Long => 3,
        }
    }

    /// Bytes needed before the length field can be read
    #[inline]
    pub fn length_field_end(self) -> usize {
        match self {
            FrameKind::Short => 2,
            FrameKind::Long => 3,
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub marker: u8,
    pub kind: FrameKind,
    /// Declared total frame length, header included
    pub length: usize,
    pub code: u8,
    pub sub_code: Option<u8>,
}

impl PacketHeader {
    /// Offset of the first byte after the header
    pub fn body_offset(&self) -> usize {
        self.kind.code_offset() + 1 + usize::from(self.sub_code.is_some())
    }
}

/// Read the declared frame length, if the buffer holds enough bytes for it.
pub fn declared_length(buf: &[u8]) -> Result<Option<(FrameKind, usize)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    let kind = FrameKind::from_marker(marker).ok_or(ProtocolError::UnknownFrameMarker(marker))?;

    if buf.len() < kind.length_field_end() {
        return Ok(None);
    }

    let length = match kind {
        FrameKind::Short => usize::from(buf[1]),
        FrameKind::Long => usize::from(u16::from_be_bytes([buf[1], buf[2]])),
    };
    Ok(Some((kind, length)))
}

/// Parse the header of a complete packet.
///
/// `has_sub_code` answers whether a main code carries a sub-code in the active
/// routing mode. A sub-code is only read when the predicate holds *and* the packet
/// is long enough to contain it.
///
/// # Errors
/// Returns `ProtocolError::UnknownFrameMarker` for a non-frame first byte and
/// `ProtocolError::InvalidHeader` if the packet is shorter than its header.
pub fn parse_header<F>(packet: &[u8], has_sub_code: F) -> Result<PacketHeader>
where
    F: Fn(u8) -> bool,
{
    let marker = *packet.first().ok_or(ProtocolError::InvalidHeader)?;
    let kind = FrameKind::from_marker(marker).ok_or(ProtocolError::UnknownFrameMarker(marker))?;

    let code_offset = kind.code_offset();
    if packet.len() <= code_offset {
        return Err(ProtocolError::InvalidHeader);
    }

    let length = match kind {
        FrameKind::Short => usize::from(packet[1]),
        FrameKind::Long => usize::from(u16::from_be_bytes([packet[1], packet[2]])),
    };
    let code = packet[code_offset];
    let sub_code = if has_sub_code(code) {
        packet.get(code_offset + 1).copied()
    } else {
        None
    };

    Ok(PacketHeader {
        marker,
        kind,
        length,
        code,
        sub_code,
    })
}

/// Write a frame header into the first bytes of `buf` and return its size.
///
/// `buf` must already hold the full frame; the length field is taken from `buf.len()`.
pub(crate) fn write_header(buf: &mut [u8], marker: u8, code: u8, sub_code: Option<u8>) -> usize {
    let kind = FrameKind::from_marker(marker).unwrap_or(FrameKind::Short);
    let total = buf.len();
    buf[0] = marker;
    match kind {
        FrameKind::Short => buf[1] = total as u8,
        FrameKind::Long => buf[1..3].copy_from_slice(&(total as u16).to_be_bytes()),
    }
    let mut offset = kind.code_offset();
    buf[offset] = code;
    offset += 1;
    if let Some(sub) = sub_code {
        buf[offset] = sub;
        offset += 1;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header_without_sub_code() {
        let header = parse_header(&[0xC1, 0x04, 0x05, 0x01], |code| code == 0xF1).unwrap();
        assert_eq!(header.kind, FrameKind::Short);
        assert_eq!(header.length, 4);
        assert_eq!(header.code, 0x05);
        assert_eq!(header.sub_code, None);
        assert_eq!(header.body_offset(), 3);
    }

    #[test]
    fn test_short_header_with_sub_code() {
        let header = parse_header(&[0xC1, 0x04, 0xF1, 0x03], |code| code == 0xF1).unwrap();
        assert_eq!(header.code, 0xF1);
        assert_eq!(header.sub_code, Some(0x03));
        assert_eq!(header.body_offset(), 4);
    }

    #[test]
    fn test_sub_code_requires_length() {
        let header = parse_header(&[0xC3, 0x03, 0xF1], |_| true).unwrap();
        assert_eq!(header.code, 0xF1);
        assert_eq!(header.sub_code, None);
    }

    #[test]
    fn test_long_header() {
        let header = parse_header(&[0xC2, 0x01, 0x02, 0xF4, 0x06], |code| code == 0xF4).unwrap();
        assert_eq!(header.kind, FrameKind::Long);
        assert_eq!(header.length, 0x0102);
        assert_eq!(header.code, 0xF4);
        assert_eq!(header.sub_code, Some(0x06));

        let header = parse_header(&[0xC4, 0x00, 0x04, 0xF4], |_| true).unwrap();
        assert_eq!(header.sub_code, None);
    }

    #[test]
    fn test_two_byte_buffers_rejected_for_every_marker() {
        for marker in 0..=u8::MAX {
            assert!(parse_header(&[marker, 0x02], |_| true).is_err());
        }
    }

    #[test]
    fn test_unknown_marker() {
        assert!(matches!(
            parse_header(&[0xAA, 0x04, 0x01, 0x02], |_| false),
            Err(ProtocolError::UnknownFrameMarker(0xAA))
        ));
    }

    #[test]
    fn test_declared_length_partial() {
        assert!(declared_length(&[]).unwrap().is_none());
        assert!(declared_length(&[0xC2, 0x00]).unwrap().is_none());
        assert_eq!(
            declared_length(&[0xC2, 0x00, 0x10]).unwrap(),
            Some((FrameKind::Long, 16))
        );
    }

    #[test]
    fn test_write_header_long() {
        let mut buf = vec![0u8; 300];
        let written = write_header(&mut buf, MARKER_C2, 0xF4, Some(0x06));
        assert_eq!(written, 5);
        assert_eq!(&buf[..5], &[0xC2, 0x01, 0x2C, 0xF4, 0x06]);
    }
}
