//! DHAV packet structure and parsing
//!
//! Every media unit on the stream channel is wrapped in a self-framed DHAV packet:
//!
//! 1. **Fixed header** (24 bytes) - magic, packet type, total size, timing
//! 2. **Extended header** (variable) - tagged 32-bit format descriptors
//! 3. **Payload** - the elementary stream bytes
//! 4. **Trailer** (8 bytes) - `dhav` magic and an echo of the total size
//!
//! ```text
//! offset  0   4    5        12          16       18   20      22       23   24
//!         │DHAV│type│reserved│total size │epoch   │ .. │ms     │ext size│ .. │
//! ```
//!
//! All multi-byte fixed header fields are little-endian.

use crate::types::MediaKind;
use crate::{DmssError, Result};
use std::ops::Range;
use tracing::trace;

pub const DHAV_MAGIC: &[u8; 4] = b"DHAV";
pub const DHAV_TRAILER_MAGIC: &[u8; 4] = b"dhav";

pub const FIXED_HEADER_SIZE: usize = 24;
pub const TRAILER_SIZE: usize = 8;
/// Smallest well-formed packet: fixed header plus trailer.
pub const MIN_PACKET_SIZE: usize = FIXED_HEADER_SIZE + TRAILER_SIZE;

const TYPE_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 12;
const EPOCH_OFFSET: usize = 16;
const MS_OFFSET: usize = 20;
const EXT_SIZE_OFFSET: usize = 22;

/// DHAV packet type codes
pub mod packet_type {
    pub const VIDEO_KEY: u8 = 0xFC;
    pub const VIDEO_DELTA: u8 = 0xFD;
    pub const AUDIO: u8 = 0xF0;
}

/// Parsed DHAV fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhavHeader {
    pub packet_type: u8,
    /// Total packet size including headers and trailer
    pub total_size: u32,
    pub epoch: u16,
    pub device_ms: u16,
    pub ext_size: u8,
}

impl DhavHeader {
    /// Parse the fixed header at the start of `data`.
    ///
    /// `data` must start with the `DHAV` magic.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(DmssError::MalformedHeader {
                needed: FIXED_HEADER_SIZE,
                available: data.len(),
            });
        }
        if !starts_with_magic(data) {
            return Err(DmssError::corrupted(format!(
                "expected DHAV magic, found {:02x?}",
                &data[..DHAV_MAGIC.len()]
            )));
        }

        let header = Self {
            packet_type: data[TYPE_OFFSET],
            total_size: parse_u32_le(data, SIZE_OFFSET)?,
            epoch: parse_u16_le(data, EPOCH_OFFSET)?,
            device_ms: parse_u16_le(data, MS_OFFSET)?,
            ext_size: data[EXT_SIZE_OFFSET],
        };
        trace!(
            "DHAV header: type={:#04x} size={} epoch={} ms={} ext={}",
            header.packet_type, header.total_size, header.epoch, header.device_ms, header.ext_size
        );
        Ok(header)
    }

    /// Media kind, `None` for packet types that carry no media.
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self.packet_type {
            packet_type::VIDEO_KEY => Some(MediaKind::VideoKey),
            packet_type::VIDEO_DELTA => Some(MediaKind::VideoDelta),
            packet_type::AUDIO => Some(MediaKind::Audio),
            _ => None,
        }
    }

    pub fn total_len(&self) -> usize {
        self.total_size as usize
    }

    /// Bytes of fixed header, extended header and trailer.
    pub fn overhead(&self) -> usize {
        MIN_PACKET_SIZE + usize::from(self.ext_size)
    }

    /// Check the declared size can hold the headers and trailer.
    pub fn validate(&self) -> Result<()> {
        if self.total_len() < self.overhead() {
            return Err(DmssError::corrupted(format!(
                "declared size {} smaller than header overhead {}",
                self.total_size,
                self.overhead()
            )));
        }
        Ok(())
    }

    /// Payload size: total size minus headers and trailer.
    pub fn body_size(&self) -> usize {
        self.total_len().saturating_sub(self.overhead())
    }

    /// Byte range of the extended header within the packet.
    pub fn extended_range(&self) -> Range<usize> {
        FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + usize::from(self.ext_size)
    }

    /// Byte range of the payload within the packet.
    pub fn payload_range(&self) -> Range<usize> {
        let start = FIXED_HEADER_SIZE + usize::from(self.ext_size);
        start..start + self.body_size()
    }
}

/// Whether `data` begins with the `DHAV` magic.
pub fn starts_with_magic(data: &[u8]) -> bool {
    data.starts_with(DHAV_MAGIC)
}

/// Verify the trailer of a complete packet against the declared size.
pub fn verify_trailer(packet: &[u8], declared_size: u32) -> Result<()> {
    let size = declared_size as usize;
    if packet.len() != size || size < MIN_PACKET_SIZE {
        return Err(DmssError::corrupted(format!(
            "packet holds {} bytes, header declares {}",
            packet.len(),
            declared_size
        )));
    }

    let trailer = &packet[size - TRAILER_SIZE..];
    if !trailer.starts_with(DHAV_TRAILER_MAGIC) {
        return Err(DmssError::corrupted("packet doesn't end with dhav trailer"));
    }
    let echoed = parse_u32_le(trailer, 4)?;
    if echoed != declared_size {
        return Err(DmssError::corrupted(format!(
            "trailer size {} doesn't match header size {}",
            echoed, declared_size
        )));
    }
    Ok(())
}

fn parse_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(DmssError::MalformedHeader { needed: offset + 4, available: data.len() });
    }
    Ok(u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]))
}

fn parse_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(DmssError::MalformedHeader { needed: offset + 2, available: data.len() });
    }
    Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DhavPacketBuilder;
    use anyhow::{Result, ensure};

    #[test]
    fn parses_fixed_header_fields() -> Result<()> {
        let packet = DhavPacketBuilder::video_key(vec![0xAB; 10])
            .timing(1234, 999)
            .extended(vec![0x8100_0800])
            .build();
        let header = DhavHeader::parse(&packet)?;

        ensure!(header.packet_type == packet_type::VIDEO_KEY);
        ensure!(header.total_len() == packet.len());
        ensure!(header.epoch == 1234);
        ensure!(header.device_ms == 999);
        ensure!(header.ext_size == 4);
        ensure!(header.body_size() == 10);
        ensure!(header.media_kind() == Some(MediaKind::VideoKey));
        ensure!(&packet[header.payload_range()] == &[0xAB; 10][..]);
        verify_trailer(&packet, header.total_size)?;
        Ok(())
    }

    #[test]
    fn rejects_short_and_unmagical_headers() {
        assert!(matches!(
            DhavHeader::parse(b"DHAV"),
            Err(DmssError::MalformedHeader { needed: 24, available: 4 })
        ));
        assert!(matches!(DhavHeader::parse(&[0u8; 24]), Err(DmssError::CorruptedPacket { .. })));
    }

    #[test]
    fn validate_rejects_undersized_declaration() {
        let header = DhavHeader { packet_type: 0xFD, total_size: 40, epoch: 0, device_ms: 0, ext_size: 12 };
        assert!(header.validate().is_err());

        let header = DhavHeader { total_size: 44, ..header };
        assert!(header.validate().is_ok());
        assert_eq!(header.body_size(), 0);
    }

    #[test]
    fn trailer_mismatches_are_corruption() {
        let mut packet = DhavPacketBuilder::audio(vec![1, 2, 3]).build();
        let size = packet.len() as u32;

        let last = packet.len() - 1;
        packet[last - 3] ^= 0xFF;
        assert!(matches!(verify_trailer(&packet, size), Err(DmssError::CorruptedPacket { .. })));

        let mut packet = DhavPacketBuilder::audio(vec![1, 2, 3]).build();
        let magic_at = packet.len() - TRAILER_SIZE;
        packet[magic_at] = b'x';
        assert!(verify_trailer(&packet, size).is_err());
    }

    #[test]
    fn non_media_types_have_no_kind() {
        let packet = DhavPacketBuilder::new(0xF1, vec![]).build();
        let header = DhavHeader::parse(&packet).unwrap();
        assert_eq!(header.media_kind(), None);
    }
}
