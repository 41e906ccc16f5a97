//! Reassembled media packet handed to consumers.

use bytes::Bytes;
use std::time::Duration;

use super::format::MediaFormat;

/// Kind of a media-carrying DHAV packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame decodable on its own
    VideoKey,
    VideoDelta,
    Audio,
}

impl MediaKind {
    pub fn is_audio(self) -> bool {
        self == MediaKind::Audio
    }
}

/// One complete media unit with its presentation timestamp.
///
/// The payload excludes the DHAV fixed header, extended header and trailer.
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub format: MediaFormat,
    /// Presentation timestamp, latency offset included
    pub pts: Duration,
    pub payload: Bytes,
    /// Stream byte offset of the packet's `DHAV` magic
    pub offset: u64,
    /// Device epoch seconds as sent
    pub epoch: u16,
    /// Device millisecond counter as sent
    pub device_ms: u16,
}

impl MediaPacket {
    pub fn is_audio(&self) -> bool {
        self.kind.is_audio()
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == MediaKind::VideoKey
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
