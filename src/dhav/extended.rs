//! Extended header parsing
//!
//! The extended header is an array of big-endian 32-bit entries. The top byte of
//! each entry is a tag, the low 24 bits its value; a zero tag ends the list.
//!
//! | Tag    | Meaning    | Value layout                                 |
//! |--------|------------|----------------------------------------------|
//! | `0x81` | video info | bits 8..16: codec                            |
//! | `0x83` | audio info | bits 8..16: codec, bits 0..8: sample rate    |

use tracing::{trace, warn};

use crate::types::{AudioCodec, AudioFormat, SampleRate, VideoCodec};

/// Maximum number of entries read from one extended header.
pub const MAX_ENTRIES: usize = 32;

const ENTRY_SIZE: usize = 4;

/// Extended header tags
pub mod tag {
    pub const VIDEO_INFO: u8 = 0x81;
    pub const AUDIO_INFO: u8 = 0x83;
}

/// Video info as announced by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoInfo {
    Known(VideoCodec),
    Unknown { codec: u8 },
}

/// Audio info as announced by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioInfo {
    Known(AudioFormat),
    Unknown { codec: u8, rate: u8 },
}

/// Decoded extended header entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    entries: Vec<u32>,
    /// Input ended mid-entry or held more than [`MAX_ENTRIES`]
    truncated: bool,
}

impl ExtendedHeader {
    /// Decode entries from `data`.
    ///
    /// Never fails: a trailing partial entry or excess entries are logged and the
    /// decoded prefix is kept.
    pub fn parse(data: &[u8]) -> Self {
        let mut chunks = data.chunks_exact(ENTRY_SIZE);
        let entries: Vec<u32> = chunks
            .by_ref()
            .take(MAX_ENTRIES)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let excess = chunks.len() > 0;
        let partial = !chunks.remainder().is_empty();
        let truncated = excess || partial;
        if truncated {
            warn!(
                "Couldn't parse extended header correctly ({} bytes, {} entries kept)",
                data.len(),
                entries.len()
            );
        }
        trace!("Extended header entries: {:08x?}", entries);

        Self { entries, truncated }
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// 24-bit value of the first entry with `tag`, scanning until a zero tag.
    pub fn find(&self, tag: u8) -> Option<u32> {
        for &entry in &self.entries {
            let entry_tag = (entry >> 24) as u8;
            if entry_tag == tag {
                return Some(entry & 0x00FF_FFFF);
            }
            if entry_tag == 0 {
                break;
            }
        }
        None
    }

    pub fn video_info(&self) -> Option<VideoInfo> {
        self.find(tag::VIDEO_INFO).map(|value| {
            let codec = ((value & 0xFF00) >> 8) as u8;
            match VideoCodec::from_code(codec) {
                Some(codec) => VideoInfo::Known(codec),
                None => VideoInfo::Unknown { codec },
            }
        })
    }

    pub fn audio_info(&self) -> Option<AudioInfo> {
        self.find(tag::AUDIO_INFO).map(|value| {
            let codec = ((value & 0xFF00) >> 8) as u8;
            let rate = (value & 0xFF) as u8;
            match (AudioCodec::from_code(codec), SampleRate::from_code(rate)) {
                (Some(codec), Some(rate)) => AudioInfo::Known(AudioFormat { codec, rate }),
                _ => AudioInfo::Unknown { codec, rate },
            }
        })
    }
}
