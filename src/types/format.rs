//! Media format tags recovered from DHAV extended headers.

use std::fmt;

/// Video elementary stream codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x08 => Some(VideoCodec::H264),
            0x0C => Some(VideoCodec::H265),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            VideoCodec::H264 => 0x08,
            VideoCodec::H265 => 0x0C,
        }
    }
}

/// Audio elementary stream codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Alaw,
    Mulaw,
    G726,
    /// AAC in ADTS framing
    Aac,
}

impl AudioCodec {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0E => Some(AudioCodec::Alaw),
            0x0A => Some(AudioCodec::Mulaw),
            0x1B => Some(AudioCodec::G726),
            0x1A => Some(AudioCodec::Aac),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AudioCodec::Alaw => 0x0E,
            AudioCodec::Mulaw => 0x0A,
            AudioCodec::G726 => 0x1B,
            AudioCodec::Aac => 0x1A,
        }
    }
}

/// Audio sample rate code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz32000,
    Hz48000,
    Hz64000,
}

impl SampleRate {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(SampleRate::Hz8000),
            4 => Some(SampleRate::Hz16000),
            7 => Some(SampleRate::Hz32000),
            9 => Some(SampleRate::Hz48000),
            13 => Some(SampleRate::Hz64000),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SampleRate::Hz8000 => 2,
            SampleRate::Hz16000 => 4,
            SampleRate::Hz32000 => 7,
            SampleRate::Hz48000 => 9,
            SampleRate::Hz64000 => 13,
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz32000 => 32000,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz64000 => 64000,
        }
    }
}

/// Codec and rate of an audio stream. Devices only send mono audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub rate: SampleRate,
}

/// Format tag attached to every emitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    Video(VideoCodec),
    Audio(AudioFormat),
}

impl MediaFormat {
    pub fn is_audio(&self) -> bool {
        matches!(self, MediaFormat::Audio(_))
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaFormat::Video(VideoCodec::H264) => f.write_str("video/h264"),
            MediaFormat::Video(VideoCodec::H265) => f.write_str("video/h265"),
            MediaFormat::Audio(AudioFormat { codec, rate }) => {
                let name = match codec {
                    AudioCodec::Alaw => "alaw",
                    AudioCodec::Mulaw => "mulaw",
                    AudioCodec::G726 => "g726",
                    AudioCodec::Aac => "aac",
                };
                write!(f, "audio/{}@{}", name, rate.hz())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_both_ways() {
        for codec in [VideoCodec::H264, VideoCodec::H265] {
            assert_eq!(VideoCodec::from_code(codec.code()), Some(codec));
        }
        for codec in [AudioCodec::Alaw, AudioCodec::Mulaw, AudioCodec::G726, AudioCodec::Aac] {
            assert_eq!(AudioCodec::from_code(codec.code()), Some(codec));
        }
        assert_eq!(SampleRate::from_code(2).map(SampleRate::hz), Some(8000));
        assert_eq!(SampleRate::from_code(13).map(SampleRate::hz), Some(64000));
    }

    #[test]
    fn unknown_codes() {
        assert_eq!(VideoCodec::from_code(0x02), None);
        assert_eq!(AudioCodec::from_code(0x00), None);
        assert_eq!(SampleRate::from_code(3), None);
    }

    #[test]
    fn display() {
        let audio = MediaFormat::Audio(AudioFormat { codec: AudioCodec::Alaw, rate: SampleRate::Hz8000 });
        assert_eq!(audio.to_string(), "audio/alaw@8000");
        assert_eq!(MediaFormat::Video(VideoCodec::H265).to_string(), "video/h265");
        assert!(audio.is_audio());
    }
}
