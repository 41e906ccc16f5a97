//! Core types shared across the crate.

pub mod format;
pub mod packet;

pub use format::{AudioCodec, AudioFormat, MediaFormat, SampleRate, VideoCodec};
pub use packet::{MediaKind, MediaPacket};
