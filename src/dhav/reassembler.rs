//! DHAV stream reassembly
//!
//! [`Reassembler`] accumulates raw stream-channel bytes and hands out complete,
//! validated media packets, whatever the read boundaries were.
//!
//! ## Usage Example
//!
//! ```rust
//! use dmss::dhav::Reassembler;
//! use dmss::timing::{MonotonicClock, ResyncEngine};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tracing::Span;
//!
//! # fn main() -> dmss::Result<()> {
//! let timing = ResyncEngine::new(Arc::new(MonotonicClock::new()), Duration::ZERO, &Span::none());
//! let mut reassembler = Reassembler::new(timing, &Span::none());
//!
//! # let chunk: &[u8] = &[];
//! reassembler.push(chunk);
//! while let Some(packet) = reassembler.next_packet()? {
//!     println!("{} bytes of {} at {:?}", packet.len(), packet.format, packet.pts);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Policy
//!
//! - A packet is consumed only once all of its declared bytes are buffered.
//! - Bytes before a `DHAV` magic are skipped.
//! - A bad trailer or impossible size clears the whole buffer and reports
//!   [`DmssError::CorruptedPacket`]; the next call starts over on fresh data.
//! - Non-media packet types are discarded.

use bytes::BytesMut;
use std::collections::VecDeque;
use tracing::{Span, debug, debug_span, info, trace, warn};

use super::extended::{AudioInfo, ExtendedHeader, VideoInfo};
use super::format::{
    DHAV_MAGIC, DhavHeader, FIXED_HEADER_SIZE, MIN_PACKET_SIZE, starts_with_magic, verify_trailer,
};
use crate::timing::ResyncEngine;
use crate::types::{AudioFormat, MediaFormat, MediaKind, MediaPacket, VideoCodec};
use crate::{DmssError, Result};

/// Bytes inspected per step while searching for a magic.
pub const SCAN_WINDOW: usize = 32 * 1024;

/// Declared sizes above this are treated as corruption.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Stream announcements raised while classifying packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Video stream (re)created with a new codec
    Video(VideoCodec),
    /// Audio stream created
    Audio(AudioFormat),
    UnknownVideo { codec: u8 },
    UnknownAudio { codec: u8, rate: u8 },
}

/// Reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub bytes_in: u64,
    pub video_key_packets: u64,
    pub video_delta_packets: u64,
    pub audio_packets: u64,
    /// Bytes discarded while searching for a magic
    pub bytes_skipped: u64,
    pub corrupted: u64,
    pub non_media_discarded: u64,
    /// Packets whose stream has no usable format
    pub dropped_without_stream: u64,
}

impl ReassemblerStats {
    pub fn packets_emitted(&self) -> u64 {
        self.video_key_packets + self.video_delta_packets + self.audio_packets
    }
}

/// Incremental DHAV packet reassembler.
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    /// Stream offset of `buffer[0]`
    offset: u64,
    timing: ResyncEngine,
    video: Option<VideoCodec>,
    audio: Option<AudioFormat>,
    reported_video: Option<u8>,
    reported_audio: Option<(u8, u8)>,
    events: VecDeque<StreamEvent>,
    stats: ReassemblerStats,
    span: Span,
}

impl Reassembler {
    pub fn new(timing: ResyncEngine, parent: &Span) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            offset: 0,
            timing,
            video: None,
            audio: None,
            reported_video: None,
            reported_audio: None,
            events: VecDeque::new(),
            stats: ReassemblerStats::default(),
            span: debug_span!(parent: parent, "reassembler"),
        }
    }

    /// Append raw stream bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.stats.bytes_in += data.len() as u64;
    }

    /// Next complete media packet, or `None` until more bytes are pushed.
    ///
    /// An `Err` is returned once per corrupted region; later calls carry on with
    /// whatever is pushed next.
    pub fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
        let span = self.span.clone();
        let _enter = span.enter();

        loop {
            if self.buffer.len() < MIN_PACKET_SIZE {
                return Ok(None);
            }
            if !self.seek_magic() || self.buffer.len() < MIN_PACKET_SIZE {
                return Ok(None);
            }

            let header = DhavHeader::parse(&self.buffer[..FIXED_HEADER_SIZE])?;
            if let Err(e) = header.validate() {
                return Err(self.corrupted(e));
            }
            if header.total_len() > MAX_PACKET_SIZE {
                let e = DmssError::corrupted(format!(
                    "declared size {} exceeds {}",
                    header.total_size, MAX_PACKET_SIZE
                ));
                return Err(self.corrupted(e));
            }
            if header.total_len() > self.buffer.len() {
                trace!("Waiting for {} more bytes", header.total_len() - self.buffer.len());
                return Ok(None);
            }

            let packet_offset = self.offset;
            let packet = self.buffer.split_to(header.total_len()).freeze();
            self.offset += packet.len() as u64;

            let Some(kind) = header.media_kind() else {
                debug!("Discarding non-media DHAV packet of type {:#04x}", header.packet_type);
                self.stats.non_media_discarded += 1;
                continue;
            };

            if let Err(e) = verify_trailer(&packet, header.total_size) {
                return Err(self.corrupted(e));
            }

            let extended = ExtendedHeader::parse(&packet[header.extended_range()]);
            let pts = self.timing.stamp(header.epoch, header.device_ms);

            let Some(format) = self.resolve_format(kind, &extended) else {
                debug!("No {} stream instantiated, discarding packet", kind_name(kind));
                self.stats.dropped_without_stream += 1;
                continue;
            };

            match kind {
                MediaKind::VideoKey => self.stats.video_key_packets += 1,
                MediaKind::VideoDelta => self.stats.video_delta_packets += 1,
                MediaKind::Audio => self.stats.audio_packets += 1,
            }
            trace!(
                "Emitting {} packet: {} payload bytes, pts {:?}, offset {}",
                kind_name(kind),
                header.body_size(),
                pts,
                packet_offset
            );

            return Ok(Some(MediaPacket {
                kind,
                format,
                pts,
                payload: packet.slice(header.payload_range()),
                offset: packet_offset,
                epoch: header.epoch,
                device_ms: header.device_ms,
            }));
        }
    }

    /// Drop buffered partial data at end of stream, returning how many bytes went.
    pub fn flush(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            debug!("Flushing {} bytes of incomplete data", dropped);
        }
        self.discard(dropped);
        dropped
    }

    /// Prepare for a restarted stream: drop buffered data and re-anchor timing.
    pub fn reset(&mut self) {
        self.flush();
        self.timing.reset();
        self.offset = 0;
    }

    /// Bytes waiting for a complete packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    pub fn timing(&self) -> &ResyncEngine {
        &self.timing
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        self.video
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.audio
    }

    /// Take the stream announcements raised since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = StreamEvent> + '_ {
        self.events.drain(..)
    }

    /// Skip to the next magic. Returns false when none is buffered yet.
    fn seek_magic(&mut self) -> bool {
        if starts_with_magic(&self.buffer) {
            return true;
        }

        let magic_len = DHAV_MAGIC.len();
        let mut start = 0;
        let found = loop {
            if start + magic_len > self.buffer.len() {
                break None;
            }
            // Windows overlap by magic_len - 1 so no boundary hides a magic.
            let end = (start + SCAN_WINDOW + magic_len - 1).min(self.buffer.len());
            let window = &self.buffer[start..end];
            if let Some(pos) = window.windows(magic_len).position(|w| w == DHAV_MAGIC) {
                break Some(start + pos);
            }
            trace!("No magic in window at {}", start);
            start += SCAN_WINDOW;
        };

        // Without a match the last bytes may still be the start of a split magic.
        let skip = found.unwrap_or_else(|| self.buffer.len().saturating_sub(magic_len - 1));
        if skip > 0 {
            debug!("Resync: skipped {} bytes before DHAV magic", skip);
            self.stats.bytes_skipped += skip as u64;
            self.discard(skip);
        }
        found.is_some()
    }

    fn discard(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
        self.offset += n as u64;
    }

    fn corrupted(&mut self, error: DmssError) -> DmssError {
        warn!("DHAV packet is corrupted: {}; dropping {} buffered bytes", error, self.buffer.len());
        self.stats.corrupted += 1;
        self.flush();
        error
    }

    fn resolve_format(&mut self, kind: MediaKind, extended: &ExtendedHeader) -> Option<MediaFormat> {
        if kind.is_audio() {
            match extended.audio_info() {
                Some(AudioInfo::Known(format)) if self.audio.is_none() => {
                    info!("Audio stream: {}", MediaFormat::Audio(format));
                    self.audio = Some(format);
                    self.events.push_back(StreamEvent::Audio(format));
                }
                Some(AudioInfo::Known(format)) if self.audio != Some(format) => {
                    debug!("Ignoring audio format change to {}", MediaFormat::Audio(format));
                }
                Some(AudioInfo::Unknown { codec, rate }) if self.audio.is_none() => {
                    if self.reported_audio != Some((codec, rate)) {
                        warn!("Unknown audio format: codec {:#04x}, rate code {}", codec, rate);
                        self.reported_audio = Some((codec, rate));
                        self.events.push_back(StreamEvent::UnknownAudio { codec, rate });
                    }
                }
                _ => {}
            }
            self.audio.map(MediaFormat::Audio)
        } else {
            match extended.video_info() {
                Some(VideoInfo::Known(codec)) if self.video != Some(codec) => {
                    info!("Video stream: {}", MediaFormat::Video(codec));
                    self.video = Some(codec);
                    self.reported_video = None;
                    self.events.push_back(StreamEvent::Video(codec));
                }
                Some(VideoInfo::Unknown { codec }) => {
                    if self.reported_video != Some(codec) {
                        warn!("Unknown video format: {:#04x}", codec);
                        self.reported_video = Some(codec);
                        self.events.push_back(StreamEvent::UnknownVideo { codec });
                    }
                    self.video = None;
                }
                _ => {}
            }
            self.video.map(MediaFormat::Video)
        }
    }
}

fn kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::VideoKey => "video key",
        MediaKind::VideoDelta => "video delta",
        MediaKind::Audio => "audio",
    }
}
