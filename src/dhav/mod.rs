//! DHAV media framing: packet format, extended headers and stream reassembly.

pub mod extended;
pub mod format;
pub mod reassembler;

pub use extended::{AudioInfo, ExtendedHeader, VideoInfo};
pub use format::{DhavHeader, FIXED_HEADER_SIZE, MIN_PACKET_SIZE, TRAILER_SIZE, packet_type};
pub use reassembler::{Reassembler, ReassemblerStats, StreamEvent};
