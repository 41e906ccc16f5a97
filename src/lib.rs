//! Async client for DMSS devices (DVRs and IP cameras) and their DHAV media stream.
//!
//! The crate logs in over the DMSS control channel, negotiates a media
//! subchannel and turns the framed byte stream that follows into complete audio
//! and video packets with presentation timestamps.
//!
//! # Features
//!
//! - **Handshake**: login, keep-alive, object negotiation, subchannel link, stream start
//! - **Reassembly**: DHAV packets recovered across arbitrary TCP fragmentation
//! - **Formats**: H.264/H.265 video and A-law/mu-law/G.726/AAC audio discovery
//! - **Timing**: device epoch/ms counters mapped onto a monotonic clock with resync
//! - **Replay**: recorded `.dav` captures through the same pipeline
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dmss::{Dmss, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> dmss::Result<()> {
//!     let config = SessionConfig::default()
//!         .with_host("192.168.1.108")
//!         .with_credentials("admin", "admin")
//!         .with_channel(0, 1);
//!     let mut connection = Dmss::connect(config).await?;
//!
//!     while let Some(packet) = connection.next_packet().await {
//!         println!("{} {} bytes at {:?}", packet.format, packet.len(), packet.pts);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The lower layers are public for callers that drive the pipeline themselves:
//! [`session::TransportSession`] for the handshake, [`dhav::Reassembler`] for
//! framing and [`timing::ResyncEngine`] for timestamps.

// Core types and error handling
mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Protocol engine
pub mod dhav;
pub mod protocol;
pub mod session;
pub mod timing;

// Stream-based media architecture
pub mod connection;
pub mod driver;
pub mod provider;
pub mod providers;
pub mod stream;

// Core exports
pub use config::*;
pub use error::*;
pub use types::*;

// Main API exports
pub use connection::live::LiveConnection;
pub use connection::replay::ReplayConnection;

/// Unified entry point for device and capture connections.
///
/// # Examples
///
/// ## Live device
/// ```rust,no_run
/// use dmss::{Dmss, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> dmss::Result<()> {
///     let connection = Dmss::connect(SessionConfig::from_file("camera.yaml").await?).await?;
///     // Use connection...
///     Ok(())
/// }
/// ```
///
/// ## Capture replay
/// ```rust,no_run
/// use dmss::Dmss;
///
/// #[tokio::main]
/// async fn main() -> dmss::Result<()> {
///     let connection = Dmss::open("recording.dav").await?;
///     // Use connection...
///     Ok(())
/// }
/// ```
pub struct Dmss;

impl Dmss {
    /// Connect to a live device.
    ///
    /// Runs the full handshake and returns once stream data is flowing.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The host cannot be resolved or reached
    /// - The device rejects the credentials
    /// - The device answers a negotiation step with a fault
    pub async fn connect(config: SessionConfig) -> Result<LiveConnection> {
        LiveConnection::connect(config).await
    }

    /// Open a recorded DHAV capture for replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or is not readable.
    pub async fn open<P: AsRef<std::path::Path>>(path: P) -> Result<ReplayConnection> {
        ReplayConnection::open(path).await
    }
}
