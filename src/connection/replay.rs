//! Replay connection for recorded DHAV captures

use futures::Stream;
use std::path::Path;
use std::time::Duration;
use tracing::{Span, info, warn};

use super::PacketFeed;
use crate::driver::{Driver, DriverState};
use crate::provider::SourceInfo;
use crate::providers::ReplayProvider;
use crate::stream::PacedExt;
use crate::types::MediaPacket;
use crate::{DmssError, Result};

/// How long [`ReplayConnection::open`] waits for the capture to yield data.
const FIRST_DATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Replay connection from a `.dav` capture
#[derive(Debug)]
pub struct ReplayConnection {
    feed: PacketFeed,
    info: SourceInfo,
}

impl ReplayConnection {
    /// Open a capture for replay.
    ///
    /// Waits for the first bytes to be read before returning so the connection
    /// behaves like a live one that is already flowing.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_in(path, &Span::current()).await
    }

    /// [`ReplayConnection::open`] with an explicit parent span.
    pub async fn open_in<P: AsRef<Path>>(path: P, parent: &Span) -> Result<Self> {
        let path = path.as_ref();
        info!(parent: parent, "Opening capture: {}", path.display());

        let provider = ReplayProvider::new(path, parent);
        let (feed, started) = PacketFeed::from_channels(Driver::spawn(provider, parent));
        let info = started.await.map_err(|_| DmssError::Cancelled)??;

        let mut state = feed.state_receiver();
        let timed_out = tokio::time::timeout(FIRST_DATA_TIMEOUT, state.wait_for(|s| *s != DriverState::Starting))
            .await
            .is_err();
        if timed_out {
            warn!(parent: parent, "Timeout waiting for first data from capture");
        }

        info!(parent: parent, "Replay connection opened");
        Ok(Self { feed, info })
    }

    pub async fn next_packet(&mut self) -> Option<MediaPacket> {
        self.feed.next_packet().await
    }

    /// Packets as fast as they are reassembled.
    pub fn packets(&mut self) -> impl Stream<Item = MediaPacket> + '_ {
        self.feed.packets()
    }

    /// Packets released at their presentation time.
    pub fn paced_packets(&mut self) -> impl Stream<Item = MediaPacket> + Unpin + '_ {
        Box::pin(self.feed.packets().paced())
    }

    pub fn state(&self) -> DriverState {
        self.feed.state()
    }

    pub fn state_updates(&self) -> impl Stream<Item = DriverState> + 'static {
        self.feed.state_updates()
    }

    /// Capture path as given.
    pub fn source(&self) -> &str {
        &self.info.source
    }

    pub fn stop(&self) {
        self.feed.stop();
    }
}
