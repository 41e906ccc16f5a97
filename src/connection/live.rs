//! Live media connection to a DMSS device

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

use super::PacketFeed;
use crate::driver::{Driver, DriverState, StopReason};
use crate::provider::SourceInfo;
use crate::providers::LiveProvider;
use crate::types::MediaPacket;
use crate::{DmssError, Phase, Result, SessionConfig};

/// Live connection to a device's media stream
///
/// The handshake and reassembly run on a background task; packets are queued
/// in stream order until read. Dropping the connection closes the session.
#[derive(Debug)]
pub struct LiveConnection {
    feed: PacketFeed,
    info: SourceInfo,
}

impl LiveConnection {
    /// Connect to the device described by `config`.
    ///
    /// Fails with the handshake error. Otherwise returns once the device has
    /// started sending stream data, or after [`SessionConfig::ready_timeout`]
    /// without any.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        Self::connect_in(config, &Span::current()).await
    }

    /// [`LiveConnection::connect`] with an explicit parent span for the connection's logs.
    pub async fn connect_in(config: SessionConfig, parent: &Span) -> Result<Self> {
        info!(parent: parent, "Connecting to {}:{}", config.host, config.port);
        let ready_timeout = config.ready_timeout();

        let cancel = CancellationToken::new();
        let provider = LiveProvider::new(config, cancel.clone(), parent)?;
        let channels = Driver::spawn_with_token(provider, cancel, parent);
        let (feed, started) = PacketFeed::from_channels(channels);

        let info = started.await.map_err(|_| DmssError::Cancelled)??;

        let mut state = feed.state_receiver();
        let waited = tokio::time::timeout(ready_timeout, state.wait_for(|s| *s != DriverState::Starting)).await;
        let outcome = match waited {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => return Err(DmssError::Cancelled),
            Err(_) => {
                warn!(parent: parent, "No stream data within {:?}, returning anyway", ready_timeout);
                DriverState::Starting
            }
        };
        if let DriverState::Ended(StopReason::Failed(reason)) = outcome {
            return Err(DmssError::protocol(Phase::Streaming, reason));
        }

        info!(
            parent: parent,
            "Live connection established (session {:?}, connection {:?})",
            info.session_id,
            info.connection_id
        );
        Ok(Self { feed, info })
    }

    /// Next packet in stream order, `None` once the stream has ended.
    pub async fn next_packet(&mut self) -> Option<MediaPacket> {
        self.feed.next_packet().await
    }

    /// Packets as a stream, ending with the connection.
    pub fn packets(&mut self) -> impl Stream<Item = MediaPacket> + '_ {
        self.feed.packets()
    }

    pub fn state(&self) -> DriverState {
        self.feed.state()
    }

    /// Lifecycle updates, starting with the current state.
    pub fn state_updates(&self) -> impl Stream<Item = DriverState> + 'static {
        self.feed.state_updates()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.info.session_id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.info.connection_id.as_deref()
    }

    /// `host:port` of the device.
    pub fn source(&self) -> &str {
        &self.info.source
    }

    /// Stop streaming. Packets already queued can still be read.
    pub fn stop(&self) {
        self.feed.stop();
    }
}
