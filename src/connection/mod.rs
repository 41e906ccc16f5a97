//! Consumer-side handles over a running [`Driver`](crate::driver::Driver).

pub mod live;
pub mod replay;

#[cfg(test)]
mod tests;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{DriverChannels, DriverState};
use crate::types::MediaPacket;

/// Packet receiver plus lifecycle state shared by both connection kinds.
///
/// Dropping the feed cancels the reader task.
#[derive(Debug)]
pub(crate) struct PacketFeed {
    packets: mpsc::UnboundedReceiver<MediaPacket>,
    state: watch::Receiver<DriverState>,
    cancel: CancellationToken,
}

impl PacketFeed {
    pub(crate) fn new(
        packets: mpsc::UnboundedReceiver<MediaPacket>,
        state: watch::Receiver<DriverState>,
        cancel: CancellationToken,
    ) -> Self {
        Self { packets, state, cancel }
    }

    /// Split driver channels into the feed and the startup receiver.
    pub(crate) fn from_channels(
        channels: DriverChannels,
    ) -> (Self, tokio::sync::oneshot::Receiver<crate::Result<crate::provider::SourceInfo>>) {
        let DriverChannels { packets, state, started, cancel } = channels;
        (Self::new(packets, state, cancel), started)
    }

    pub(crate) async fn next_packet(&mut self) -> Option<MediaPacket> {
        self.packets.recv().await
    }

    pub(crate) fn packets(&mut self) -> impl Stream<Item = MediaPacket> + '_ {
        futures::stream::poll_fn(move |cx| self.packets.poll_recv(cx))
    }

    pub(crate) fn state(&self) -> DriverState {
        self.state.borrow().clone()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<DriverState> {
        self.state.clone()
    }

    pub(crate) fn state_updates(&self) -> impl Stream<Item = DriverState> + 'static {
        WatchStream::new(self.state.clone())
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PacketFeed {
    fn drop(&mut self) {
        debug!("Dropping packet feed");
        self.cancel.cancel();
    }
}
