//! Driver spawns and manages the media reader task

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::provider::{Provider, SourceInfo};
use crate::types::MediaPacket;
use crate::{DmssError, Result};

/// Consecutive provider errors tolerated before giving up.
pub const MAX_ERRORS: u32 = 10;

/// Why the reader task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Provider reported end of stream
    Finished,
    /// Cancellation token fired
    Cancelled,
    /// Packet receiver was dropped
    ConsumerGone,
    /// Startup failed or errors were fatal or too frequent
    Failed(String),
}

/// Reader task lifecycle as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    /// First stream byte received
    Flowing,
    Ended(StopReason),
}

impl DriverState {
    pub fn is_ended(&self) -> bool {
        matches!(self, DriverState::Ended(_))
    }
}

/// Result of spawning the driver task
pub struct DriverChannels {
    /// Media packets in stream order
    pub packets: mpsc::UnboundedReceiver<MediaPacket>,
    /// Lifecycle updates
    pub state: watch::Receiver<DriverState>,
    /// Outcome of [`Provider::start`]
    pub started: oneshot::Receiver<Result<SourceInfo>>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Driver spawns and manages the media reader task
///
/// The reader task owns the provider. Packets are handed over an unbounded
/// channel, so a slow consumer never causes a packet to be dropped.
pub struct Driver;

impl Driver {
    /// Spawn the reader task for `provider`.
    pub fn spawn<P>(provider: P, parent: &Span) -> DriverChannels
    where
        P: Provider,
    {
        Self::spawn_with_token(provider, CancellationToken::new(), parent)
    }

    /// Spawn with a caller-supplied cancellation token, e.g. the one the provider's
    /// own transport already honors.
    pub fn spawn_with_token<P>(provider: P, cancel: CancellationToken, parent: &Span) -> DriverChannels
    where
        P: Provider,
    {
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DriverState::Starting);
        let (started_tx, started_rx) = oneshot::channel();

        let span = info_span!(parent: parent, "driver");
        let task_cancel = cancel.clone();
        tokio::spawn(
            async move {
                Self::reader_task(provider, packet_tx, Arc::new(state_tx), started_tx, task_cancel).await;
            }
            .instrument(span),
        );

        DriverChannels { packets: packet_rx, state: state_rx, started: started_rx, cancel }
    }

    /// Reader task - starts the provider, then forwards packets until the stream ends
    async fn reader_task<P>(
        mut provider: P,
        packet_tx: mpsc::UnboundedSender<MediaPacket>,
        state_tx: Arc<watch::Sender<DriverState>>,
        started_tx: oneshot::Sender<Result<SourceInfo>>,
        cancel: CancellationToken,
    ) where
        P: Provider,
    {
        info!("Reader task started");

        let (first_tx, first_rx) = oneshot::channel();
        provider.notify_first_byte(first_tx);
        let flowing_tx = Arc::clone(&state_tx);
        tokio::spawn(
            async move {
                if first_rx.await.is_ok() {
                    flowing_tx.send_if_modified(|state| {
                        if *state == DriverState::Starting {
                            debug!("First stream byte received");
                            *state = DriverState::Flowing;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
            .in_current_span(),
        );

        let started = tokio::select! {
            _ = cancel.cancelled() => Err(DmssError::Cancelled),
            result = provider.start() => result,
        };
        let failure = started.as_ref().err().map(|e| e.to_string());
        let _ = started_tx.send(started);
        if let Some(reason) = failure {
            error!("Provider failed to start: {}", reason);
            provider.stop().await;
            state_tx.send_replace(DriverState::Ended(StopReason::Failed(reason)));
            return;
        }

        let (reason, packet_count) = Self::pump(&mut provider, &packet_tx, &cancel).await;

        provider.stop().await;
        info!(
            "Reader task ended: {:?} ({} packets, {} bytes)",
            reason,
            packet_count,
            provider.bytes_received()
        );
        state_tx.send_replace(DriverState::Ended(reason));
    }

    async fn pump<P>(
        provider: &mut P,
        packet_tx: &mpsc::UnboundedSender<MediaPacket>,
        cancel: &CancellationToken,
    ) -> (StopReason, u64)
    where
        P: Provider,
    {
        let mut packet_count = 0u64;
        let mut error_count = 0u32;

        loop {
            if cancel.is_cancelled() {
                return (StopReason::Cancelled, packet_count);
            }

            // Select so cancellation interrupts a blocked read
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reader cancelled during read");
                    return (StopReason::Cancelled, packet_count);
                }
                result = provider.next_packet() => result,
            };

            match result {
                Ok(Some(packet)) => {
                    packet_count += 1;
                    error_count = 0;
                    trace!("Packet {}: {:?} at offset {}", packet_count, packet.kind, packet.offset);

                    if packet_tx.send(packet).is_err() {
                        debug!("Packet receiver dropped, shutting down");
                        return (StopReason::ConsumerGone, packet_count);
                    }
                }
                Ok(None) => {
                    info!("Provider stream ended after {} packets", packet_count);
                    return (StopReason::Finished, packet_count);
                }
                Err(DmssError::Cancelled) => return (StopReason::Cancelled, packet_count),
                Err(e) if e.is_fatal_to_session() => {
                    // Timeouts land here too; restarting is up to the consumer.
                    error!("Provider failed: {}", e);
                    return (StopReason::Failed(e.to_string()), packet_count);
                }
                Err(e) => {
                    error_count += 1;
                    warn!("Provider error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many provider errors, shutting down");
                        return (StopReason::Failed(e.to_string()), packet_count);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DhavPacketBuilder;
    use anyhow::{Context, Result, ensure};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Provider scripted with a queue of results.
    struct Scripted {
        items: VecDeque<crate::Result<Option<MediaPacket>>>,
        start_error: Option<DmssError>,
        first_byte: crate::provider::FirstByte,
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Scripted {
        fn new(items: Vec<crate::Result<Option<MediaPacket>>>) -> Self {
            Self {
                items: items.into(),
                start_error: None,
                first_byte: Default::default(),
                stopped: Default::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for Scripted {
        async fn start(&mut self) -> crate::Result<SourceInfo> {
            match self.start_error.take() {
                Some(e) => Err(e),
                None => Ok(SourceInfo { source: "scripted".into(), ..Default::default() }),
            }
        }

        async fn next_packet(&mut self) -> crate::Result<Option<MediaPacket>> {
            match self.items.pop_front() {
                Some(item) => {
                    self.first_byte.observe(1);
                    item
                }
                None => std::future::pending().await,
            }
        }

        async fn stop(&mut self) {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn notify_first_byte(&mut self, signal: oneshot::Sender<()>) {
            self.first_byte.arm(signal);
        }

        fn bytes_received(&self) -> u64 {
            0
        }
    }

    fn packet(seed: u8) -> MediaPacket {
        let (mut reassembler, _clock) = crate::test_utils::reassembler_with_clock();
        reassembler.push(&DhavPacketBuilder::video_key(vec![seed; 8]).build());
        reassembler.next_packet().ok().flatten().expect("builder packet")
    }

    async fn wait_ended(state: &mut watch::Receiver<DriverState>) -> Result<DriverState> {
        let state = tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| s.is_ended()))
            .await
            .context("driver did not end")??;
        Ok(state.clone())
    }

    #[tokio::test]
    async fn forwards_packets_in_order_then_finishes() -> Result<()> {
        let provider = Scripted::new(vec![Ok(Some(packet(1))), Ok(Some(packet(2))), Ok(None)]);
        let stopped = Arc::clone(&provider.stopped);
        let mut channels = Driver::spawn(provider, &Span::none());

        channels.started.await??;
        ensure!(channels.packets.recv().await.context("first")?.payload[0] == 1);
        ensure!(channels.packets.recv().await.context("second")?.payload[0] == 2);
        ensure!(channels.packets.recv().await.is_none());
        ensure!(wait_ended(&mut channels.state).await? == DriverState::Ended(StopReason::Finished));
        ensure!(stopped.load(std::sync::atomic::Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn startup_error_is_delivered() -> Result<()> {
        let mut provider = Scripted::new(vec![]);
        provider.start_error = Some(DmssError::Authentication { user: "admin".into() });
        let mut channels = Driver::spawn(provider, &Span::none());

        let started = channels.started.await?;
        ensure!(matches!(started, Err(DmssError::Authentication { .. })));
        ensure!(matches!(wait_ended(&mut channels.state).await?, DriverState::Ended(StopReason::Failed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn framing_errors_are_skipped() -> Result<()> {
        let provider = Scripted::new(vec![
            Err(DmssError::corrupted("trailer mismatch")),
            Err(DmssError::MalformedHeader { needed: 32, available: 4 }),
            Ok(Some(packet(7))),
            Ok(None),
        ]);
        let mut channels = Driver::spawn(provider, &Span::none());

        channels.started.await??;
        ensure!(channels.packets.recv().await.context("packet after framing errors")?.payload[0] == 7);
        ensure!(wait_ended(&mut channels.state).await? == DriverState::Ended(StopReason::Finished));
        Ok(())
    }

    #[tokio::test]
    async fn timeout_ends_the_reader() -> Result<()> {
        let timeout = DmssError::transport(
            crate::Phase::Streaming,
            DmssError::Timeout { duration: Duration::from_secs(1) },
        );
        let provider = Scripted::new(vec![Ok(Some(packet(1))), Err(timeout), Ok(Some(packet(2)))]);
        let mut channels = Driver::spawn(provider, &Span::none());

        channels.started.await??;
        ensure!(channels.packets.recv().await.context("packet before timeout")?.payload[0] == 1);
        ensure!(channels.packets.recv().await.is_none(), "no packet is read after a timeout");
        ensure!(matches!(wait_ended(&mut channels.state).await?, DriverState::Ended(StopReason::Failed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_max_errors() -> Result<()> {
        let items = (0..MAX_ERRORS).map(|_| Err(DmssError::corrupted("trailer mismatch"))).collect();
        let mut channels = Driver::spawn(Scripted::new(items), &Span::none());

        channels.started.await??;
        ensure!(matches!(wait_ended(&mut channels.state).await?, DriverState::Ended(StopReason::Failed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn fatal_error_ends_immediately() -> Result<()> {
        let provider = Scripted::new(vec![Err(DmssError::ConnectionClosed), Ok(Some(packet(1)))]);
        let mut channels = Driver::spawn(provider, &Span::none());

        channels.started.await??;
        ensure!(matches!(wait_ended(&mut channels.state).await?, DriverState::Ended(StopReason::Failed(_))));
        ensure!(channels.packets.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn flowing_then_cancelled() -> Result<()> {
        let provider = Scripted::new(vec![Ok(Some(packet(3)))]);
        let mut channels = Driver::spawn(provider, &Span::none());

        channels.started.await??;
        channels.packets.recv().await.context("packet")?;
        tokio::time::timeout(Duration::from_secs(10), channels.state.wait_for(|s| *s != DriverState::Starting))
            .await??;

        channels.cancel.cancel();
        ensure!(wait_ended(&mut channels.state).await? == DriverState::Ended(StopReason::Cancelled));
        Ok(())
    }
}
