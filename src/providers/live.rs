//! Live media provider reading from a DMSS device

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, info_span, warn};

use crate::dhav::{Reassembler, ReassemblerStats, StreamEvent};
use crate::provider::{FirstByte, Provider, SourceInfo};
use crate::session::{SessionStats, TransportSession};
use crate::timing::{MonotonicClock, PipelineClock, ResyncEngine};
use crate::types::MediaPacket;
use crate::{Result, SessionConfig};

/// Live provider: transport session feeding a DHAV reassembler.
///
/// Usable directly as a pull source:
///
/// ```rust,no_run
/// use dmss::SessionConfig;
/// use dmss::provider::Provider;
/// use dmss::providers::LiveProvider;
/// use tokio_util::sync::CancellationToken;
/// use tracing::Span;
///
/// # #[tokio::main]
/// # async fn main() -> dmss::Result<()> {
/// let mut provider = LiveProvider::new(SessionConfig::default(), CancellationToken::new(), &Span::none())?;
/// provider.start().await?;
/// while let Some(packet) = provider.next_packet().await? {
///     println!("{:?} {} bytes at {:?}", packet.kind, packet.len(), packet.pts);
/// }
/// provider.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LiveProvider {
    config: SessionConfig,
    session: TransportSession,
    reassembler: Reassembler,
    first_byte: FirstByte,
    span: Span,
}

impl LiveProvider {
    /// Create a provider for `config`. Nothing touches the network until [`Provider::start`].
    pub fn new(config: SessionConfig, cancel: CancellationToken, parent: &Span) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()), cancel, parent)
    }

    /// Same as [`LiveProvider::new`] with an explicit pipeline clock.
    pub fn with_clock(
        config: SessionConfig,
        clock: Arc<dyn PipelineClock>,
        cancel: CancellationToken,
        parent: &Span,
    ) -> Result<Self> {
        config.validate()?;
        let span = info_span!(parent: parent, "live", host = %config.host, port = config.port);
        let session = TransportSession::new(config.timeout(), cancel, &span);
        let timing = ResyncEngine::new(clock, config.latency(), &span);
        let reassembler = Reassembler::new(timing, &span);
        Ok(Self { config, session, reassembler, first_byte: FirstByte::default(), span })
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn reassembler_stats(&self) -> ReassemblerStats {
        self.reassembler.stats()
    }

    /// Stream announcements raised since the last call.
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        self.reassembler.drain_events().collect()
    }
}

#[async_trait::async_trait]
impl Provider for LiveProvider {
    async fn start(&mut self) -> Result<SourceInfo> {
        info!(parent: &self.span, "Starting live stream from {}:{}", self.config.host, self.config.port);
        self.reassembler.reset();
        self.session.handshake(&self.config).await?;

        Ok(SourceInfo {
            source: format!("{}:{}", self.config.host, self.config.port),
            session_id: self.session.session_id(),
            connection_id: self.session.connection_id().map(str::to_string),
        })
    }

    async fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
        loop {
            match self.reassembler.next_packet() {
                Ok(Some(packet)) => return Ok(Some(packet)),
                Ok(None) => {}
                Err(e) => {
                    // Corruption already cleared the buffer; carry on with fresh data.
                    warn!(parent: &self.span, "Skipping corrupted stream data: {}", e);
                    continue;
                }
            }

            self.session.keep_alive().await?;
            match self.session.read_media().await {
                Ok(Some(bytes)) => {
                    self.first_byte.observe(bytes.len());
                    self.reassembler.push(&bytes);
                }
                Ok(None) => {}
                Err(e) if e.is_connection_closed() => {
                    let dropped = self.reassembler.flush();
                    info!(
                        parent: &self.span,
                        "Device closed the stream ({} incomplete bytes dropped)", dropped
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stop(&mut self) {
        if self.reassembler.buffered() > 0 {
            warn!(parent: &self.span, "Stopping with {} bytes buffered", self.reassembler.buffered());
        }
        self.reassembler.flush();
        self.session.close();
    }

    fn notify_first_byte(&mut self, signal: oneshot::Sender<()>) {
        self.first_byte.arm(signal);
    }

    fn bytes_received(&self) -> u64 {
        self.session.stats().bytes_received
    }
}
