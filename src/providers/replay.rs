//! Replay provider for recorded DHAV captures

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{Span, debug, info, info_span};

use crate::dhav::{Reassembler, ReassemblerStats};
use crate::provider::{FirstByte, Provider, SourceInfo};
use crate::timing::{MonotonicClock, PipelineClock, ResyncEngine};
use crate::types::MediaPacket;
use crate::{DmssError, Result};

/// Bytes read from the capture per step.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Replay provider that reads a raw DHAV byte dump (`.dav`) from disk.
#[derive(Debug)]
pub struct ReplayProvider {
    path: PathBuf,
    file: Option<File>,
    chunk: Vec<u8>,
    reassembler: Reassembler,
    bytes_read: u64,
    first_byte: FirstByte,
    span: Span,
}

impl ReplayProvider {
    /// Create a replay provider for `path`. The file is opened by [`Provider::start`].
    pub fn new<P: AsRef<Path>>(path: P, parent: &Span) -> Self {
        Self::with_clock(path, Arc::new(MonotonicClock::new()), Duration::ZERO, parent)
    }

    /// Same as [`ReplayProvider::new`] with an explicit clock and latency.
    pub fn with_clock<P: AsRef<Path>>(
        path: P,
        clock: Arc<dyn PipelineClock>,
        latency: Duration,
        parent: &Span,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let span = info_span!(parent: parent, "replay", path = %path.display());
        let timing = ResyncEngine::new(clock, latency, &span);
        Self {
            reassembler: Reassembler::new(timing, &span),
            path,
            file: None,
            chunk: vec![0; DEFAULT_CHUNK_SIZE],
            bytes_read: 0,
            first_byte: FirstByte::default(),
            span,
        }
    }

    /// Change how many bytes are read per step.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk = vec![0; size.max(1)];
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reassembler_stats(&self) -> ReassemblerStats {
        self.reassembler.stats()
    }
}

#[async_trait::async_trait]
impl Provider for ReplayProvider {
    async fn start(&mut self) -> Result<SourceInfo> {
        let file =
            File::open(&self.path).await.map_err(|e| DmssError::file_error(self.path.clone(), e))?;
        let len = file.metadata().await.map(|m| m.len()).unwrap_or_default();
        info!(parent: &self.span, "Opened capture {} ({} bytes)", self.path.display(), len);

        self.reassembler.reset();
        self.bytes_read = 0;
        self.file = Some(file);
        Ok(SourceInfo { source: self.path.display().to_string(), ..SourceInfo::default() })
    }

    async fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
        loop {
            match self.reassembler.next_packet() {
                Ok(Some(packet)) => return Ok(Some(packet)),
                Ok(None) => {}
                Err(e) => {
                    debug!(parent: &self.span, "Skipping corrupted capture data: {}", e);
                    continue;
                }
            }

            let Some(file) = self.file.as_mut() else {
                return Err(DmssError::InvalidState { expected: "STARTED", actual: "STOPPED" });
            };
            let read = file
                .read(&mut self.chunk)
                .await
                .map_err(|e| DmssError::file_error(self.path.clone(), e))?;
            if read == 0 {
                let dropped = self.reassembler.flush();
                info!(
                    parent: &self.span,
                    "End of capture after {} bytes ({} packets, {} trailing bytes dropped)",
                    self.bytes_read,
                    self.reassembler.stats().packets_emitted(),
                    dropped
                );
                self.file = None;
                return Ok(None);
            }

            self.bytes_read += read as u64;
            self.first_byte.observe(read);
            self.reassembler.push(&self.chunk[..read]);
        }
    }

    async fn stop(&mut self) {
        self.file = None;
        self.reassembler.flush();
    }

    fn notify_first_byte(&mut self, signal: oneshot::Sender<()>) {
        self.first_byte.arm(signal);
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DhavPacketBuilder;
    use crate::timing::ManualClock;
    use crate::types::MediaKind;
    use anyhow::{Context, Result, ensure};
    use std::io::Write;

    fn capture(bytes: &[u8]) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file)
    }

    #[tokio::test]
    async fn replays_capture_in_order() -> Result<()> {
        let mut bytes = b"leading noise".to_vec();
        for i in 0..20u16 {
            bytes.extend(DhavPacketBuilder::video_delta(vec![i as u8; 200]).timing(5, i * 40).build());
        }
        let file = capture(&bytes)?;

        let mut provider = ReplayProvider::with_clock(
            file.path(),
            Arc::new(ManualClock::new()),
            Duration::ZERO,
            &Span::none(),
        )
        .with_chunk_size(333);
        let info = provider.start().await?;
        ensure!(info.session_id.is_none());

        let mut offsets = Vec::new();
        while let Some(packet) = provider.next_packet().await? {
            ensure!(packet.kind == MediaKind::VideoDelta);
            ensure!(packet.pts == Duration::from_secs(5) + Duration::from_millis(offsets.len() as u64 * 40));
            offsets.push(packet.offset);
        }

        ensure!(offsets.len() == 20);
        ensure!(offsets[0] == 13, "first packet starts after the noise");
        ensure!(offsets.windows(2).all(|w| w[1] > w[0]));
        ensure!(provider.bytes_received() == bytes.len() as u64);
        ensure!(provider.reassembler_stats().bytes_skipped == 13);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_tail_is_dropped() -> Result<()> {
        let mut bytes = DhavPacketBuilder::audio(vec![1; 30]).build();
        let second = DhavPacketBuilder::audio(vec![2; 30]).build();
        bytes.extend_from_slice(&second[..20]);
        let file = capture(&bytes)?;

        let mut provider = ReplayProvider::new(file.path(), &Span::none());
        provider.start().await?;
        provider.next_packet().await?.context("first packet")?;
        ensure!(provider.next_packet().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_a_file_error() {
        let mut provider = ReplayProvider::new("/nonexistent/capture.dav", &Span::none());
        let err = provider.start().await.unwrap_err();
        assert!(matches!(err, DmssError::File { .. }));
    }

    #[tokio::test]
    async fn pulling_before_start_is_invalid() {
        let mut provider = ReplayProvider::new("/nonexistent/capture.dav", &Span::none());
        assert!(matches!(provider.next_packet().await, Err(DmssError::InvalidState { .. })));
    }
}
