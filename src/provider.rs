//! Provider trait for media sources

use tokio::sync::oneshot;

use crate::Result;
use crate::types::MediaPacket;

/// What a provider learned while starting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    /// Human-readable source description (`host:port` or file path)
    pub source: String,
    /// Device-assigned session id, live sources only
    pub session_id: Option<u32>,
    /// Device-assigned connection id, live sources only
    pub connection_id: Option<String>,
}

/// Trait for media sources
///
/// Providers own their transport and reassembly state and are driven by a
/// single caller: either directly (pull model) or by [`crate::driver::Driver`]
/// on a background task.
#[async_trait::async_trait]
pub trait Provider: Send + 'static {
    /// Bring the source up: run the device handshake or open the capture.
    async fn start(&mut self) -> Result<SourceInfo>;

    /// Get the next media packet
    ///
    /// Returns:
    /// - `Ok(Some(packet))` - Packet available
    /// - `Ok(None)` - Stream ended (normal termination)
    /// - `Err(e)` - Error occurred; see [`crate::DmssError::is_fatal_to_session`]
    async fn next_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// Release the transport. Safe to call more than once.
    async fn stop(&mut self);

    /// Register a signal fired once, when the first stream byte arrives.
    fn notify_first_byte(&mut self, signal: oneshot::Sender<()>);

    /// Stream bytes consumed so far.
    fn bytes_received(&self) -> u64;
}

/// One-shot "first byte arrived" signal shared by the providers.
#[derive(Debug, Default)]
pub(crate) struct FirstByte {
    signal: Option<oneshot::Sender<()>>,
    seen: bool,
}

impl FirstByte {
    pub(crate) fn arm(&mut self, signal: oneshot::Sender<()>) {
        if self.seen {
            let _ = signal.send(());
        } else {
            self.signal = Some(signal);
        }
    }

    pub(crate) fn observe(&mut self, bytes: usize) {
        if bytes == 0 || self.seen {
            return;
        }
        self.seen = true;
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_on_first_bytes() {
        let mut first = FirstByte::default();
        let (tx, rx) = oneshot::channel();
        first.arm(tx);
        first.observe(0);
        first.observe(10);
        first.observe(10);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn late_arming_fires_immediately() {
        let mut first = FirstByte::default();
        first.observe(1);
        let (tx, rx) = oneshot::channel();
        first.arm(tx);
        assert!(rx.await.is_ok());
    }
}
