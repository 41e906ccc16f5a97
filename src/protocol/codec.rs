//! Prologue framing shared by the control and stream channels.
//!
//! ```text
//! ┌─────────┬──────────┬─────────────┬─────────────────────────────┬──────────────┐
//! │ Command │ Fields   │ Body length │ Command-specific fields      │ Body         │
//! │ (1)     │ (3)      │ (4, LE)     │ (24)                        │ (body length)│
//! └─────────┴──────────┴─────────────┴─────────────────────────────┴──────────────┘
//!                        32-byte prologue
//! ```
//!
//! Known command-specific fields: the login ack carries an auth-failure flag at
//! offset 8 and the session id (LE) at offset 16.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{DmssError, Result};

/// Size of the fixed prologue preceding every packet body.
pub const PROLOGUE_SIZE: usize = 32;

/// Largest body the codec accepts from the wire.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const COMMAND_OFFSET: usize = 0;
const BODY_LEN_OFFSET: usize = 4;

/// Prologue command codes
pub mod command {
    pub const LOGIN: u8 = 0xA0;
    pub const NOOP: u8 = 0xA1;
    pub const READY: u8 = 0xB1;
    pub const MEDIA: u8 = 0xBC;
    pub const TEXT: u8 = 0xF4;
    pub const JSON: u8 = 0xF6;

    /// Human-readable name for logging
    pub fn name(code: u8) -> &'static str {
        match code {
            LOGIN => "LOGIN",
            NOOP => "NOOP",
            READY => "READY",
            MEDIA => "MEDIA",
            TEXT => "TEXT",
            JSON => "JSON",
            _ => "UNKNOWN",
        }
    }
}

/// A 32-byte packet prologue.
///
/// Bytes 0 and 4..8 belong to the codec (command and body length); every other
/// byte is a command-specific fixed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    bytes: [u8; PROLOGUE_SIZE],
}

impl Prologue {
    /// Zero-filled prologue for `command`.
    pub fn new(command: u8) -> Self {
        let mut bytes = [0u8; PROLOGUE_SIZE];
        bytes[COMMAND_OFFSET] = command;
        Self { bytes }
    }

    /// Set a single fixed-field byte.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the prologue.
    pub fn with_u8(mut self, offset: usize, value: u8) -> Self {
        self.bytes[offset] = value;
        self
    }

    /// Set a little-endian u32 fixed field.
    ///
    /// # Panics
    ///
    /// Panics if the field does not fit in the prologue.
    pub fn with_u32_le(self, offset: usize, value: u32) -> Self {
        self.with_bytes(offset, &value.to_le_bytes())
    }

    /// Copy raw bytes into the fixed fields starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the bytes do not fit in the prologue.
    pub fn with_bytes(mut self, offset: usize, value: &[u8]) -> Self {
        self.bytes[offset..offset + value.len()].copy_from_slice(value);
        self
    }

    pub fn command(&self) -> u8 {
        self.bytes[COMMAND_OFFSET]
    }

    /// Declared body length.
    pub fn body_len(&self) -> usize {
        self.u32_le_at(BODY_LEN_OFFSET) as usize
    }

    pub fn u8_at(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn u32_le_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn as_bytes(&self) -> &[u8; PROLOGUE_SIZE] {
        &self.bytes
    }
}

/// Encode a prologue and body into `buffer`, returning the number of bytes written.
///
/// The declared length field is always `body.len()`; whatever the prologue held at
/// offsets 4..8 is overwritten.
pub fn encode_command(buffer: &mut [u8], prologue: &Prologue, body: &[u8]) -> Result<usize> {
    let needed = PROLOGUE_SIZE + body.len();
    if buffer.len() < needed {
        return Err(DmssError::Encoding { needed, capacity: buffer.len() });
    }
    let body_len = u32::try_from(body.len())
        .map_err(|_| DmssError::Encoding { needed, capacity: u32::MAX as usize })?;

    buffer[..PROLOGUE_SIZE].copy_from_slice(prologue.as_bytes());
    buffer[BODY_LEN_OFFSET..BODY_LEN_OFFSET + 4].copy_from_slice(&body_len.to_le_bytes());
    buffer[PROLOGUE_SIZE..needed].copy_from_slice(body);
    Ok(needed)
}

/// Parse the first 32 bytes of `bytes` as a prologue.
pub fn decode_prologue(bytes: &[u8]) -> Result<Prologue> {
    if bytes.len() < PROLOGUE_SIZE {
        return Err(DmssError::MalformedHeader { needed: PROLOGUE_SIZE, available: bytes.len() });
    }
    let mut raw = [0u8; PROLOGUE_SIZE];
    raw.copy_from_slice(&bytes[..PROLOGUE_SIZE]);
    Ok(Prologue { bytes: raw })
}

/// A decoded packet: prologue plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub prologue: Prologue,
    pub body: Bytes,
}

impl Packet {
    pub fn new(prologue: Prologue, body: impl Into<Bytes>) -> Self {
        Self { prologue, body: body.into() }
    }

    pub fn command(&self) -> u8 {
        self.prologue.command()
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::zeroed(PROLOGUE_SIZE + self.body.len());
        encode_command(&mut buffer, &self.prologue, &self.body)?;
        Ok(buffer.freeze())
    }
}

/// Timeout and cancellation applied to every blocking socket operation.
#[derive(Debug, Clone, Default)]
pub struct IoPolicy {
    /// Per-call timeout, `None` waits forever
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl IoPolicy {
    pub fn new(timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Run one I/O future under this policy.
    pub(crate) async fn guard<F, T>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        let timed = async {
            match self.timeout {
                Some(duration) => match tokio::time::timeout(duration, op).await {
                    Ok(result) => result.map_err(DmssError::from),
                    Err(_) => Err(DmssError::Timeout { duration }),
                },
                None => op.await.map_err(DmssError::from),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DmssError::Cancelled),
            result = timed => result,
        }
    }
}

/// Read exactly `n` bytes.
///
/// A zero-byte read before `n` bytes arrive is [`DmssError::ConnectionClosed`];
/// the timeout applies to each individual read.
pub async fn receive_exact<R>(reader: &mut R, n: usize, policy: &IoPolicy) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::zeroed(n);
    let mut filled = 0;
    while filled < n {
        let read = policy.guard(reader.read(&mut buffer[filled..])).await?;
        if read == 0 {
            trace!("EOF after {} of {} bytes", filled, n);
            return Err(DmssError::ConnectionClosed);
        }
        filled += read;
    }
    Ok(buffer.freeze())
}

/// Read one prologue and its body.
pub async fn receive_packet<R>(reader: &mut R, policy: &IoPolicy) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let raw = receive_exact(reader, PROLOGUE_SIZE, policy).await?;
    let prologue = decode_prologue(&raw)?;
    let body_len = prologue.body_len();
    if body_len > MAX_BODY_LEN {
        return Err(DmssError::BodyTooLarge { declared: body_len, limit: MAX_BODY_LEN });
    }
    let body =
        if body_len == 0 { Bytes::new() } else { receive_exact(reader, body_len, policy).await? };
    trace!("Received {} packet with {} byte body", command::name(prologue.command()), body_len);
    Ok(Packet { prologue, body })
}

/// Write all of `bytes`.
pub async fn send_all<W>(writer: &mut W, bytes: &[u8], policy: &IoPolicy) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    policy.guard(writer.write_all(bytes)).await?;
    policy.guard(writer.flush()).await
}

/// Encode and write a packet.
pub async fn send_packet<W>(writer: &mut W, packet: &Packet, policy: &IoPolicy) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    trace!("Sending {} packet with {} byte body", command::name(packet.command()), packet.body.len());
    send_all(writer, &bytes, policy).await
}

/// Frame `body` in a prologue with the given command, ready for the wire.
pub fn frame(command: u8, body: &[u8]) -> Result<Bytes> {
    Packet::new(Prologue::new(command), Bytes::copy_from_slice(body)).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn framing_round_trip(
            cmd in any::<u8>(),
            field in any::<u32>(),
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let prologue = Prologue::new(cmd).with_u32_le(16, field);
            let mut buffer = vec![0u8; PROLOGUE_SIZE + body.len()];
            let written = encode_command(&mut buffer, &prologue, &body).unwrap();
            prop_assert_eq!(written, buffer.len());

            let decoded = decode_prologue(&buffer).unwrap();
            prop_assert_eq!(decoded.command(), cmd);
            prop_assert_eq!(decoded.body_len(), body.len());
            prop_assert_eq!(decoded.u32_le_at(16), field);
            prop_assert_eq!(&buffer[PROLOGUE_SIZE..], &body[..]);
        }
    }

    #[test]
    fn encode_rejects_small_buffer() {
        let mut buffer = [0u8; 40];
        let err = encode_command(&mut buffer, &Prologue::new(command::TEXT), &[0u8; 9]).unwrap_err();
        assert!(matches!(err, DmssError::Encoding { needed: 41, capacity: 40 }));
    }

    #[test]
    fn encode_overwrites_length_field() {
        let prologue = Prologue::new(command::NOOP).with_u32_le(4, 0xdead_beef);
        let bytes = Packet::new(prologue, Bytes::from_static(b"abc")).to_bytes().unwrap();
        assert_eq!(&bytes[4..8], &[3, 0, 0, 0]);
    }

    #[test]
    fn decode_rejects_short_input() {
        let err = decode_prologue(&[0u8; 31]).unwrap_err();
        assert!(matches!(err, DmssError::MalformedHeader { needed: 32, available: 31 }));
    }

    #[tokio::test]
    async fn receive_packet_reads_prologue_and_body() {
        let wire = frame(command::TEXT, b"FaultCode:OK\r\n").unwrap();
        let mut reader: &[u8] = &wire;
        let packet = receive_packet(&mut reader, &IoPolicy::default()).await.unwrap();
        assert_eq!(packet.command(), command::TEXT);
        assert_eq!(&packet.body[..], b"FaultCode:OK\r\n");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn receive_exact_reports_closed_connection() {
        let mut reader: &[u8] = &[1, 2, 3];
        let err = receive_exact(&mut reader, 8, &IoPolicy::default()).await.unwrap_err();
        assert!(matches!(err, DmssError::ConnectionClosed));
    }

    #[tokio::test]
    async fn receive_exact_assembles_fragmented_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in [&b"ab"[..], b"cde", b"f"] {
                server.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            server
        });

        let bytes = receive_exact(&mut client, 6, &IoPolicy::default()).await.unwrap();
        assert_eq!(&bytes[..], b"abcdef");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn receive_exact_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let policy = IoPolicy::new(Some(Duration::from_millis(20)), CancellationToken::new());
        let err = receive_exact(&mut client, 4, &policy).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_connection_closed());
    }

    #[tokio::test]
    async fn receive_exact_honors_cancellation() {
        let (mut client, _server) = tokio::io::duplex(64);
        let policy = IoPolicy::default();
        let cancel = policy.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let err = receive_exact(&mut client, 4, &policy).await.unwrap_err();
        assert!(matches!(err, DmssError::Cancelled));
    }

    #[tokio::test]
    async fn stream_packet_carries_dhav_body() {
        let dhav = crate::test_utils::DhavPacketBuilder::audio(vec![1; 4]).build();
        let wire = crate::test_utils::stream_packet(&dhav);
        let mut reader: &[u8] = &wire;
        let packet = receive_packet(&mut reader, &IoPolicy::default()).await.unwrap();
        assert_eq!(packet.command(), command::MEDIA);
        assert_eq!(&packet.body[..], &dhav[..]);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let prologue = Prologue::new(command::MEDIA).with_u32_le(4, (MAX_BODY_LEN + 1) as u32);
        let mut reader: &[u8] = prologue.as_bytes();
        let err = receive_packet(&mut reader, &IoPolicy::default()).await.unwrap_err();
        assert!(matches!(err, DmssError::BodyTooLarge { .. }));
    }
}
