//! Test utilities: DHAV packet builders and a scripted fake device.
//!
//! These helpers are shared by the unit tests, the integration tests and the
//! benchmarks, so none of them depend on a real camera being reachable.

#![cfg(any(test, feature = "benchmark"))]

use anyhow::{Context, ensure};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::SessionConfig;
use crate::dhav::{FIXED_HEADER_SIZE, Reassembler, TRAILER_SIZE, packet_type};
use crate::protocol::codec::{frame, send_all};
use crate::protocol::{IoPolicy, Packet, Prologue, command, receive_packet, send_packet};
use crate::timing::{ManualClock, ResyncEngine};

/// Extended header entry announcing H.264 video.
pub const H264_INFO: u32 = 0x8100_0800;

/// Extended header entry announcing A-law audio at 8 kHz.
pub const ALAW_8K_INFO: u32 = 0x8300_0E02;

/// Builds well-formed DHAV packets.
#[derive(Debug, Clone)]
pub struct DhavPacketBuilder {
    packet_type: u8,
    epoch: u16,
    device_ms: u16,
    extended: Vec<u32>,
    payload: Vec<u8>,
}

impl DhavPacketBuilder {
    /// Packet of an arbitrary type with no extended header.
    pub fn new(packet_type: u8, payload: Vec<u8>) -> Self {
        Self { packet_type, epoch: 0, device_ms: 0, extended: Vec::new(), payload }
    }

    /// Video keyframe announcing H.264.
    pub fn video_key(payload: Vec<u8>) -> Self {
        Self::new(packet_type::VIDEO_KEY, payload).extended(vec![H264_INFO])
    }

    /// Video delta frame announcing H.264.
    pub fn video_delta(payload: Vec<u8>) -> Self {
        Self::new(packet_type::VIDEO_DELTA, payload).extended(vec![H264_INFO])
    }

    /// Audio packet announcing A-law at 8 kHz.
    pub fn audio(payload: Vec<u8>) -> Self {
        Self::new(packet_type::AUDIO, payload).extended(vec![ALAW_8K_INFO])
    }

    pub fn timing(mut self, epoch: u16, device_ms: u16) -> Self {
        self.epoch = epoch;
        self.device_ms = device_ms;
        self
    }

    /// Replace the extended header entries.
    pub fn extended(mut self, entries: Vec<u32>) -> Self {
        self.extended = entries;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let ext_size = self.extended.len() * 4;
        let total = FIXED_HEADER_SIZE + ext_size + self.payload.len() + TRAILER_SIZE;
        let total_u32 = total as u32;

        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(b"DHAV");
        packet.push(self.packet_type);
        packet.extend_from_slice(&[0; 7]);
        packet.extend_from_slice(&total_u32.to_le_bytes());
        packet.extend_from_slice(&self.epoch.to_le_bytes());
        packet.extend_from_slice(&[0; 2]);
        packet.extend_from_slice(&self.device_ms.to_le_bytes());
        packet.push(ext_size as u8);
        packet.push(0);
        for entry in &self.extended {
            packet.extend_from_slice(&entry.to_be_bytes());
        }
        packet.extend_from_slice(&self.payload);
        packet.extend_from_slice(b"dhav");
        packet.extend_from_slice(&total_u32.to_le_bytes());
        packet
    }
}

/// Wrap DHAV bytes in a stream-channel media packet, prologue included.
pub fn stream_packet(dhav: &[u8]) -> Vec<u8> {
    frame(command::MEDIA, dhav).expect("media body fits the length field").to_vec()
}

/// A reassembler with zero latency driven by a manual clock.
pub fn reassembler_with_clock() -> (Reassembler, ManualClock) {
    let clock = ManualClock::new();
    let timing = ResyncEngine::new(Arc::new(clock.clone()), Duration::ZERO, &Span::none());
    (Reassembler::new(timing, &Span::none()), clock)
}

/// Behavior of a [`FakeDevice`].
#[derive(Debug, Clone)]
pub struct DeviceScript {
    session_id: u32,
    reject_login: bool,
    fault_code: String,
    start_reply: String,
    connection_id: String,
    stream: Vec<(u8, Vec<u8>)>,
    stream_tail: Vec<u8>,
    hold_stream: bool,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            session_id: 0x0102_0304,
            reject_login: false,
            fault_code: "OK".to_string(),
            start_reply: "FaultCode:OK\r\n\r\n".to_string(),
            connection_id: "12345".to_string(),
            stream: Vec::new(),
            stream_tail: Vec::new(),
            hold_stream: false,
        }
    }
}

impl DeviceScript {
    pub fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Answer the login with the auth-failure flag set, then hang up.
    pub fn reject_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// Answer object negotiation with `code` instead of `OK`.
    pub fn add_object_fault(mut self, code: &str) -> Self {
        self.fault_code = code.to_string();
        self
    }

    /// Answer the stream start with `body` instead of an `OK` fault code.
    pub fn start_reply(mut self, body: &str) -> Self {
        self.start_reply = body.to_string();
        self
    }

    pub fn connection_id(mut self, connection_id: &str) -> Self {
        self.connection_id = connection_id.to_string();
        self
    }

    /// Packets written on the stream channel once streaming started.
    pub fn stream(mut self, packets: Vec<(u8, Vec<u8>)>) -> Self {
        self.stream = packets;
        self
    }

    /// Send `dhav` as media packets of at most `chunk` bytes.
    pub fn media(mut self, dhav: &[u8], chunk: usize) -> Self {
        self.stream.extend(dhav.chunks(chunk.max(1)).map(|c| (command::MEDIA, c.to_vec())));
        self
    }

    /// Write only the first `len` bytes of a media packet carrying `dhav` after
    /// the scripted packets.
    pub fn truncated_media(mut self, dhav: &[u8], len: usize) -> Self {
        let mut wire = stream_packet(dhav);
        wire.truncate(len);
        self.stream_tail = wire;
        self
    }

    /// Keep the stream channel open after the scripted packets.
    pub fn hold_stream(mut self) -> Self {
        self.hold_stream = true;
        self
    }

    async fn run(self, listener: TcpListener) -> anyhow::Result<DeviceLog> {
        let policy = IoPolicy::default();
        let mut log = DeviceLog::default();

        let (mut control, _) = listener.accept().await.context("accept control")?;
        let login = receive_packet(&mut control, &policy).await.context("read login")?;
        ensure!(login.command() == command::LOGIN, "expected login, got {:#04x}", login.command());
        log.login_prologue = *login.prologue.as_bytes();
        log.login_body = login.body.to_vec();

        let reply = if self.reject_login {
            Prologue::new(command::LOGIN).with_u8(8, 1)
        } else {
            Prologue::new(command::LOGIN).with_u32_le(16, self.session_id)
        };
        send_packet(&mut control, &Packet::new(reply, Bytes::new()), &policy).await?;
        if self.reject_login {
            return Ok(log);
        }

        let noop = receive_packet(&mut control, &policy).await.context("read keep-alive")?;
        ensure!(noop.command() == command::NOOP, "expected keep-alive, got {:#04x}", noop.command());
        log.noops_before_ready += 1;
        send_text(&mut control, "", &policy).await?;
        send_packet(&mut control, &Packet::new(Prologue::new(command::READY), Bytes::new()), &policy)
            .await?;

        let add_object = receive_packet(&mut control, &policy).await.context("read add object")?;
        log.add_object_body = String::from_utf8_lossy(&add_object.body).into_owned();
        let answer = format!("FaultCode:{}\r\nConnectionID:{}\r\n\r\n", self.fault_code, self.connection_id);
        send_text(&mut control, &answer, &policy).await?;
        if !self.fault_code.starts_with("OK") {
            return Ok(log);
        }

        let (mut stream, _) = listener.accept().await.context("accept stream")?;
        let ack = receive_packet(&mut stream, &policy).await.context("read subchannel ack")?;
        log.ack_subchannel_body = String::from_utf8_lossy(&ack.body).into_owned();
        send_text(&mut stream, "", &policy).await?;

        let start = receive_packet(&mut control, &policy).await.context("read stream start")?;
        log.start_body = String::from_utf8_lossy(&start.body).into_owned();
        send_text(&mut control, &self.start_reply, &policy).await?;

        for (cmd, body) in self.stream {
            send_packet(&mut stream, &Packet::new(Prologue::new(cmd), body), &policy).await?;
        }
        if !self.stream_tail.is_empty() {
            send_all(&mut stream, &self.stream_tail, &policy).await?;
        }
        let held = if self.hold_stream { Some(stream) } else { None };

        let mut scratch = [0u8; 1024];
        loop {
            match control.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(n) => log.control_bytes_after_start += n,
            }
        }
        drop(held);
        Ok(log)
    }
}

async fn send_text(
    socket: &mut tokio::net::TcpStream,
    body: &str,
    policy: &IoPolicy,
) -> crate::Result<()> {
    let packet = Packet::new(Prologue::new(command::TEXT), Bytes::copy_from_slice(body.as_bytes()));
    send_packet(socket, &packet, policy).await
}

/// What a [`FakeDevice`] received.
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    pub login_prologue: [u8; 32],
    pub login_body: Vec<u8>,
    pub noops_before_ready: usize,
    pub add_object_body: String,
    pub ack_subchannel_body: String,
    pub start_body: String,
    /// Keep-alive bytes received on the control channel while streaming
    pub control_bytes_after_start: usize,
}

/// A scripted DMSS device listening on an ephemeral local port.
#[derive(Debug)]
pub struct FakeDevice {
    port: u16,
    task: JoinHandle<anyhow::Result<DeviceLog>>,
}

impl FakeDevice {
    pub async fn spawn(script: DeviceScript) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(script.run(listener));
        Ok(Self { port, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Session config pointing at this device.
    pub fn config(&self) -> SessionConfig {
        SessionConfig::default().with_host("127.0.0.1").with_port(self.port).with_timeout_secs(5)
    }

    /// Wait for the script to end and return what the device received.
    pub async fn finish(self) -> anyhow::Result<DeviceLog> {
        self.task.await.context("fake device task panicked")?
    }
}
