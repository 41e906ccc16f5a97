//! Control-channel session with a DMSS device.
//!
//! [`TransportSession`] drives the handshake one step at a time:
//!
//! ```text
//! Open ─connect─▶ NameResolved ─▶ ControlConnected ─login─▶ LoggedIn ─wait_ready─▶ Ready
//!   ─add_object─▶ ObjectAdded ─link_subchannel─▶ StreamConnected ─▶ SubchannelLinked
//!   ─start_stream─▶ Streaming
//! ```
//!
//! Any fatal failure closes both sockets and moves the session to `Closed`; the
//! returned error carries the [`Phase`] that failed. Nothing is retried here.
//!
//! ```rust,no_run
//! use dmss::SessionConfig;
//! use dmss::session::TransportSession;
//! use tokio_util::sync::CancellationToken;
//! use tracing::Span;
//!
//! # #[tokio::main]
//! # async fn main() -> dmss::Result<()> {
//! let config = SessionConfig::default().with_host("192.168.1.108");
//! let mut session = TransportSession::new(config.timeout(), CancellationToken::new(), &Span::none());
//! session.handshake(&config).await?;
//! while let Some(bytes) = session.read_media().await? {
//!     session.keep_alive().await?;
//!     println!("{} DHAV bytes", bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, trace, warn};

use crate::SessionConfig;
use crate::protocol::{
    IoPolicy, Packet, Prologue, TextCommand, TextResponse, command, receive_packet, send_packet,
};
use crate::{DmssError, Phase, Result};

/// Maximum time between keep-alives before the device drops the session.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

const LOGIN_AUTH_FAILURE_OFFSET: usize = 8;
const LOGIN_SESSION_ID_OFFSET: usize = 16;
const LOGIN_MAGIC: [u8; 3] = [0x00, 0x00, 0x60];
const LOGIN_CLIENT_TAG: [u8; 7] = [0x04, 0x02, 0x03, 0x00, 0x01, 0xa1, 0xaa];

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Open,
    NameResolved,
    ControlConnected,
    LoggedIn,
    /// Device acknowledged the first keep-alive
    Ready,
    ObjectAdded,
    StreamConnected,
    SubchannelLinked,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Open => "OPEN",
            SessionState::NameResolved => "NAME_RESOLVED",
            SessionState::ControlConnected => "CONTROL_CONNECTED",
            SessionState::LoggedIn => "LOGGED_IN",
            SessionState::Ready => "READY",
            SessionState::ObjectAdded => "OBJECT_ADDED",
            SessionState::StreamConnected => "STREAM_CONNECTED",
            SessionState::SubchannelLinked => "SUBCHANNEL_LINKED",
            SessionState::Streaming => "STREAMING",
            SessionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read from the stream channel, prologues included
    pub bytes_received: u64,
    pub keepalives_sent: u64,
    pub media_packets: u64,
    /// Stream-channel packets that carried no media
    pub ignored_packets: u64,
}

/// A DMSS device session: control socket, stream socket and negotiated ids.
pub struct TransportSession {
    state: SessionState,
    peer: Option<SocketAddr>,
    control: Option<TcpStream>,
    stream: Option<TcpStream>,
    session_id: Option<u32>,
    connection_id: Option<String>,
    policy: IoPolicy,
    last_keepalive: Option<Instant>,
    rate_window_bytes: u64,
    stats: SessionStats,
    span: Span,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("stats", &self.stats)
            .finish()
    }
}

impl TransportSession {
    /// Create a session. Every socket operation honors `timeout` and `cancel`.
    pub fn new(timeout: Option<Duration>, cancel: CancellationToken, parent: &Span) -> Self {
        Self {
            state: SessionState::Open,
            peer: None,
            control: None,
            stream: None,
            session_id: None,
            connection_id: None,
            policy: IoPolicy::new(timeout, cancel),
            last_keepalive: None,
            rate_window_bytes: 0,
            stats: SessionStats::default(),
            span: info_span!(parent: parent, "session"),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.policy.cancel
    }

    /// Run the full handshake described by `config`.
    pub async fn handshake(&mut self, config: &SessionConfig) -> Result<()> {
        self.connect(&config.host, config.port).await?;
        self.login(&config.username, &config.password).await?;
        self.wait_ready().await?;
        self.add_object().await?;
        self.link_subchannel().await?;
        self.start_stream(config.channel, config.subchannel).await
    }

    /// Resolve `host` and open the control connection.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.state != SessionState::Closed {
            self.expect_state(SessionState::Open)?;
        }
        self.state = SessionState::Open;
        let span = self.span.clone();

        let resolved = resolve(host, port, &self.policy).instrument(span.clone()).await;
        let addr = self.check(Phase::Resolve, resolved)?;
        self.state = SessionState::NameResolved;
        debug!(parent: &span, "IP address for host {} is {}", host, addr.ip());

        let opened = open_socket(addr, &self.policy).instrument(span.clone()).await;
        let control = self.check(Phase::ControlConnect, opened)?;
        info!(parent: &span, "Control channel connected to {}", addr);

        self.control = Some(control);
        self.peer = Some(addr);
        self.state = SessionState::ControlConnected;
        Ok(addr)
    }

    /// Authenticate and record the device-assigned session id.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<u32> {
        self.expect_state(SessionState::ControlConnected)?;
        let span = self.span.clone();
        let result = self.login_exchange(user, password).instrument(span.clone()).await;
        let session_id = self.check(Phase::Login, result)?;

        info!(parent: &span, "Authenticated as '{}' with session id {}", user, session_id);
        self.session_id = Some(session_id);
        self.state = SessionState::LoggedIn;
        Ok(session_id)
    }

    async fn login_exchange(&mut self, user: &str, password: &str) -> Result<u32> {
        let prologue =
            Prologue::new(command::LOGIN).with_bytes(1, &LOGIN_MAGIC).with_bytes(24, &LOGIN_CLIENT_TAG);
        let body = format!("{}&&{}", user, password);
        let control = control_socket(&mut self.control)?;

        send_packet(control, &Packet::new(prologue, body.into_bytes()), &self.policy).await?;
        debug!("Sent authentication info, waiting for response");

        let response = receive_packet(control, &self.policy).await?;
        if response.prologue.u8_at(LOGIN_AUTH_FAILURE_OFFSET) != 0 {
            return Err(DmssError::Authentication { user: user.to_string() });
        }
        Ok(response.prologue.u32_le_at(LOGIN_SESSION_ID_OFFSET))
    }

    /// Send the first keep-alive and wait for the device's READY packet.
    pub async fn wait_ready(&mut self) -> Result<()> {
        self.expect_state(SessionState::LoggedIn)?;
        let span = self.span.clone();
        let result = self.ready_exchange().instrument(span.clone()).await;
        self.check(Phase::WaitReady, result)?;

        debug!(parent: &span, "Device ready");
        self.state = SessionState::Ready;
        Ok(())
    }

    async fn ready_exchange(&mut self) -> Result<()> {
        let control = control_socket(&mut self.control)?;
        send_packet(control, &Packet::new(Prologue::new(command::NOOP), Bytes::new()), &self.policy)
            .await?;
        self.last_keepalive = Some(Instant::now());

        loop {
            let packet = receive_packet(control, &self.policy).await?;
            if packet.command() == command::READY {
                return Ok(());
            }
            debug!("Discarding {} packet while waiting for READY", command::name(packet.command()));
        }
    }

    /// Request a passive control connection and store the connection id.
    pub async fn add_object(&mut self) -> Result<String> {
        self.expect_state(SessionState::Ready)?;
        let span = self.span.clone();
        let result = self.add_object_exchange().instrument(span.clone()).await;
        let connection_id = self.check(Phase::AddObject, result)?;

        debug!(parent: &span, "Device assigned connection id {}", connection_id);
        self.connection_id = Some(connection_id.clone());
        self.state = SessionState::ObjectAdded;
        Ok(connection_id)
    }

    async fn add_object_exchange(&mut self) -> Result<String> {
        let control = control_socket(&mut self.control)?;
        let body = TextCommand::add_object().render();
        send_packet(control, &Packet::new(Prologue::new(command::TEXT), body.into_bytes()), &self.policy)
            .await?;

        let packet = receive_packet(control, &self.policy).await?;
        let response = TextResponse::parse(&packet.body);
        match response.fault_code() {
            None => return Err(DmssError::protocol(Phase::AddObject, "response has no FaultCode")),
            Some(code) if !response.is_ok() => {
                return Err(DmssError::protocol(Phase::AddObject, format!("device fault '{}'", code)));
            }
            Some(_) => {}
        }
        response
            .connection_id()
            .ok_or_else(|| DmssError::protocol(Phase::AddObject, "response has no ConnectionID"))
    }

    /// Open the stream channel and bind it to this session.
    pub async fn link_subchannel(&mut self) -> Result<()> {
        self.expect_state(SessionState::ObjectAdded)?;
        let span = self.span.clone();
        let addr = self.peer.ok_or(DmssError::InvalidState {
            expected: SessionState::ControlConnected.name(),
            actual: self.state.name(),
        })?;

        let opened = open_socket(addr, &self.policy).instrument(span.clone()).await;
        let stream = self.check(Phase::StreamConnect, opened)?;
        self.stream = Some(stream);
        self.state = SessionState::StreamConnected;
        debug!(parent: &span, "Stream channel connected to {}", addr);

        let result = self.link_exchange().instrument(span.clone()).await;
        self.check(Phase::LinkSubchannel, result)?;
        self.state = SessionState::SubchannelLinked;
        Ok(())
    }

    async fn link_exchange(&mut self) -> Result<()> {
        let session_id = self.session_id.unwrap_or_default();
        let connection_id = self.connection_id.clone().unwrap_or_default();
        let stream = stream_socket(&mut self.stream)?;

        let body = TextCommand::ack_subchannel(session_id, &connection_id).render();
        send_packet(stream, &Packet::new(Prologue::new(command::TEXT), body.into_bytes()), &self.policy)
            .await?;

        let ack = receive_packet(stream, &self.policy).await?;
        debug!(
            "Subchannel acknowledged with {} packet ({} byte body)",
            command::name(ack.command()),
            ack.body.len()
        );
        Ok(())
    }

    /// Ask the device to start streaming `channel`/`subchannel`.
    pub async fn start_stream(&mut self, channel: u32, subchannel: u32) -> Result<()> {
        self.expect_state(SessionState::SubchannelLinked)?;
        let span = self.span.clone();
        let result = self.start_exchange(channel, subchannel).instrument(span.clone()).await;
        self.check(Phase::StartStream, result)?;

        info!(parent: &span, "Streaming channel {} subchannel {}", channel, subchannel);
        self.state = SessionState::Streaming;
        Ok(())
    }

    async fn start_exchange(&mut self, channel: u32, subchannel: u32) -> Result<()> {
        let connection_id = self.connection_id.clone().unwrap_or_default();
        let control = control_socket(&mut self.control)?;

        let body = TextCommand::monitor_start(channel, subchannel, &connection_id).render();
        send_packet(control, &Packet::new(Prologue::new(command::TEXT), body.into_bytes()), &self.policy)
            .await?;

        let packet = receive_packet(control, &self.policy).await?;
        if packet.command() != command::TEXT {
            warn!("Stream start answered with {} packet", command::name(packet.command()));
        }
        // Some firmware acknowledges with an empty body; only an explicit fault fails.
        let response = TextResponse::parse(&packet.body);
        match response.fault_code() {
            Some(code) if !response.is_ok() => {
                Err(DmssError::protocol(Phase::StartStream, format!("device fault '{}'", code)))
            }
            _ => Ok(()),
        }
    }

    /// Send a keep-alive if [`KEEPALIVE_INTERVAL`] has passed. Returns whether one was sent.
    pub async fn keep_alive(&mut self) -> Result<bool> {
        self.keep_alive_at(Instant::now()).await
    }

    /// [`Self::keep_alive`] against an explicit clock reading.
    pub async fn keep_alive_at(&mut self, now: Instant) -> Result<bool> {
        let due = self
            .last_keepalive
            .is_none_or(|last| now.saturating_duration_since(last) > KEEPALIVE_INTERVAL);
        if !due {
            return Ok(false);
        }

        let span = self.span.clone();
        let result = self.keepalive_exchange().instrument(span.clone()).await;
        self.check(Phase::KeepAlive, result)?;

        if let Some(last) = self.last_keepalive {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                debug!(
                    parent: &span,
                    "Download rate of {:.0} B/s",
                    self.rate_window_bytes as f64 / elapsed
                );
            }
        }
        self.rate_window_bytes = 0;
        self.last_keepalive = Some(now);
        self.stats.keepalives_sent += 1;
        Ok(true)
    }

    async fn keepalive_exchange(&mut self) -> Result<()> {
        let control = control_socket(&mut self.control)?;
        send_packet(control, &Packet::new(Prologue::new(command::NOOP), Bytes::new()), &self.policy)
            .await?;
        drain_pending(control)
    }

    /// Read one stream-channel packet.
    ///
    /// Returns `Ok(Some(bytes))` with DHAV data for media packets and `Ok(None)`
    /// for packets that carry none. Zero-length media packets count as none.
    pub async fn read_media(&mut self) -> Result<Option<Bytes>> {
        self.expect_state(SessionState::Streaming)?;
        let span = self.span.clone();
        let result = async {
            let stream = stream_socket(&mut self.stream)?;
            receive_packet(stream, &self.policy).await
        }
        .instrument(span)
        .await;
        let packet = self.check(Phase::Streaming, result)?;

        let wire_len = (crate::protocol::PROLOGUE_SIZE + packet.body.len()) as u64;
        self.stats.bytes_received += wire_len;
        self.rate_window_bytes += wire_len;

        if packet.command() == command::MEDIA && !packet.body.is_empty() {
            self.stats.media_packets += 1;
            Ok(Some(packet.body))
        } else {
            trace!("Ignoring {} packet on stream channel", command::name(packet.command()));
            self.stats.ignored_packets += 1;
            Ok(None)
        }
    }

    /// Close both sockets and forget the negotiated ids. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let _enter = self.span.enter();
        info!(
            "Closing session {} ({} bytes received)",
            self.session_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            self.stats.bytes_received
        );
        self.control = None;
        self.stream = None;
        self.session_id = None;
        self.connection_id = None;
        self.last_keepalive = None;
        self.state = SessionState::Closed;
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(DmssError::InvalidState { expected: expected.name(), actual: self.state.name() });
        }
        Ok(())
    }

    /// Attach `phase` to a failure and close the session when it is fatal.
    fn check<T>(&mut self, phase: Phase, result: Result<T>) -> Result<T> {
        result.map_err(|error| {
            let error = DmssError::transport(phase, error);
            if error.is_fatal_to_session() {
                warn!(parent: &self.span, "Session failed during {}: {}", phase, error);
                self.close();
            }
            error
        })
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn control_socket(socket: &mut Option<TcpStream>) -> Result<&mut TcpStream> {
    socket.as_mut().ok_or(DmssError::InvalidState { expected: "CONTROL_CONNECTED", actual: "CLOSED" })
}

fn stream_socket(socket: &mut Option<TcpStream>) -> Result<&mut TcpStream> {
    socket.as_mut().ok_or(DmssError::InvalidState { expected: "STREAM_CONNECTED", actual: "CLOSED" })
}

async fn resolve(host: &str, port: u16, policy: &IoPolicy) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = policy.guard(tokio::net::lookup_host((host, port))).await;
    match lookup {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| DmssError::Resolution { host: host.to_string(), source: None }),
        Err(DmssError::Io(source)) => {
            Err(DmssError::Resolution { host: host.to_string(), source: Some(source) })
        }
        Err(other) => Err(other),
    }
}

async fn open_socket(addr: SocketAddr, policy: &IoPolicy) -> Result<TcpStream> {
    let stream = match policy.guard(TcpStream::connect(addr)).await {
        Ok(stream) => stream,
        Err(DmssError::Io(source)) => {
            return Err(DmssError::ConnectFailed { addr: addr.to_string(), source });
        }
        Err(other) => return Err(other),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Discard whatever the device queued on the control channel since the last call.
fn drain_pending(control: &mut TcpStream) -> Result<()> {
    let mut scratch = [0u8; 1024];
    let mut drained = 0usize;
    loop {
        match control.try_read(&mut scratch) {
            Ok(0) => return Err(DmssError::ConnectionClosed),
            Ok(n) => drained += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    if drained > 0 {
        trace!("Drained {} bytes from control channel", drained);
    }
    Ok(())
}
