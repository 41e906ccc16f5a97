//! Error types for the DMSS client.
//!
//! Every fallible operation in this crate returns [`DmssError`]. Errors carry
//! structured context (the handshake phase, offending sizes, device fault codes)
//! so callers can decide whether to restart the session or give up.
//!
//! ## Error Categories
//!
//! - **Session errors**: name resolution, connect, authentication and protocol
//!   faults during the control-channel handshake. These are fatal to the session.
//! - **Framing errors**: malformed prologues and corrupted DHAV packets. The
//!   reassembler drops its buffer and keeps going; the session survives.
//! - **I/O errors**: timeouts, closed connections and raw socket failures. All of
//!   them close the session; timeouts are retryable by starting a new one.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use dmss::DmssError;
//! use std::time::Duration;
//!
//! let error = DmssError::Timeout { duration: Duration::from_secs(5) };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! Socket failures raised while driving the handshake are wrapped in
//! [`DmssError::Transport`] together with the [`Phase`] that failed:
//!
//! ```rust
//! use dmss::{DmssError, Phase};
//!
//! let error = DmssError::transport(Phase::Login, DmssError::ConnectionClosed);
//! assert!(error.is_connection_closed());
//! assert_eq!(error.phase(), Some(Phase::Login));
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for DMSS operations.
pub type Result<T, E = DmssError> = std::result::Result<T, E>;

/// Handshake phase a transport failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Resolve,
    ControlConnect,
    Login,
    WaitReady,
    AddObject,
    StreamConnect,
    LinkSubchannel,
    StartStream,
    KeepAlive,
    Streaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolve => "resolve",
            Phase::ControlConnect => "control connect",
            Phase::Login => "login",
            Phase::WaitReady => "wait ready",
            Phase::AddObject => "add object",
            Phase::StreamConnect => "stream connect",
            Phase::LinkSubchannel => "link subchannel",
            Phase::StartStream => "start stream",
            Phase::KeepAlive => "keep-alive",
            Phase::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Main error type for DMSS operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DmssError {
    #[error("Failed to resolve host '{host}'")]
    Resolution {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to connect to {addr}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device rejected credentials for user '{user}'")]
    Authentication { user: String },

    #[error("Protocol error during {phase}: {details}")]
    Protocol { phase: Phase, details: String },

    #[error("Malformed header: need {needed} bytes, got {available}")]
    MalformedHeader { needed: usize, available: usize },

    #[error("Declared body length {declared} exceeds limit of {limit} bytes")]
    BodyTooLarge { declared: usize, limit: usize },

    #[error("Corrupted DHAV packet: {reason}")]
    CorruptedPacket { reason: String },

    #[error("Encoding error: packet needs {needed} bytes, buffer holds {capacity}")]
    Encoding { needed: usize, capacity: usize },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState { expected: &'static str, actual: &'static str },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("Capture file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport failure during {phase}")]
    Transport {
        phase: Phase,
        #[source]
        source: Box<DmssError>,
    },
}

impl DmssError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DmssError::Resolution { .. } => true,
            DmssError::ConnectFailed { .. } => true,
            DmssError::Timeout { .. } => true,
            DmssError::Transport { source, .. } => source.is_retryable(),
            DmssError::Authentication { .. } => false,
            DmssError::Protocol { .. } => false,
            DmssError::MalformedHeader { .. } => false,
            DmssError::BodyTooLarge { .. } => false,
            DmssError::CorruptedPacket { .. } => false,
            DmssError::Encoding { .. } => false,
            DmssError::ConnectionClosed => false,
            DmssError::Io(_) => false,
            DmssError::Cancelled => false,
            DmssError::InvalidState { .. } => false,
            DmssError::Config { .. } => false,
            DmssError::File { .. } => false,
        }
    }

    /// Returns whether the session that produced this error must be torn down.
    ///
    /// Framing errors leave the session usable. A timeout can strike in the
    /// middle of a packet, after which the socket is no longer aligned on a
    /// prologue, so it counts as fatal like every other socket failure.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            DmssError::CorruptedPacket { .. } | DmssError::MalformedHeader { .. } => false,
            DmssError::Transport { source, .. } => source.is_fatal_to_session(),
            _ => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            DmssError::Resolution { .. } => vec![
                "Check the host name or use a literal IP address",
                "Verify DNS configuration",
            ],
            DmssError::ConnectFailed { .. } => vec![
                "Ensure the device is powered and reachable",
                "Check the port (default 37777)",
                "Verify no firewall blocks the connection",
            ],
            DmssError::Authentication { .. } => vec![
                "Check username and password",
                "Make sure the account is not locked on the device",
            ],
            DmssError::Protocol { .. } => vec![
                "Verify the channel and subchannel exist on the device",
                "Check the device firmware supports this protocol",
            ],
            DmssError::MalformedHeader { .. } | DmssError::CorruptedPacket { .. } => vec![
                "Transient corruption is skipped automatically",
                "Persistent corruption indicates an unsupported stream format",
            ],
            DmssError::BodyTooLarge { .. } => vec![
                "The stream lost framing; restart the session",
                "Check the port belongs to a DMSS device",
            ],
            DmssError::Encoding { .. } => vec!["Provide a larger output buffer"],
            DmssError::Timeout { .. } => vec![
                "Increase the timeout",
                "Check network latency to the device",
                "Restart the session",
            ],
            DmssError::ConnectionClosed => vec![
                "Restart the session",
                "Check the device connection limit",
            ],
            DmssError::Io(_) => vec!["Check network connectivity", "Restart the session"],
            DmssError::Cancelled => vec!["Start a new session"],
            DmssError::InvalidState { .. } => vec!["Run the handshake steps in order"],
            DmssError::Config { .. } => vec!["Fix the configuration value named in the error"],
            DmssError::File { .. } => vec![
                "Check the capture file exists and is readable",
                "Check file permissions",
            ],
            DmssError::Transport { source, .. } => source.recovery_suggestions(),
        }
    }

    /// Phase of the handshake the error is attached to, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            DmssError::Transport { phase, .. } | DmssError::Protocol { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Returns the innermost error, looking through [`DmssError::Transport`].
    pub fn root(&self) -> &DmssError {
        match self {
            DmssError::Transport { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), DmssError::Timeout { .. })
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self.root(), DmssError::ConnectionClosed)
    }

    /// Wrap a socket-level error with the phase it happened in.
    ///
    /// Errors that already carry a phase are returned unchanged.
    pub fn transport(phase: Phase, source: DmssError) -> Self {
        match source {
            already @ (DmssError::Transport { .. } | DmssError::Protocol { .. }) => already,
            DmssError::Authentication { .. } | DmssError::Cancelled => source,
            other => DmssError::Transport { phase, source: Box::new(other) },
        }
    }

    /// Create a protocol error for an unexpected device response.
    pub fn protocol(phase: Phase, details: impl Into<String>) -> Self {
        DmssError::Protocol { phase, details: details.into() }
    }

    /// Create a corrupted packet error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        DmssError::CorruptedPacket { reason: reason.into() }
    }

    /// Create a configuration error.
    pub fn config(details: impl Into<String>) -> Self {
        DmssError::Config { details: details.into() }
    }

    /// Create a capture file error.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        DmssError::File { path, source }
    }
}
