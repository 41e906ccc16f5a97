//! Session configuration.
//!
//! [`SessionConfig`] holds every parameter the device client recognizes. It can be
//! built in code with the `with_*` setters or loaded from YAML:
//!
//! ```rust
//! use dmss::SessionConfig;
//!
//! let config = SessionConfig::from_yaml_str("host: 10.0.0.20\nchannel: 2\n").unwrap();
//! assert_eq!(config.port, 37777);
//! assert_eq!(config.channel, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::{DmssError, Result};

pub const DEFAULT_HOST: &str = "192.168.1.108";
pub const DEFAULT_PORT: u16 = 37777;
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";
pub const DEFAULT_LATENCY_MS: u32 = 200;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 5;

/// Parameters for one device session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device host name or IP address
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Per-receive timeout in seconds, 0 disables it
    pub timeout_secs: u64,
    pub channel: u32,
    /// Stream variant within the channel (0 = main, 1 = sub)
    pub subchannel: u32,
    /// Constant offset added to every presentation timestamp
    pub latency_ms: u32,
    /// How long a connection waits for stream data before returning anyway
    pub ready_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            timeout_secs: 0,
            channel: 0,
            subchannel: 0,
            latency_ms: DEFAULT_LATENCY_MS,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("channel", &self.channel)
            .field("subchannel", &self.subchannel)
            .field("latency_ms", &self.latency_ms)
            .field("ready_timeout_secs", &self.ready_timeout_secs)
            .finish()
    }
}

impl SessionConfig {
    /// Parse a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SessionConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| DmssError::config(format!("YAML parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DmssError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| DmssError::config(format!("YAML serialization failed: {}", e)))
    }

    /// Reject values the device protocol cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DmssError::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(DmssError::config("port must be non-zero"));
        }
        // The login body separates user and password with "&&".
        if self.username.contains("&&") {
            return Err(DmssError::config("username must not contain '&&'"));
        }
        Ok(())
    }

    /// Receive timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(u64::from(self.latency_ms))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_channel(mut self, channel: u32, subchannel: u32) -> Self {
        self.channel = channel;
        self.subchannel = subchannel;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}
