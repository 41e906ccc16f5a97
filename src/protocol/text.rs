//! CRLF-separated `Key:Value` command bodies carried in `TEXT` packets.

use std::fmt::{self, Display};

/// Capacity of the connection id the device assigns on object negotiation.
pub const CONNECTION_ID_CAPACITY: usize = 15;

const PASSIVE_CONTROL_CONNECTION: &str = "Dahua.Device.Network.ControlConnection.Passive";
const ACK_SUBCHANNEL: &str = "Dahua.Device.Network.ControlConnection.AckSubChannel";
const MONITOR_GENERAL: &str = "Dahua.Device.Network.Monitor.General";

/// An ordered list of `Key:Value` lines terminated by an empty line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextCommand {
    fields: Vec<(String, String)>,
}

impl TextCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: impl Display) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Request a passive control connection from the device.
    pub fn add_object() -> Self {
        Self::new()
            .field("TransactionID", 1)
            .field("Method", "AddObject")
            .field("ParameterName", PASSIVE_CONTROL_CONNECTION)
            .field("ConnectProtocol", 0)
    }

    /// Bind the stream socket to the negotiated session and connection.
    pub fn ack_subchannel(session_id: u32, connection_id: &str) -> Self {
        // The device expects the session id as a signed decimal.
        Self::new()
            .field("TransactionID", 2)
            .field("Method", "GetParameterNames")
            .field("ParameterName", ACK_SUBCHANNEL)
            .field("SessionID", session_id as i32)
            .field("ConnectionID", connection_id)
    }

    /// Start live monitoring of `channel`/`subchannel` on the linked connection.
    pub fn monitor_start(channel: u32, subchannel: u32, connection_id: &str) -> Self {
        Self::new()
            .field("TransactionID", 100)
            .field("Method", "GetParameterNames")
            .field("ParameterName", MONITOR_GENERAL)
            .field("channel", channel)
            .field("state", 1)
            .field("ConnectionID", connection_id)
            .field("stream", subchannel)
    }
}

impl Display for TextCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.fields {
            write!(f, "{}:{}\r\n", key, value)?;
        }
        f.write_str("\r\n")
    }
}

/// A parsed text response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextResponse {
    fields: Vec<(String, String)>,
}

impl TextResponse {
    /// Parse a response body. Lines without a `:` are ignored; parsing stops at
    /// the first NUL byte.
    pub fn parse(body: &[u8]) -> Self {
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let text = String::from_utf8_lossy(&body[..end]);

        let fields = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();

        Self { fields }
    }

    /// Value of the first line with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// `FaultCode` value, if the device sent one.
    pub fn fault_code(&self) -> Option<&str> {
        self.get("FaultCode")
    }

    pub fn is_ok(&self) -> bool {
        self.fault_code().is_some_and(|code| code.starts_with("OK"))
    }

    /// `ConnectionID` value truncated to [`CONNECTION_ID_CAPACITY`].
    pub fn connection_id(&self) -> Option<String> {
        self.get("ConnectionID").map(|id| id.chars().take(CONNECTION_ID_CAPACITY).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
