//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Only the text subset is supported: binary events and attachments are
//! rejected. A Socket.IO packet travels inside an Engine.IO `message`
//! packet, so an event frame on the wire looks like `42["name",{...}]`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unknown socket packet type {0:?}")]
    UnknownSocketType(char),
    #[error("binary packets are not supported")]
    Binary,
    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl From<CodecError> for queenlive_core::SessionError {
    fn from(e: CodecError) -> Self {
        queenlive_core::SessionError::Protocol(e.to_string())
    }
}

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// Silence allowed before the connection is considered dead:
    /// `pingInterval + pingTimeout`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            // Servers send `open`; clients never need to produce it.
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let rest = chars.as_str();
        Ok(match kind {
            '0' => EnginePacket::Open(
                serde_json::from_str(rest).map_err(|e| CodecError::Malformed(e.to_string()))?,
            ),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(rest.to_string()),
            '3' => EnginePacket::Pong(rest.to_string()),
            '4' => EnginePacket::Message(rest.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => return Err(CodecError::UnknownEngineType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect { nsp: String, data: Option<Value> },
    Disconnect { nsp: String },
    Event { nsp: String, id: Option<u64>, name: String, args: Vec<Value> },
    Ack { nsp: String, id: u64, args: Vec<Value> },
    ConnectError { nsp: String, data: Option<Value> },
}

pub const DEFAULT_NSP: &str = "/";

impl SocketPacket {
    pub fn event(name: &str, payload: Value) -> Self {
        SocketPacket::Event {
            nsp: DEFAULT_NSP.to_string(),
            id: None,
            name: name.to_string(),
            args: vec![payload],
        }
    }

    pub fn connect() -> Self {
        SocketPacket::Connect {
            nsp: DEFAULT_NSP.to_string(),
            data: None,
        }
    }

    /// Encode as a Socket.IO packet (without the Engine.IO `4` prefix).
    pub fn encode(&self) -> String {
        let (kind, nsp) = match self {
            SocketPacket::Connect { nsp, .. } => ('0', nsp),
            SocketPacket::Disconnect { nsp } => ('1', nsp),
            SocketPacket::Event { nsp, .. } => ('2', nsp),
            SocketPacket::Ack { nsp, .. } => ('3', nsp),
            SocketPacket::ConnectError { nsp, .. } => ('4', nsp),
        };

        let mut out = String::new();
        out.push(kind);
        if nsp != DEFAULT_NSP {
            out.push_str(nsp);
            out.push(',');
        }

        match self {
            SocketPacket::Connect { data, .. } | SocketPacket::ConnectError { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            SocketPacket::Disconnect { .. } => {}
            SocketPacket::Event { id, name, args, .. } => {
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                let mut arr = Vec::with_capacity(args.len() + 1);
                arr.push(Value::String(name.clone()));
                arr.extend(args.iter().cloned());
                out.push_str(&Value::Array(arr).to_string());
            }
            SocketPacket::Ack { id, args, .. } => {
                out.push_str(&id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
        }
        out
    }

    /// Encode wrapped in an Engine.IO `message` packet, ready for the socket.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }

    pub fn decode(data: &str) -> Result<Self, CodecError> {
        let mut chars = data.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(CodecError::Binary);
        }

        let nsp = if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    let nsp = rest[..idx].to_string();
                    rest = &rest[idx + 1..];
                    nsp
                }
                None => {
                    let nsp = rest.to_string();
                    rest = "";
                    nsp
                }
            }
        } else {
            DEFAULT_NSP.to_string()
        };

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            let parsed = rest[..digits]
                .parse::<u64>()
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            rest = &rest[digits..];
            Some(parsed)
        } else {
            None
        };

        let json = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest).map_err(|e| CodecError::Malformed(e.to_string()))?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { nsp, data: json }),
            '1' => Ok(SocketPacket::Disconnect { nsp }),
            '2' => {
                let Some(Value::Array(mut items)) = json else {
                    return Err(CodecError::Malformed("event payload must be an array".into()));
                };
                if items.is_empty() {
                    return Err(CodecError::Malformed("event without a name".into()));
                }
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    other => return Err(CodecError::Malformed(format!("event name must be a string, got {other}"))),
                };
                Ok(SocketPacket::Event { nsp, id, name, args: items })
            }
            '3' => {
                let id = id.ok_or_else(|| CodecError::Malformed("ack without id".into()))?;
                let args = match json {
                    Some(Value::Array(items)) => items,
                    None => Vec::new(),
                    Some(other) => return Err(CodecError::Malformed(format!("ack payload must be an array, got {other}"))),
                };
                Ok(SocketPacket::Ack { nsp, id, args })
            }
            '4' => Ok(SocketPacket::ConnectError { nsp, data: json }),
            other => Err(CodecError::UnknownSocketType(other)),
        }
    }
}

/// Turn an `http(s)://host[:port][/prefix]` base URL into the Engine.IO
/// WebSocket endpoint.
pub fn websocket_endpoint(base: &str) -> Result<String, CodecError> {
    let trimmed = base.trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| CodecError::Malformed(format!("not a URL: {base}")))?;
    let ws_scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(CodecError::Malformed(format!("unsupported scheme: {other}"))),
    };
    Ok(format!("{ws_scheme}://{rest}/socket.io/?EIO=4&transport=websocket"))
}
