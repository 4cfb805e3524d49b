use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Event names with a fixed meaning. Any other event name is a command kind.
pub mod events {
    pub const JOIN: &str = "join";
    pub const ADMIN_JOIN: &str = "adminJoin";
    pub const REQUEST: &str = "request";
    pub const SEND_COMMAND: &str = "sendCommand";
    pub const REQUEST_RESULT: &str = "requestResult";
    pub const DISCONNECT_CLIENT: &str = "disconnectClient";
    pub const LOG: &str = "log";

    pub fn is_reserved(event: &str) -> bool {
        matches!(
            event,
            JOIN | ADMIN_JOIN | REQUEST | SEND_COMMAND | REQUEST_RESULT | DISCONNECT_CLIENT | LOG
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(&self) -> bool {
        self.0 <= CURRENT_PROTOCOL_VERSION
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// One named event on the wire. Text frames carry exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            event: event.into(),
            data,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Serializes `value` as the frame data; unserializable values become `null`.
    pub fn from_serializable<T: Serialize>(event: impl Into<String>, value: &T) -> Self {
        Self::new(event, serde_json::to_value(value).unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &Frame, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<Frame, FrameError> {
    let mut raw = bytes;
    while let Some((last, rest)) = raw.split_last() {
        if !last.is_ascii_whitespace() {
            break;
        }
        raw = rest;
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let frame: Frame =
        serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    if frame.event.trim().is_empty() {
        return Err(FrameError::Decode("missing event name".to_string()));
    }
    Ok(frame)
}
