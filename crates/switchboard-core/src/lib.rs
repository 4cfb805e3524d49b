pub mod error;
pub mod wire;

pub use error::RelayError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_LOG_CAPACITY: usize = 2000;

const AGENT_ID_KEYS: [&str; 4] = ["agentId", "id", "deviceId", "ID"];
const REQUEST_ID_KEYS: [&str; 2] = ["requestId", "request_id"];

/// Last-known state of one agent. Created on first join, merged afterwards,
/// and only dropped by the inactivity sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub transport_handle: Option<String>,
    pub last_seen: i64,
    #[serde(default)]
    pub last_join: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location: Option<LastLocation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payloads: BTreeMap<String, StoredPayload>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            attributes: Map::new(),
            transport_handle: None,
            last_seen: now_ms,
            last_join: None,
            last_location: None,
            payloads: BTreeMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport_handle.is_some()
    }

    /// Key-wise merge: supplied keys overwrite, absent keys are preserved.
    pub fn merge_attributes(&mut self, attributes: Map<String, Value>) {
        for (key, value) in attributes {
            if !value.is_null() {
                self.attributes.insert(key, value);
            }
        }
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Inline payload stored for `field`, if it was small enough to keep inline.
    pub fn payload(&self, field: &str) -> Option<&Value> {
        match self.payloads.get(field)? {
            StoredPayload::Inline { value, .. } => Some(value),
            StoredPayload::Blob { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub ts: i64,
}

impl LastLocation {
    /// Reads `{lat, lon, accuracy?}`; both coordinates must be numbers.
    pub fn from_reply(data: &Value, ts: i64) -> Option<Self> {
        let lat = data.get("lat").and_then(Value::as_f64)?;
        let lon = data.get("lon").and_then(Value::as_f64)?;
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        Some(Self {
            lat,
            lon,
            accuracy: data.get("accuracy").and_then(Value::as_f64),
            address: None,
            ts,
        })
    }
}

/// Per-kind payload retained on a record. Large payloads live in the blob
/// store and the record only keeps a reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "storage", rename_all = "camelCase")]
pub enum StoredPayload {
    #[serde(rename_all = "camelCase")]
    Inline { value: Value, updated_at: i64 },
    #[serde(rename_all = "camelCase")]
    Blob {
        blob_id: String,
        size_bytes: usize,
        updated_at: i64,
    },
}

/// Record field that receives replies of `kind`: `getInventory` -> `inventory`.
pub fn field_name(kind: &str) -> String {
    let trimmed = kind.trim();
    let rest = match trimmed.strip_prefix("get") {
        Some(rest) if rest.chars().next().is_some_and(|c| c.is_ascii_uppercase()) => rest,
        _ => trimmed,
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub ts: i64,
    pub level: LogLevel,
    pub msg: String,
}

/// `join` data after alias normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinPayload {
    pub agent_id: Option<String>,
    pub attributes: Map<String, Value>,
}

impl JoinPayload {
    /// Never fails: non-object data is treated as an empty join.
    pub fn from_value(value: Value) -> Self {
        let mut object = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let agent_id = take_agent_id(&mut object);
        object.remove("data");
        alias_key(&mut object, "userAgent", "model");
        alias_key(&mut object, "ua", "model");
        alias_key(&mut object, "lang", "language");
        object.retain(|_, value| !value.is_null());
        Self {
            agent_id,
            attributes: object,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub wait_for_response: Option<bool>,
    #[serde(default)]
    pub high_accuracy: Option<bool>,
}

/// Controller command as sent in `request` or `sendCommand`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default, alias = "agentId", alias = "target")]
    pub to: Option<String>,
    #[serde(default, alias = "command")]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub options: RequestOptions,
}

impl CommandRequest {
    /// Accepts an object or a JSON-encoded string holding one.
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        let value = match value {
            Value::String(text) => serde_json::from_str::<Value>(&text)
                .map_err(|err| RelayError::InvalidRequest(format!("unparseable request: {err}")))?,
            other => other,
        };
        if !value.is_object() {
            return Err(RelayError::InvalidRequest(
                "request must be an object".to_string(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|err| RelayError::InvalidRequest(format!("invalid request: {err}")))
    }

    /// Best-effort `to` and `action` from a raw request, so a rejection can
    /// still name the command even when the rest of it does not parse.
    pub fn identify(value: &Value) -> (Option<String>, Option<String>) {
        let decoded;
        let object = match value {
            Value::String(text) => {
                decoded = serde_json::from_str::<Value>(text).ok();
                decoded.as_ref().and_then(Value::as_object)
            }
            other => other.as_object(),
        };
        let Some(object) = object else {
            return (None, None);
        };
        let pick = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| object.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        (pick(&["to", "agentId", "target"]), pick(&["action", "command"]))
    }

    pub fn target(&self) -> Option<&str> {
        self.to.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn kind(&self) -> Option<&str> {
        self.action.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Outcome reported to the issuing controller as `requestResult`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestResult {
    pub to: Option<String>,
    pub action: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RequestResult {
    pub fn success(to: &str, action: &str, result: Value) -> Self {
        Self {
            to: Some(to.to_string()),
            action: Some(action.to_string()),
            ok: true,
            result: Some(result),
            reason: None,
            message: None,
        }
    }

    pub fn sent(to: &str, action: &str) -> Self {
        Self {
            to: Some(to.to_string()),
            action: Some(action.to_string()),
            ok: true,
            result: None,
            reason: None,
            message: Some("sent".to_string()),
        }
    }

    pub fn failure(to: Option<&str>, action: Option<&str>, error: &RelayError) -> Self {
        Self {
            to: to.map(str::to_string),
            action: action.map(str::to_string),
            ok: false,
            result: None,
            reason: Some(error.code().to_string()),
            message: Some(error.to_string()),
        }
    }
}

/// Inbound agent event split into its parts. `data` is the payload's `data`
/// member when present, otherwise the whole payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAgentEvent {
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub data: Value,
}

impl RawAgentEvent {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut object) => {
                let agent_id = take_agent_id(&mut object);
                let request_id = REQUEST_ID_KEYS
                    .iter()
                    .find_map(|key| object.remove(*key).as_ref().and_then(id_from_value));
                let data = match object.remove("data") {
                    Some(data) => data,
                    None => Value::Object(object),
                };
                Self {
                    agent_id,
                    request_id,
                    data,
                }
            }
            other => Self {
                agent_id: None,
                request_id: None,
                data: other,
            },
        }
    }
}

/// Normalized agent event as fanned out to controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub agent_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub socket_ref: String,
}

fn take_agent_id(object: &mut Map<String, Value>) -> Option<String> {
    let mut found = None;
    for key in AGENT_ID_KEYS {
        if let Some(value) = object.remove(key) {
            if found.is_none() {
                found = id_from_value(&value);
            }
        }
    }
    found
}

/// Ids may arrive as strings or numbers.
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn alias_key(object: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = object.remove(from) {
        let missing = object.get(to).map_or(true, Value::is_null);
        if missing && !value.is_null() {
            object.insert(to.to_string(), value);
        }
    }
}
