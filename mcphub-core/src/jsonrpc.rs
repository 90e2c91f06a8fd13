//! JSON-RPC 2.0 message classification, decoding and encoding.
//!
//! Classification is a cheap structural look at a parsed JSON value: it
//! validates the `"jsonrpc": "2.0"` envelope and decides the message nature
//! from the presence of `method` and `id`. Decoding then applies the strict
//! per-nature schema (no unknown members, `params` must be structured,
//! exactly one of `result`/`error`).
//!
//! ```text
//! {"jsonrpc":"2.0","method":"m","id":1}       -> Request
//! {"jsonrpc":"2.0","method":"m"}              -> Notification
//! {"jsonrpc":"2.0","method":"m","id":null}    -> Notification
//! {"jsonrpc":"2.0","result":{},"id":1}        -> Response
//! [ ... ]                                     -> Batch (rejected by the transport)
//! ```
//!
//! Encoding always writes the fixed version string. An absent id is written
//! as JSON `null`, which the classifier reads back as "no id".

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{JsonRpcError, McpError};

/// The only protocol version accepted on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

// ─────────────────────────────────────────────────────────────────────────────
// Request IDs
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC request identifier.
///
/// IDs are local to one JSON-RPC transport. Equality is by tag and value, so
/// `1` and `"1"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Number(n) => serializer.serialize_i64(*n),
            RequestId::String(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RequestId::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl RequestId {
    /// Parse an id from a JSON value. Floats, booleans, arrays, objects and
    /// null are rejected.
    pub fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RequestId::Number)
                .ok_or("JSON-RPC ID must be an integer, not a float"),
            Value::String(s) => Ok(RequestId::String(s.clone())),
            Value::Null => Err("JSON-RPC ID must not be null"),
            _ => Err("JSON-RPC ID must be a string or an integer"),
        }
    }
}

/// Treat `"id": null` the same as an absent id.
fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<RequestId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        Ok(None)
    } else {
        RequestId::from_value(&value)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

/// Keep a present-but-null member as `Some(Value::Null)`.
///
/// Plain `Option<Value>` collapses `"result": null` into `None`, which would
/// make a legitimate null result indistinguishable from a missing one.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Method parameters: positional array or named object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Validate a raw `params` member. `null` counts as absent.
    pub fn from_value(value: Value) -> Result<Option<Self>, ClassifyError> {
        match value {
            Value::Null => Ok(None),
            Value::Array(items) => Ok(Some(Params::Positional(items))),
            Value::Object(map) => Ok(Some(Params::Named(map))),
            other => Err(ClassifyError::InvalidParams {
                reason: format!(
                    "params must be an array or an object, got {}",
                    json_type_name(&other)
                ),
            }),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Params::Positional(items) => Value::Array(items),
            Params::Named(map) => Value::Object(map),
        }
    }
}

impl From<Value> for Params {
    /// Structured values map to their variant; scalars are wrapped as a single
    /// positional argument.
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Params::Positional(items),
            Value::Object(map) => Params::Named(map),
            other => Params::Positional(vec![other]),
        }
    }
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Params>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Deserialize the params into `T`, reporting failures as invalid params.
    ///
    /// Absent params are presented to `T` as an empty object so that structs
    /// whose members are all optional still decode.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, McpError> {
        let value = self
            .params
            .clone()
            .map(Params::into_value)
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(value).map_err(|e| McpError::invalid_params(e.to_string()))
    }
}

/// A fire-and-forget call.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Params>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Outcome carried by a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

/// A reply to an earlier request. Never carries a method on the wire.
///
/// `id` is `None` only for error replies to messages whose id could not be
/// determined (e.g. unparsable JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

/// Every message nature the classifier can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nature {
    Request,
    Notification,
    Response,
    Batch,
}

impl fmt::Display for Nature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Nature::Request => "request",
            Nature::Notification => "notification",
            Nature::Response => "response",
            Nature::Batch => "batch",
        })
    }
}

/// A decoded single (non-batch) message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn nature(&self) -> Nature {
        match self {
            Message::Request(_) => Nature::Request,
            Message::Notification(_) => Nature::Notification,
            Message::Response(_) => Nature::Response,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while classifying or decoding a message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    /// The bytes are not valid JSON.
    #[error("malformed JSON: {reason}")]
    Malformed { reason: String },

    /// The `jsonrpc` member is absent.
    #[error("missing jsonrpc field")]
    MissingVersion,

    /// The `jsonrpc` member is present but is not `"2.0"`.
    #[error("invalid jsonrpc version: expected \"2.0\", got {found}")]
    InvalidVersion { found: String },

    /// Structurally invalid message (wrong top-level type, unknown members,
    /// bad id, missing or conflicting `result`/`error`).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// `params` is neither an array nor an object.
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    /// The message is a batch, which this protocol profile does not support.
    #[error("batch requests are not supported")]
    Batch,
}

impl From<ClassifyError> for McpError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Malformed { reason } => McpError::ParseError { details: reason },
            ClassifyError::InvalidParams { reason } => McpError::invalid_params(reason),
            other => McpError::InvalidRequest {
                details: other.to_string(),
            },
        }
    }
}

impl ClassifyError {
    fn invalid(reason: impl Into<String>) -> Self {
        ClassifyError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Parse `raw` as JSON and classify it.
///
/// Returns the nature together with the parsed value so callers can decode
/// without parsing twice.
///
/// # Errors
///
/// - [`ClassifyError::Malformed`] when `raw` is not JSON
/// - [`ClassifyError::MissingVersion`] / [`ClassifyError::InvalidVersion`]
///   for a bad envelope
/// - [`ClassifyError::InvalidRequest`] for anything that is neither an object
///   nor an array, or a response-shaped object without `result`/`error`
pub fn classify(raw: &[u8]) -> Result<(Nature, Value), ClassifyError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| ClassifyError::Malformed {
        reason: e.to_string(),
    })?;
    let nature = classify_value(&value)?;
    Ok((nature, value))
}

/// Classify an already-parsed JSON value.
pub fn classify_value(value: &Value) -> Result<Nature, ClassifyError> {
    let obj = match value {
        Value::Array(_) => return Ok(Nature::Batch),
        Value::Object(obj) => obj,
        other => {
            return Err(ClassifyError::invalid(format!(
                "expected a JSON object, got {}",
                json_type_name(other)
            )));
        }
    };

    check_version(obj.get("jsonrpc"))?;

    if obj.contains_key("method") {
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        return Ok(if has_id {
            Nature::Request
        } else {
            Nature::Notification
        });
    }

    match (obj.contains_key("result"), obj.contains_key("error")) {
        (true, true) => Err(ClassifyError::invalid(
            "response must not contain both result and error",
        )),
        (false, false) => Err(ClassifyError::invalid(
            "message has neither method nor result/error",
        )),
        _ => Ok(Nature::Response),
    }
}

fn check_version(version: Option<&Value>) -> Result<(), ClassifyError> {
    match version {
        None => Err(ClassifyError::MissingVersion),
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(()),
        Some(other) => Err(ClassifyError::InvalidVersion {
            found: other.to_string(),
        }),
    }
}

/// Best-effort id extraction, used to address error replies to messages that
/// failed strict decoding.
pub fn extract_id(value: &Value) -> Option<RequestId> {
    value
        .get("id")
        .and_then(|id| RequestId::from_value(id).ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Wire shape shared by all natures. Unknown members are rejected here;
/// per-nature checks reject members that belong to another nature.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMessage {
    jsonrpc: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

impl RawMessage {
    fn from_value(value: Value) -> Result<Self, ClassifyError> {
        if !value.is_object() {
            return Err(ClassifyError::invalid(format!(
                "expected a JSON object, got {}",
                json_type_name(&value)
            )));
        }
        let raw: RawMessage =
            serde_json::from_value(value).map_err(|e| ClassifyError::invalid(e.to_string()))?;
        check_version(raw.jsonrpc.as_ref())?;
        Ok(raw)
    }

    fn reject_response_members(&self) -> Result<(), ClassifyError> {
        if self.result.is_some() || self.error.is_some() {
            return Err(ClassifyError::invalid(
                "a call must not contain result or error",
            ));
        }
        Ok(())
    }
}

/// Decode a request. The id must be present and non-null.
pub fn parse_request(value: Value) -> Result<Request, ClassifyError> {
    let raw = RawMessage::from_value(value)?;
    raw.reject_response_members()?;
    let method = raw
        .method
        .ok_or_else(|| ClassifyError::invalid("missing method"))?;
    let id = raw
        .id
        .ok_or_else(|| ClassifyError::invalid("request is missing an id"))?;
    let params = raw.params.map(Params::from_value).transpose()?.flatten();
    Ok(Request { id, method, params })
}

/// Decode a notification. An id, if present, must be null.
pub fn parse_notification(value: Value) -> Result<Notification, ClassifyError> {
    let raw = RawMessage::from_value(value)?;
    raw.reject_response_members()?;
    if raw.id.is_some() {
        return Err(ClassifyError::invalid("notification must not carry an id"));
    }
    let method = raw
        .method
        .ok_or_else(|| ClassifyError::invalid("missing method"))?;
    let params = raw.params.map(Params::from_value).transpose()?.flatten();
    Ok(Notification { method, params })
}

/// Decode a response: exactly one of `result`/`error`, no `method`/`params`.
pub fn parse_response(value: Value) -> Result<Response, ClassifyError> {
    let raw = RawMessage::from_value(value)?;
    if raw.method.is_some() || raw.params.is_some() {
        return Err(ClassifyError::invalid(
            "response must not contain method or params",
        ));
    }
    let outcome = match (raw.result, raw.error) {
        (Some(result), None) => Outcome::Result(result),
        (None, Some(error)) => Outcome::Error(error),
        (Some(_), Some(_)) => {
            return Err(ClassifyError::invalid(
                "response must not contain both result and error",
            ));
        }
        (None, None) => {
            return Err(ClassifyError::invalid(
                "response must contain result or error",
            ));
        }
    };
    Ok(Response {
        id: raw.id,
        outcome,
    })
}

/// Classify and decode a single message. Batches are an error.
pub fn decode(raw: &[u8]) -> Result<Message, ClassifyError> {
    let (nature, value) = classify(raw)?;
    match nature {
        Nature::Request => parse_request(value).map(Message::Request),
        Nature::Notification => parse_notification(value).map(Message::Notification),
        Nature::Response => parse_response(value).map(Message::Response),
        Nature::Batch => Err(ClassifyError::Batch),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("method", &self.method)?;
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("method", &self.method)?;
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        map.serialize_entry("id", &Value::Null)?;
        map.end()
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match &self.outcome {
            Outcome::Result(result) => map.serialize_entry("result", result)?,
            Outcome::Error(error) => map.serialize_entry("error", error)?,
        }
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(r) => r.serialize(serializer),
            Message::Notification(n) => n.serialize(serializer),
            Message::Response(r) => r.serialize(serializer),
        }
    }
}

/// Encode a message as compact JSON (never contains a raw newline).
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
