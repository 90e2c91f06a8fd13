//! Error handling for the hub's JSON-RPC surface.
//!
//! - `jsonrpc`: the wire-level JSON-RPC 2.0 error object and standard codes
//! - [`McpError`]: routing and protocol failures surfaced to a single caller
//!
//! Layer-specific errors (framing, transport, registry, config) live next to
//! the code that raises them and convert into [`McpError`] where they reach a
//! caller.

pub mod jsonrpc;

pub use jsonrpc::JsonRpcError;

use serde_json::Value;
use thiserror::Error;

/// Failures reported back to the peer that issued a request.
///
/// None of these are fatal to the transport: the offending request is
/// answered with the matching JSON-RPC error and the connection stays open.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum McpError {
    /// Invalid JSON.
    #[error("Parse error: {details}")]
    ParseError { details: String },

    /// Not a valid JSON-RPC 2.0 request object.
    #[error("Invalid request: {details}")]
    InvalidRequest { details: String },

    /// The method does not exist, or is not available in the current state.
    #[error("Method '{method}' not found")]
    MethodNotFound { method: String },

    /// The method parameters are invalid.
    #[error("Invalid params: {details}")]
    InvalidParams {
        details: String,
        /// Optional structured detail, e.g. the list of rejected tools.
        data: Option<Value>,
    },

    /// The request could not be routed or completed.
    #[error("Internal error: {details}")]
    InternalError { details: String },
}

impl McpError {
    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::InvalidParams {
            details: details.into(),
            data: None,
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::InternalError {
            details: details.into(),
        }
    }

    /// Maps the error to its JSON-RPC 2.0 error code.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            Self::ParseError { .. } => jsonrpc::PARSE_ERROR,
            Self::InvalidRequest { .. } => jsonrpc::INVALID_REQUEST,
            Self::MethodNotFound { .. } => jsonrpc::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => jsonrpc::INVALID_PARAMS,
            Self::InternalError { .. } => jsonrpc::INTERNAL_ERROR,
        }
    }

    /// Short machine-readable name, used as a structured log field.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Convert to the wire error object.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let error = JsonRpcError::new(self.to_jsonrpc_code(), self.to_string());
        match self {
            Self::InvalidParams {
                data: Some(data), ..
            } => error.with_data(data.clone()),
            _ => error,
        }
    }
}

impl From<McpError> for JsonRpcError {
    fn from(err: McpError) -> Self {
        err.to_jsonrpc_error()
    }
}
