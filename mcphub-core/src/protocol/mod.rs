//! MCP protocol types used by the hub.
//!
//! - `methods`: method names and the parameter/result types exchanged with
//!   the client (`initialize`, `tools/*`) and with proxies (`proxy/register`,
//!   `tools/register`, forwarded `tools/call`)

mod methods;

pub use methods::*;

/// MCP protocol revision advertised when the client does not ask for one.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
