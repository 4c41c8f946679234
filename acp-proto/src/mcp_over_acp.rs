//! Messages that tunnel MCP traffic inside an ACP connection.
//!
//! The agent (acting as an MCP client) reaches servers that live in the
//! conductor's process by sending `_mcp/connect`, `_mcp/message`, and
//! `_mcp/disconnect` requests up the chain. The transport strips the leading
//! `_` before dispatch, so handlers see `mcp/connect` and friends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const METHOD_MCP_CONNECT: &str = "_mcp/connect";
pub const METHOD_MCP_MESSAGE: &str = "_mcp/message";
pub const METHOD_MCP_DISCONNECT: &str = "_mcp/disconnect";

/// Every wire method in the reserved namespace starts with this.
pub const MCP_OVER_ACP_PREFIX: &str = "_mcp/";

/// True if `method` belongs to the reserved namespace and must be answered locally.
pub fn is_mcp_over_acp(method: &str) -> bool {
    method.starts_with(MCP_OVER_ACP_PREFIX)
}

/// Strip the extension marker from a wire method name.
pub fn strip_extension_prefix(method: &str) -> &str {
    method.strip_prefix('_').unwrap_or(method)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpOverAcpMethod {
    Connect,
    Message,
    Disconnect,
}

impl McpOverAcpMethod {
    /// Parse a method name with the extension marker already stripped.
    pub fn parse(method: &str) -> Result<Self> {
        match method {
            "mcp/connect" => Ok(McpOverAcpMethod::Connect),
            "mcp/message" => Ok(McpOverAcpMethod::Message),
            "mcp/disconnect" => Ok(McpOverAcpMethod::Disconnect),
            other => Err(Error::method_not_found(other)),
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            McpOverAcpMethod::Connect => METHOD_MCP_CONNECT,
            McpOverAcpMethod::Message => METHOD_MCP_MESSAGE,
            McpOverAcpMethod::Disconnect => METHOD_MCP_DISCONNECT,
        }
    }
}

/// Open a connection to the server registered under `acp_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectRequest {
    /// Chosen by the caller, or generated by the handler when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(rename = "acp_url", alias = "url", alias = "acpUrl")]
    pub acp_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectResponse {
    pub connection_id: String,
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// One MCP request carried over an open connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpMessageRequest {
    pub connection_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpDisconnectRequest {
    pub connection_id: String,
}
