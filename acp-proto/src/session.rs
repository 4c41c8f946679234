//! Handshake and session-configuration shapes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_LOAD: &str = "session/load";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";

/// The parts of the `initialize` params the conductor looks at.
///
/// Anything else the client sends is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,

    /// Entries that do not look like a server config are skipped, and `null`
    /// is an empty list. The conductor forwards the raw params either way.
    #[serde(
        default,
        deserialize_with = "lenient_servers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub mcp_servers: Vec<McpServerConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitializeRequest {
    /// Parse the `params` of an `initialize` request. Absent params are an empty request.
    pub fn from_params(params: Option<&Value>) -> crate::Result<Self> {
        match params {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(params) => crate::util::json_cast(params),
        }
    }

    /// True when the client declared the capability at `path` (e.g. `["fs", "readTextFile"]`).
    pub fn has_capability(&self, path: &[&str]) -> bool {
        let mut cursor = match &self.capabilities {
            Some(capabilities) => capabilities,
            None => return false,
        };
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => return false,
            }
        }
        !matches!(cursor, Value::Null | Value::Bool(false))
    }
}

fn lenient_servers<'de, D>(deserializer: D) -> Result<Vec<McpServerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match Value::deserialize(deserializer)? {
        Value::Array(entries) => entries,
        Value::Null => return Ok(Vec::new()),
        other => {
            tracing::warn!(mcp_servers = %other, "ignoring `mcpServers` that is not a list");
            return Ok(Vec::new());
        }
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(config) => Some(config),
            Err(error) => {
                tracing::warn!(%entry, %error, "ignoring unrecognized MCP server entry");
                None
            }
        })
        .collect())
}

/// An MCP server entry as it appears in session configuration.
///
/// Stdio servers carry no `type`; their `command`, `args`, and `env` land in
/// `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl McpServerConfig {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: Some("http".to_string()),
            name: name.into(),
            url: Some(url.into()),
            extra: Map::new(),
        }
    }

    /// True if the url uses the local `acp:` scheme.
    pub fn is_acp(&self) -> bool {
        self.url.as_deref().is_some_and(|url| url.starts_with("acp:"))
    }
}

/// Pull the `sessionId` string out of a params or result object.
pub fn session_id_of(value: Option<&Value>) -> Option<String> {
    value?
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_initialize_fields_survive() {
        let params = json!({
            "protocolVersion": 1,
            "clientInfo": {"name": "zed"},
            "capabilities": {"fs": {"readTextFile": true}},
        });
        let request = InitializeRequest::from_params(Some(&params)).unwrap();
        assert!(request.has_capability(&["fs", "readTextFile"]));
        assert!(!request.has_capability(&["terminal"]));
        assert_eq!(serde_json::to_value(&request).unwrap(), params);
    }

    #[test]
    fn missing_params_are_empty() {
        let request = InitializeRequest::from_params(None).unwrap();
        assert!(request.mcp_servers.is_empty());
        assert!(request.client_info.is_none());
    }

    #[test]
    fn null_server_list_is_empty() {
        let params = json!({"mcpServers": null, "clientInfo": {"name": "zed"}});
        let request = InitializeRequest::from_params(Some(&params)).unwrap();
        assert!(request.mcp_servers.is_empty());
        assert_eq!(request.client_info, Some(json!({"name": "zed"})));
    }

    #[test]
    fn stdio_servers_and_odd_entries_are_tolerated() {
        let params = json!({"mcpServers": [
            {"name": "fs", "command": "mcp-fs", "args": [], "env": []},
            42,
            {"type": "http", "name": "docs", "url": "http://localhost:9/mcp"},
        ]});
        let request = InitializeRequest::from_params(Some(&params)).unwrap();
        let names: Vec<_> = request.mcp_servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["fs", "docs"]);
        assert_eq!(request.mcp_servers[0].kind, None);
        assert_eq!(request.mcp_servers[0].extra["command"], "mcp-fs");
        assert_eq!(request.mcp_servers[1].kind.as_deref(), Some("http"));
    }

    #[test]
    fn server_config_shape() {
        let config = McpServerConfig::http("tools", "acp:1234");
        assert!(config.is_acp());
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"type": "http", "name": "tools", "url": "acp:1234"})
        );
    }
}
