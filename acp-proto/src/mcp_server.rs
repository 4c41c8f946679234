//! An in-process MCP server that answers the tunnelled MCP methods.
//!
//! Servers are built once with [`McpServer::builder`] and are immutable
//! afterwards. Each server gets a fresh id, which is also its `acp:` locator:
//! two servers with the same name are still distinct.
//!
//! ```ignore
//! let server = McpServer::builder("calculator")
//!     .instructions("Arithmetic helpers")
//!     .tool_fn("add", "Add two numbers", |input: AddInput, _cx| async move {
//!         Ok(AddOutput { sum: input.a + input.b })
//!     })
//!     .build();
//! ```

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use anyhow::Context as _;
use futures::{FutureExt as _, future::BoxFuture};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{Error, Result, SchemaOf, ToJsonSchema, session::McpServerConfig, util::parse_params};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

type ToolHandler =
    Arc<dyn Fn(Value, McpContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// What a tool handler knows about the call it is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpContext {
    pub connection_id: String,
    pub session_id: Option<String>,
}

/// A tool as registered on a server.
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    handler: ToolHandler,
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl RegisteredTool {
    /// The entry advertised by `tools/list`. The output schema is not included.
    fn listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

#[derive(Debug, Clone)]
pub struct McpServer {
    id: Uuid,
    name: String,
    instructions: Option<String>,
    tools: Arc<[RegisteredTool]>,
}

/// The MCP methods a server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum McpMethod {
    Initialize,
    Initialized,
    Ping,
    ToolsList,
    ToolsCall,
}

impl McpMethod {
    fn parse(method: &str) -> Option<Self> {
        Some(match method {
            "initialize" => McpMethod::Initialize,
            "notifications/initialized" => McpMethod::Initialized,
            "ping" => McpMethod::Ping,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            _ => return None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

impl McpServer {
    pub fn builder(name: impl Into<String>) -> McpServerBuilder {
        McpServerBuilder {
            name: name.into(),
            instructions: None,
            tools: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn acp_url(&self) -> String {
        format!("acp:{}", self.id)
    }

    pub fn instructions(&self) -> String {
        self.instructions.clone().unwrap_or_else(|| {
            format!("Tools from the `{}` server are available to this session.", self.name)
        })
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    /// The session configuration entry that points an agent at this server.
    pub fn session_config(&self) -> McpServerConfig {
        McpServerConfig::http(self.name.clone(), self.acp_url())
    }

    /// The `tools/list` entries, in registration order.
    pub fn tool_list(&self) -> Vec<Value> {
        self.tools.iter().map(RegisteredTool::listing).collect()
    }

    pub fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "serverInfo": {
                "name": self.name,
                "version": self.version(),
            },
            "capabilities": { "tools": {} },
            "instructions": self.instructions(),
        })
    }

    /// Answer one MCP request.
    ///
    /// Tool failures come back as `Ok` results with `isError: true`; only an
    /// unknown method or malformed `tools/call` params produce `Err`.
    pub async fn handle(&self, method: &str, params: Option<Value>, cx: McpContext) -> Result<Value> {
        let Some(mcp_method) = McpMethod::parse(method) else {
            return Err(Error::method_not_found(method));
        };

        match mcp_method {
            McpMethod::Initialize => Ok(self.initialize_result()),
            McpMethod::Initialized => Ok(Value::Null),
            McpMethod::Ping => Ok(json!({})),
            McpMethod::ToolsList => Ok(json!({ "tools": self.tool_list() })),
            McpMethod::ToolsCall => {
                let CallToolParams { name, arguments } = parse_params(params)?;
                Ok(self.call_tool(&name, arguments.unwrap_or_else(|| json!({})), cx).await)
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value, cx: McpContext) -> Value {
        let Some(tool) = self.tools.iter().find(|tool| tool.name == name) else {
            tracing::debug!(server = %self.name, tool = name, "unknown tool");
            return error_result(format!("Unknown tool: {name}"));
        };

        let handler = tool.handler.clone();
        let call = async move { handler(arguments, cx).await };
        let message = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(output)) => return success_result(output),
            Ok(Err(error)) => format!("{error:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };

        let error = Error::ToolExecution {
            tool: name.to_string(),
            message,
        };
        tracing::warn!(server = %self.name, %error, "tool call failed");
        error_result(error.to_string())
    }
}

fn success_result(output: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": output.to_string() }],
        "structuredContent": output,
        "isError": false,
    })
}

fn error_result(message: String) -> Value {
    json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// Accumulates tools for an [`McpServer`].
pub struct McpServerBuilder {
    name: String,
    instructions: Option<String>,
    tools: Vec<RegisteredTool>,
}

impl McpServerBuilder {
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool whose input and output are typed.
    ///
    /// Schemas are derived with `schemars`. Arguments that do not deserialize
    /// into `I` fail the call (as an error-flagged result).
    pub fn tool_fn<I, O, F, Fut>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        I: JsonSchema + DeserializeOwned + Send + 'static,
        O: JsonSchema + Serialize + Send + 'static,
        F: Fn(I, McpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ToolHandler = Arc::new(
            move |arguments: Value, cx: McpContext| -> BoxFuture<'static, anyhow::Result<Value>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let input: I =
                        serde_json::from_value(arguments).context("invalid tool arguments")?;
                    let output = handler(input, cx).await?;
                    Ok(serde_json::to_value(output)?)
                })
            },
        );
        self.register(
            name.into(),
            description.into(),
            SchemaOf::<I>::new().to_json_schema(),
            SchemaOf::<O>::new().to_json_schema(),
            erased,
        )
    }

    /// Register a tool with explicit schemas and a JSON-in, JSON-out handler.
    pub fn tool<F, Fut>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: impl ToJsonSchema,
        output_schema: impl ToJsonSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, McpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let erased: ToolHandler = Arc::new(
            move |arguments: Value, cx: McpContext| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(handler(arguments, cx))
            },
        );
        self.register(
            name.into(),
            description.into(),
            input_schema.to_json_schema(),
            output_schema.to_json_schema(),
            erased,
        )
    }

    fn register(
        mut self,
        name: String,
        description: String,
        input_schema: Value,
        output_schema: Value,
        handler: ToolHandler,
    ) -> Self {
        let tool = RegisteredTool {
            name,
            description,
            input_schema,
            output_schema,
            handler,
        };
        // Re-registering a name replaces the earlier tool in place.
        match self.tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
        self
    }

    pub fn build(self) -> McpServer {
        McpServer {
            id: Uuid::new_v4(),
            name: self.name,
            instructions: self.instructions,
            tools: self.tools.into(),
        }
    }
}
