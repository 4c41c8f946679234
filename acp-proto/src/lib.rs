//! Protocol types shared by the conductor and the components it talks to.
//!
//! * [`jsonrpc`]: the JSON-RPC 2.0 message model and its line framing.
//! * [`session`]: the shapes of `initialize` and of MCP server session configs.
//! * [`mcp_over_acp`]: the `_mcp/*` extension messages that tunnel MCP inside ACP.
//! * [`mcp_server`]: an in-process MCP server and its builder.

mod error;
pub mod jsonrpc;
pub mod mcp_over_acp;
pub mod mcp_server;
mod schema;
pub mod session;
pub mod util;

pub use error::{Error, Result};
pub use jsonrpc::{Id, JsonRpcMessage, ResponseError};
pub use mcp_server::{McpContext, McpServer, McpServerBuilder, RegisteredTool};
pub use schema::{SchemaOf, ToJsonSchema};
pub use session::{InitializeRequest, McpServerConfig};
