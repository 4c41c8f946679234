//! Answers the `_mcp/*` tunnel methods on behalf of MCP servers that live in
//! the conductor's process.
//!
//! The handler is a cheap clone over shared tables: registered servers (keyed
//! by `acp:` URL), open connections (keyed by connection id), the current
//! session id, and one tools-discovery latch per session.
//!
//! A session's latch is released by the first `tools/list` sent on any
//! connection bound to that session, or by the timeout of the first caller of
//! [`McpOverAcpHandler::wait_for_tools_discovery`]. Once released it stays
//! released for as long as the session is current or has an open connection;
//! after that, latches nobody waits on are dropped.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use acp_proto::{
    Error, McpContext, McpServer, Result,
    mcp_over_acp::{
        McpConnectRequest, McpConnectResponse, McpDisconnectRequest, McpMessageRequest,
        McpOverAcpMethod, ServerInfo,
    },
    mcp_server::MCP_PROTOCOL_VERSION,
    util::parse_params,
};
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct McpOverAcpHandler {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    servers: Mutex<HashMap<String, McpServer>>,
    connections: Mutex<HashMap<String, McpConnection>>,
    session_id: Mutex<Option<String>>,
    discovery: Mutex<HashMap<String, DiscoveryLatch>>,
}

struct McpConnection {
    server: McpServer,
    session_id: Option<String>,
    /// Set once `tools/list` has been seen, so a session bound later can be released.
    listed_tools: bool,
}

struct DiscoveryLatch {
    released: watch::Sender<bool>,
    timer_started: bool,
}

impl DiscoveryLatch {
    fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            released,
            timer_started: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the router should do with a tunnel request.
#[derive(Debug)]
pub enum McpDispatch {
    /// Answer immediately with this result.
    Ready(Value),
    /// Run this call off the routing loop and answer with its result.
    Call(McpCall),
}

/// A resolved `_mcp/message`: the target server and the request for it.
#[derive(Debug)]
pub struct McpCall {
    server: McpServer,
    method: String,
    params: Option<Value>,
    cx: McpContext,
}

impl McpCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn run(self) -> Result<Value> {
        self.server.handle(&self.method, self.params, self.cx).await
    }
}

impl McpOverAcpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server; returns the `acp:` URL that reaches it.
    pub fn register(&self, server: McpServer) -> String {
        let acp_url = server.acp_url();
        tracing::info!(server = server.name(), %acp_url, "registered MCP server");
        lock(&self.inner.servers).insert(acp_url.clone(), server);
        acp_url
    }

    pub fn unregister(&self, acp_url: &str) -> Option<McpServer> {
        lock(&self.inner.servers).remove(acp_url)
    }

    pub fn has_servers(&self) -> bool {
        !lock(&self.inner.servers).is_empty()
    }

    /// Registered servers, ordered by name.
    pub fn servers(&self) -> Vec<McpServer> {
        let mut servers: Vec<_> = lock(&self.inner.servers).values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(&b.id())));
        servers
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    /// Record the current session. Connections opened before any session was
    /// known are bound to it.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        tracing::debug!(%session_id, "current session");
        *lock(&self.inner.session_id) = Some(session_id.clone());

        let mut release = false;
        for connection in lock(&self.inner.connections).values_mut() {
            if connection.session_id.is_none() {
                connection.session_id = Some(session_id.clone());
                release |= connection.listed_tools;
            }
        }
        if release {
            self.release(&session_id);
        }
        self.prune_latches();
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Route a tunnel method (with the leading `_` already stripped).
    pub fn dispatch(&self, method: &str, params: Option<Value>) -> Result<McpDispatch> {
        match McpOverAcpMethod::parse(method)? {
            McpOverAcpMethod::Connect => {
                let response = self.connect(parse_params(params)?)?;
                Ok(McpDispatch::Ready(serde_json::to_value(response)?))
            }
            McpOverAcpMethod::Message => Ok(McpDispatch::Call(
                self.prepare_message(parse_params(params)?)?,
            )),
            McpOverAcpMethod::Disconnect => {
                self.disconnect(parse_params(params)?);
                Ok(McpDispatch::Ready(Value::Null))
            }
        }
    }

    pub fn connect(&self, request: McpConnectRequest) -> Result<McpConnectResponse> {
        let McpConnectRequest {
            connection_id,
            acp_url,
            session_id,
        } = request;

        let server = lock(&self.inner.servers)
            .get(&acp_url)
            .cloned()
            .ok_or_else(|| Error::invalid_params(format!("no MCP server registered for URL `{acp_url}`")))?;

        let connection_id = connection_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session_id = session_id.or_else(|| self.session_id());
        tracing::info!(
            %connection_id,
            server = server.name(),
            session_id = ?session_id,
            "MCP connection opened"
        );

        let response = McpConnectResponse {
            connection_id: connection_id.clone(),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            server_info: ServerInfo {
                name: server.name().to_string(),
                version: server.version().to_string(),
            },
            capabilities: json!({ "tools": {} }),
            instructions: Some(server.instructions()),
            tools: Some(server.tool_list()),
        };

        lock(&self.inner.connections).insert(
            connection_id,
            McpConnection {
                server,
                session_id,
                listed_tools: false,
            },
        );
        Ok(response)
    }

    /// Resolve the connection for a message and note any tools discovery.
    ///
    /// This runs synchronously so that a `tools/list` releases its session's
    /// latch before anything queued behind it is routed.
    pub fn prepare_message(&self, request: McpMessageRequest) -> Result<McpCall> {
        let McpMessageRequest {
            connection_id,
            method,
            params,
        } = request;

        let (server, session_id) = {
            let mut connections = lock(&self.inner.connections);
            let Some(connection) = connections.get_mut(&connection_id) else {
                return Err(Error::invalid_params(format!("unknown connection `{connection_id}`")));
            };
            if method == "tools/list" {
                connection.listed_tools = true;
            }
            (connection.server.clone(), connection.session_id.clone())
        };

        if method == "tools/list" {
            if let Some(session_id) = &session_id {
                self.release(session_id);
            }
        }

        Ok(McpCall {
            server,
            method,
            params,
            cx: McpContext {
                connection_id,
                session_id,
            },
        })
    }

    /// Send one MCP request to the connection's server and return its raw result.
    pub async fn message(&self, request: McpMessageRequest) -> Result<Value> {
        self.prepare_message(request)?.run().await
    }

    /// Close a connection. Unknown ids are ignored.
    pub fn disconnect(&self, request: McpDisconnectRequest) {
        if lock(&self.inner.connections).remove(&request.connection_id).is_some() {
            tracing::info!(connection_id = %request.connection_id, "MCP connection closed");
            self.prune_latches();
        }
    }

    pub fn tools_discovered(&self, session_id: &str) -> bool {
        lock(&self.inner.discovery)
            .get(session_id)
            .is_some_and(|latch| *latch.released.borrow())
    }

    /// Wait until `session_id` lists its tools or `timeout` passes.
    ///
    /// Never fails. Concurrent waiters on one session share the first
    /// waiter's timer and are released together.
    pub async fn wait_for_tools_discovery(&self, session_id: &str, timeout: Duration) {
        let (mut released, start_timer) = {
            let mut discovery = lock(&self.inner.discovery);
            let latch = discovery
                .entry(session_id.to_string())
                .or_insert_with(DiscoveryLatch::new);
            if *latch.released.borrow() {
                return;
            }
            let start_timer = !std::mem::replace(&mut latch.timer_started, true);
            (latch.released.subscribe(), start_timer)
        };

        if start_timer {
            let handler = self.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if handler.release(&session_id) {
                    tracing::debug!(%session_id, ?timeout, "tools discovery timed out");
                }
            });
        }

        let _ = released.wait_for(|released| *released).await;
    }

    /// Drop released latches of sessions that are no longer in use and have no waiters.
    fn prune_latches(&self) {
        let current = self.session_id();
        let bound: HashSet<String> = lock(&self.inner.connections)
            .values()
            .filter_map(|connection| connection.session_id.clone())
            .collect();
        lock(&self.inner.discovery).retain(|session_id, latch| {
            let keep = !*latch.released.borrow()
                || latch.released.receiver_count() > 0
                || current.as_deref() == Some(session_id.as_str())
                || bound.contains(session_id);
            if !keep {
                tracing::debug!(%session_id, "dropping tools discovery latch");
            }
            keep
        });
    }

    /// Release a session's latch. Returns true if it was not yet released.
    fn release(&self, session_id: &str) -> bool {
        let mut discovery = lock(&self.inner.discovery);
        let latch = discovery
            .entry(session_id.to_string())
            .or_insert_with(DiscoveryLatch::new);
        !latch.released.send_replace(true)
    }
}
