//! # Conductor: routes ACP between a client, a proxy chain, and an agent
//!
//! ```text
//! Client <-ACP-> [Proxy 1] <-ACP-> ... <-ACP-> [Proxy n] <-ACP-> Agent
//!   0               1                            n              n+1
//! ```
//!
//! Every connection is identified by its position in the chain (its
//! [`SourceIndex`]). The conductor owns all of them and runs a single routing
//! loop that every inbound message passes through, which serializes all of
//! its decisions.
//!
//! ## Lifecycle
//!
//! `Uninitialized → Instantiating → Initializing → Routing`, ending in
//! `Closed`. The client's first request must be `initialize`. It triggers the
//! [`ComponentInstantiator`]; once every component is connected, the
//! `initialize` is forwarded down the chain like any other request. The
//! conductor answers the client only after every component has completed its
//! own `initialize`. If a proxy answers without passing `initialize` on, the
//! conductor initializes the remaining components itself.
//!
//! ## Routing
//!
//! * Requests and notifications from a source go to the next component
//!   toward the agent. The agent's own messages go back toward the client.
//!   A proxy reaches its predecessor with the `_proxy/predecessor/` prefix.
//! * Methods in the `_mcp/` namespace never leave the conductor; they are
//!   answered by the [`McpOverAcpHandler`].
//! * Every forwarded request gets a fresh id from the destination's
//!   [`HopTable`]. The response travels back to whoever sent the request,
//!   under its original id.
//! * Messages from one source are handled in arrival order. A client
//!   `session/prompt` waits (holding everything the client sends after it)
//!   until its session's tools are discovered.

use std::{collections::BTreeSet, fmt, mem, ops::ControlFlow, time::Duration};

use acp_proto::{
    Error, Id, InitializeRequest, JsonRpcMessage, McpServer, ResponseError, Result,
    mcp_over_acp::{McpOverAcpMethod, is_mcp_over_acp, strip_extension_prefix},
    session::{
        METHOD_INITIALIZE, METHOD_SESSION_LOAD, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
        session_id_of,
    },
    util::parse_params,
};
use futures::{SinkExt as _, StreamExt as _, channel::mpsc};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ConductorConfig,
    connector::{Connection, ConnectionSender},
    instantiator::{ComponentInstantiator, Instantiated},
    logging::{Direction, TraceLog},
    mcp_over_acp::{McpDispatch, McpOverAcpHandler},
    message_queue::{MessageQueue, spawn_pump},
};

mod hop;

use hop::{HopTable, Origin, PendingRequest};

/// Position of a connection in the chain: 0 is the client, the agent is last.
pub type SourceIndex = usize;

pub const CLIENT: SourceIndex = 0;

/// The part a connection plays in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    /// The proxy at this position, counting from 0.
    Proxy(usize),
    Agent,
}

impl Role {
    /// The role of `source` in a chain of `chain_len` connections (client included).
    pub fn of(source: SourceIndex, chain_len: usize) -> Self {
        if source == CLIENT {
            Role::Client
        } else if source + 1 == chain_len {
            Role::Agent
        } else {
            Role::Proxy(source - 1)
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Proxy(n) => write!(f, "proxy {n}"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// Method prefix a proxy uses to address the component before it.
pub const PREDECESSOR_PREFIX: &str = "_proxy/predecessor/";

type Flow = ControlFlow<Result<()>>;

pub struct Conductor {
    instantiator: Box<dyn ComponentInstantiator>,
    config: ConductorConfig,
    mcp: McpOverAcpHandler,
    trace: Option<TraceLog>,
    shutdown: CancellationToken,
}

impl Conductor {
    pub fn new(instantiator: Box<dyn ComponentInstantiator>) -> Self {
        Self {
            instantiator,
            config: ConductorConfig::default(),
            mcp: McpOverAcpHandler::new(),
            trace: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    /// Make an in-process MCP server reachable from the agent.
    pub fn with_mcp_server(self, server: McpServer) -> Self {
        self.mcp.register(server);
        self
    }

    pub fn with_trace_log(mut self, trace: TraceLog) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn mcp_handler(&self) -> McpOverAcpHandler {
        self.mcp.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Serve `client` until it disconnects, a component dies, or shutdown is requested.
    ///
    /// Returns `Ok(())` on client disconnect or shutdown. Failing to start the
    /// chain, a rejected `initialize`, or a component going away are errors.
    pub async fn run(self, client: Connection) -> Result<()> {
        let Conductor {
            instantiator,
            config,
            mcp,
            trace,
            shutdown,
        } = self;

        let (conductor_tx, mut conductor_rx) = mpsc::channel(config.channel_capacity);
        let mut router = Router {
            phase: Phase::Uninitialized,
            instantiator: Some(instantiator),
            config,
            mcp,
            trace,
            conductor_tx,
            connections: Vec::new(),
            instantiation: None,
        };
        router.attach("client".to_string(), client);
        info!("conductor waiting for initialize");

        // This is the "central actor" of the conductor. Pumps and spawned tasks
        // feed `conductor_rx`; everything that changes routing state happens here.
        let result = loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => ConductorMessage::Shutdown,
                message = conductor_rx.next() => match message {
                    Some(message) => message,
                    None => break Ok(()),
                },
            };
            if let ControlFlow::Break(result) = router.handle_conductor_message(message) {
                break result;
            }
        };

        router.close().await;
        result
    }
}

/// Ends a running conductor from outside.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.cancel();
    }
}

/// Events delivered to the routing loop.
#[derive(Debug)]
pub enum ConductorMessage {
    /// A message read from the connection at `source`.
    Incoming {
        source: SourceIndex,
        message: JsonRpcMessage,
    },

    /// The connection at `source` ended, with the error that ended it, if any.
    Closed {
        source: SourceIndex,
        error: Option<Error>,
    },

    /// The instantiator ran and every component was connected (or not).
    Connected {
        result: Result<Vec<(String, Connection)>>,
    },

    /// A suspended message from `source` may now proceed.
    Resume {
        source: SourceIndex,
        message: JsonRpcMessage,
    },

    /// A response produced off the loop (an MCP tunnel call) for `destination`.
    ForwardResponse {
        destination: SourceIndex,
        id: Id,
        result: std::result::Result<Value, ResponseError>,
    },

    Shutdown,
}

enum Phase {
    Uninitialized,
    Instantiating { client_id: Id, params: Option<Value> },
    Initializing(Handshake),
    Routing,
    Closed,
}

struct Handshake {
    client_id: Id,
    params: Option<Value>,
    /// Components that have not yet answered an `initialize`.
    awaiting: BTreeSet<SourceIndex>,
    /// The first component's answer to the client, held until `awaiting` is empty.
    held: Option<Value>,
}

struct ComponentConnection {
    name: String,
    sender: ConnectionSender,
    pending: HopTable,
    queue: MessageQueue,
    /// Set when the peer answered a request we never sent it.
    suspect: bool,
    pump: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl Drop for ComponentConnection {
    fn drop(&mut self) {
        // The pump owns the inbound stream (and for processes, the child).
        self.pump.abort();
    }
}

struct Router {
    phase: Phase,
    instantiator: Option<Box<dyn ComponentInstantiator>>,
    config: ConductorConfig,
    mcp: McpOverAcpHandler,
    trace: Option<TraceLog>,
    conductor_tx: mpsc::Sender<ConductorMessage>,
    connections: Vec<ComponentConnection>,
    instantiation: Option<JoinHandle<()>>,
}

impl Router {
    fn handle_conductor_message(&mut self, message: ConductorMessage) -> Flow {
        debug!(?message, "handle_conductor_message");

        match message {
            ConductorMessage::Incoming { source, message } => {
                self.trace(source, Direction::Incoming, &message);
                match self.connections[source].queue.admit(message) {
                    Some(message) => self.process(source, message),
                    None => {
                        debug!(source, "queued behind a suspended message");
                        Flow::Continue(())
                    }
                }
            }

            ConductorMessage::Resume { source, message } => {
                self.connections[source].queue.resume();
                if let Flow::Break(result) = self.route(source, message, false) {
                    return Flow::Break(result);
                }
                self.drain(source)
            }

            ConductorMessage::Connected { result } => self.components_connected(result),

            ConductorMessage::ForwardResponse {
                destination,
                id,
                result,
            } => {
                self.respond(destination, id, result);
                Flow::Continue(())
            }

            ConductorMessage::Closed { source, error } => self.connection_closed(source, error),

            ConductorMessage::Shutdown => {
                info!("shutdown requested");
                Flow::Break(Ok(()))
            }
        }
    }

    fn process(&mut self, source: SourceIndex, message: JsonRpcMessage) -> Flow {
        if matches!(self.phase, Phase::Uninitialized) {
            return self.before_initialize(message);
        }
        self.route(source, message, true)
    }

    /// Process whatever `source` accumulated while it was suspended.
    fn drain(&mut self, source: SourceIndex) -> Flow {
        while let Some(message) = self.connections[source].queue.next_ready() {
            if let Flow::Break(result) = self.process(source, message) {
                return Flow::Break(result);
            }
        }
        Flow::Continue(())
    }

    fn before_initialize(&mut self, message: JsonRpcMessage) -> Flow {
        match message {
            JsonRpcMessage::Request { id, method, params } if method == METHOD_INITIALIZE => {
                self.start_instantiation(id, params);
            }
            JsonRpcMessage::Request { id, method, .. } => {
                warn!(%method, "request before initialize");
                let error = Error::protocol(format!("`{method}` received before `initialize`"));
                self.respond(CLIENT, id, Err(error.to_response_error()));
            }
            other => warn!(message = ?other, "dropping message received before initialize"),
        }
        Flow::Continue(())
    }

    fn start_instantiation(&mut self, id: Id, params: Option<Value>) {
        let request = match InitializeRequest::from_params(params.as_ref()) {
            Ok(request) => request,
            Err(error) => {
                self.respond(CLIENT, id, Err(error.to_response_error()));
                return;
            }
        };
        let Some(instantiator) = self.instantiator.take() else {
            let error = ResponseError::internal_error("components were already instantiated");
            self.respond(CLIENT, id, Err(error));
            return;
        };

        info!(
            mcp_servers = request.mcp_servers.len(),
            "instantiating components"
        );
        self.connections[CLIENT].queue.suspend();
        self.phase = Phase::Instantiating {
            client_id: id,
            params,
        };
        self.instantiation = Some(tokio::spawn(connect_components(
            instantiator,
            request,
            self.conductor_tx.clone(),
        )));
    }

    fn components_connected(&mut self, result: Result<Vec<(String, Connection)>>) -> Flow {
        let (client_id, params) = match mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Instantiating { client_id, params } => (client_id, params),
            other => {
                self.phase = other;
                warn!("components connected outside of startup");
                return Flow::Continue(());
            }
        };
        self.instantiation = None;

        let connections = match result {
            Ok(connections) => connections,
            Err(error) => {
                error!(%error, "failed to start components");
                self.respond(CLIENT, client_id, Err(error.to_response_error()));
                return Flow::Break(Err(error));
            }
        };

        info!(
            component_count = connections.len(),
            "all components connected, starting message routing"
        );
        for (name, connection) in connections {
            self.attach(name, connection);
        }
        for source in 1..self.connections.len() {
            debug!(
                source,
                role = %self.role(source),
                component = %self.connections[source].name,
                "chain position"
            );
        }

        self.phase = Phase::Initializing(Handshake {
            client_id: client_id.clone(),
            params: params.clone(),
            awaiting: (1..self.connections.len()).collect(),
            held: None,
        });
        self.forward_request(CLIENT, 1, client_id, METHOD_INITIALIZE.to_string(), params);

        self.connections[CLIENT].queue.resume();
        self.drain(CLIENT)
    }

    fn attach(&mut self, name: String, connection: Connection) {
        let source = self.connections.len();
        let Connection {
            sender,
            incoming,
            writer,
        } = connection;
        let pump = spawn_pump(source, incoming, self.conductor_tx.clone());
        debug!(source, component = %name, "attached connection");
        self.connections.push(ComponentConnection {
            name,
            sender,
            pending: HopTable::new(self.config.max_pending_requests),
            queue: MessageQueue::default(),
            suspect: false,
            pump,
            writer,
        });
    }

    fn agent_index(&self) -> SourceIndex {
        self.connections.len() - 1
    }

    fn role(&self, source: SourceIndex) -> Role {
        Role::of(source, self.connections.len())
    }

    fn route(&mut self, source: SourceIndex, message: JsonRpcMessage, gate: bool) -> Flow {
        match message {
            JsonRpcMessage::Request { id, method, params } => {
                self.route_request(source, id, method, params, gate);
                Flow::Continue(())
            }
            JsonRpcMessage::Notification { method, params } => {
                self.route_notification(source, method, params);
                Flow::Continue(())
            }
            JsonRpcMessage::Response { id, result } => self.route_response(source, id, result),
        }
    }

    /// Where a message from `source` goes, and the method it arrives with.
    fn target_of(&self, source: SourceIndex, method: String) -> Result<(SourceIndex, String)> {
        if let Some(method) = method.strip_prefix(PREDECESSOR_PREFIX) {
            if source == CLIENT {
                return Err(Error::protocol("the client has no predecessor"));
            }
            return Ok((source - 1, method.to_string()));
        }
        if source == self.agent_index() {
            Ok((source - 1, method))
        } else {
            Ok((source + 1, method))
        }
    }

    fn route_request(
        &mut self,
        source: SourceIndex,
        id: Id,
        method: String,
        params: Option<Value>,
        gate: bool,
    ) {
        if is_mcp_over_acp(&method) {
            self.handle_mcp_request(source, id, &method, params);
            return;
        }

        let (target, method) = match self.target_of(source, method) {
            Ok(target) => target,
            Err(error) => {
                warn!(source, %error, "cannot route request");
                self.respond(source, id, Err(error.to_response_error()));
                return;
            }
        };

        if source == CLIENT {
            if method == METHOD_SESSION_LOAD {
                if let Some(session_id) = session_id_of(params.as_ref()) {
                    self.mcp.set_session_id(session_id);
                }
            }
            if gate && method == METHOD_SESSION_PROMPT {
                if let Some(session_id) = self.undiscovered_session(params.as_ref()) {
                    self.hold_prompt(session_id, JsonRpcMessage::Request { id, method, params });
                    return;
                }
            }
        }

        let params = if method == METHOD_SESSION_NEW && target == self.agent_index() {
            self.with_registered_servers(params)
        } else {
            params
        };

        self.forward_request(source, target, id, method, params);
    }

    fn forward_request(
        &mut self,
        source: SourceIndex,
        target: SourceIndex,
        id: Id,
        method: String,
        params: Option<Value>,
    ) {
        let pending = PendingRequest {
            origin: Origin::Forwarded {
                source,
                original_id: id.clone(),
            },
            method: method.clone(),
        };
        match self.connections[target].pending.insert(pending) {
            Ok(hop_id) => {
                debug!(source, target, %method, original_id = %id, %hop_id, "forwarding request");
                self.send_to(
                    target,
                    JsonRpcMessage::Request {
                        id: hop_id,
                        method,
                        params,
                    },
                );
            }
            Err(_) => {
                let name = &self.connections[target].name;
                warn!(source, target, component = %name, %method, "too many pending requests");
                let error =
                    ResponseError::internal_error(format!("too many pending requests for `{name}`"));
                self.respond(source, id, Err(error));
            }
        }
    }

    fn route_notification(&mut self, source: SourceIndex, method: String, params: Option<Value>) {
        if is_mcp_over_acp(&method) {
            // Only a disconnect makes sense without a reply.
            match McpOverAcpMethod::parse(strip_extension_prefix(&method)) {
                Ok(McpOverAcpMethod::Disconnect) => match parse_params(params) {
                    Ok(request) => self.mcp.disconnect(request),
                    Err(error) => warn!(source, %error, "malformed MCP disconnect"),
                },
                _ => warn!(source, %method, "ignoring MCP tunnel notification"),
            }
            return;
        }

        match self.target_of(source, method) {
            Ok((target, method)) => {
                self.send_to(target, JsonRpcMessage::Notification { method, params })
            }
            Err(error) => warn!(source, %error, "dropping notification"),
        }
    }

    fn route_response(
        &mut self,
        source: SourceIndex,
        id: Id,
        result: std::result::Result<Value, ResponseError>,
    ) -> Flow {
        let Some(pending) = self.connections[source].pending.remove(&id) else {
            let connection = &mut self.connections[source];
            connection.suspect = true;
            warn!(
                source,
                component = %connection.name,
                %id,
                "response to an unknown request, marking connection suspect"
            );
            return Flow::Continue(());
        };

        if pending.method == METHOD_SESSION_NEW {
            if let Some(session_id) = result.as_ref().ok().and_then(|r| session_id_of(Some(r))) {
                self.mcp.set_session_id(session_id);
            }
        }

        if pending.method == METHOD_INITIALIZE && matches!(self.phase, Phase::Initializing(_)) {
            return self.handshake_response(source, pending.origin, result);
        }

        match pending.origin {
            Origin::Forwarded {
                source: requester,
                original_id,
            } => self.respond(requester, original_id, result),
            Origin::Handshake => debug!(source, "late initialize response"),
        }
        Flow::Continue(())
    }

    fn handshake_response(
        &mut self,
        source: SourceIndex,
        origin: Origin,
        result: std::result::Result<Value, ResponseError>,
    ) -> Flow {
        let Phase::Initializing(handshake) = &mut self.phase else {
            return Flow::Continue(());
        };

        let value = match result {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    source,
                    component = %self.connections[source].name,
                    %error,
                    "initialize rejected, closing session"
                );
                let client_id = handshake.client_id.clone();
                self.respond(CLIENT, client_id, Err(error.clone()));
                self.phase = Phase::Closed;
                return Flow::Break(Err(Error::from(error)));
            }
        };

        handshake.awaiting.remove(&source);
        let relay = match origin {
            Origin::Forwarded {
                source: CLIENT,
                original_id,
            } if original_id == handshake.client_id => {
                handshake.held = Some(value);
                None
            }
            Origin::Forwarded {
                source: requester,
                original_id,
            } => Some((requester, original_id, value)),
            Origin::Handshake => None,
        };
        if let Some((requester, original_id, value)) = relay {
            self.respond(requester, original_id, Ok(value));
        }

        self.advance_handshake();
        Flow::Continue(())
    }

    /// Once the client's answer is in hand, finish any component that has not
    /// been initialized and release the answer when all are done.
    fn advance_handshake(&mut self) {
        let (params, uninitialized) = match &self.phase {
            Phase::Initializing(handshake) if handshake.held.is_some() => (
                handshake.params.clone(),
                handshake
                    .awaiting
                    .iter()
                    .copied()
                    .filter(|&target| !self.connections[target].pending.has_pending(METHOD_INITIALIZE))
                    .collect::<Vec<_>>(),
            ),
            _ => return,
        };

        let all_done = matches!(&self.phase, Phase::Initializing(h) if h.awaiting.is_empty());
        if all_done {
            if let Phase::Initializing(Handshake {
                client_id,
                held: Some(result),
                ..
            }) = mem::replace(&mut self.phase, Phase::Routing)
            {
                info!(
                    component_count = self.connections.len() - 1,
                    "chain initialized"
                );
                self.respond(CLIENT, client_id, Ok(result));
            }
            return;
        }

        for target in uninitialized {
            info!(
                target,
                component = %self.connections[target].name,
                "initializing component on the client's behalf"
            );
            let pending = PendingRequest {
                origin: Origin::Handshake,
                method: METHOD_INITIALIZE.to_string(),
            };
            match self.connections[target].pending.insert(pending) {
                Ok(id) => self.send_to(
                    target,
                    JsonRpcMessage::Request {
                        id,
                        method: METHOD_INITIALIZE.to_string(),
                        params: params.clone(),
                    },
                ),
                Err(_) => warn!(target, "too many pending requests to initialize"),
            }
        }
    }

    fn handle_mcp_request(
        &mut self,
        source: SourceIndex,
        id: Id,
        method: &str,
        params: Option<Value>,
    ) {
        match self.mcp.dispatch(strip_extension_prefix(method), params) {
            Ok(McpDispatch::Ready(result)) => self.respond(source, id, Ok(result)),
            Ok(McpDispatch::Call(call)) => {
                debug!(source, mcp_method = call.method(), "running MCP call");
                let mut conductor_tx = self.conductor_tx.clone();
                tokio::spawn(async move {
                    let result = call.run().await.map_err(|error| error.to_response_error());
                    let _ = conductor_tx
                        .send(ConductorMessage::ForwardResponse {
                            destination: source,
                            id,
                            result,
                        })
                        .await;
                });
            }
            Err(error) => {
                warn!(source, %method, %error, "MCP tunnel request failed");
                self.respond(source, id, Err(error.to_response_error()));
            }
        }
    }

    /// The prompt's session id, if the prompt has to wait for tools discovery.
    fn undiscovered_session(&self, params: Option<&Value>) -> Option<String> {
        if !self.mcp.has_servers() {
            return None;
        }
        session_id_of(params).filter(|session_id| !self.mcp.tools_discovered(session_id))
    }

    fn hold_prompt(&mut self, session_id: String, prompt: JsonRpcMessage) {
        debug!(%session_id, "holding prompt until tools are discovered");
        self.connections[CLIENT].queue.suspend();

        let mcp = self.mcp.clone();
        let timeout: Duration = self.config.tools_discovery_timeout;
        let mut conductor_tx = self.conductor_tx.clone();
        tokio::spawn(async move {
            mcp.wait_for_tools_discovery(&session_id, timeout).await;
            let _ = conductor_tx
                .send(ConductorMessage::Resume {
                    source: CLIENT,
                    message: prompt,
                })
                .await;
        });
    }

    /// Add the session configs of registered MCP servers to a `session/new`.
    fn with_registered_servers(&self, params: Option<Value>) -> Option<Value> {
        let servers = self.mcp.servers();
        if servers.is_empty() {
            return params;
        }

        let mut params = params.unwrap_or_else(|| json!({}));
        let Some(entries) = params
            .as_object_mut()
            .map(|object| object.entry("mcpServers").or_insert_with(|| json!([])))
            .and_then(Value::as_array_mut)
        else {
            return Some(params);
        };
        for server in servers {
            let url = server.acp_url();
            let listed = entries
                .iter()
                .any(|entry| entry.get("url").and_then(Value::as_str) == Some(url.as_str()));
            if !listed {
                if let Ok(config) = serde_json::to_value(server.session_config()) {
                    entries.push(config);
                }
            }
        }
        Some(params)
    }

    fn connection_closed(&mut self, source: SourceIndex, error: Option<Error>) -> Flow {
        if source == CLIENT {
            match error {
                Some(error) => warn!(%error, "client connection failed"),
                None => info!("client disconnected"),
            }
            return Flow::Break(Ok(()));
        }

        let name = self.connections[source].name.clone();
        let error = match error {
            Some(Error::ClosedConnection(message)) => Error::closed(message),
            Some(error) => Error::closed(format!("`{name}` failed: {error}")),
            None => Error::closed(format!("`{name}` closed its connection")),
        };
        error!(
            source,
            role = %self.role(source),
            component = %name,
            %error,
            "component lost, closing session"
        );
        Flow::Break(Err(error))
    }

    fn respond(
        &mut self,
        destination: SourceIndex,
        id: Id,
        result: std::result::Result<Value, ResponseError>,
    ) {
        self.send_to(destination, JsonRpcMessage::Response { id, result });
    }

    fn send_to(&self, destination: SourceIndex, message: JsonRpcMessage) {
        let Some(connection) = self.connections.get(destination) else {
            warn!(destination, "no such connection");
            return;
        };
        self.trace(destination, Direction::Outgoing, &message);
        if let Err(error) = connection.sender.send(message) {
            warn!(destination, %error, "failed to deliver message");
        }
    }

    fn trace(&self, stage: SourceIndex, direction: Direction, message: &JsonRpcMessage) {
        if let Some(trace) = &self.trace {
            trace.record(stage, direction, message);
        }
    }

    /// Tear everything down. Components are dropped (killing child
    /// processes); the client gets a moment to flush what was already sent.
    async fn close(mut self) {
        self.phase = Phase::Closed;
        if let Some(task) = self.instantiation.take() {
            task.abort();
        }

        let mut client_writer = None;
        for (source, mut connection) in self.connections.drain(..).enumerate() {
            if connection.suspect {
                debug!(source, component = %connection.name, "closing suspect connection");
            }
            connection.pending.clear();
            connection.queue.clear();
            if source == CLIENT {
                client_writer = connection.writer.take();
            }
        }

        if let Some(writer) = client_writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }
        info!("conductor closed");
    }
}

async fn connect_components(
    instantiator: Box<dyn ComponentInstantiator>,
    request: InitializeRequest,
    mut conductor_tx: mpsc::Sender<ConductorMessage>,
) {
    let result = instantiate_chain(instantiator, &request).await;
    let _ = conductor_tx
        .send(ConductorMessage::Connected { result })
        .await;
}

async fn instantiate_chain(
    instantiator: Box<dyn ComponentInstantiator>,
    request: &InitializeRequest,
) -> Result<Vec<(String, Connection)>> {
    let Instantiated { agent, proxies } = instantiator.instantiate(request).await?;
    let mut connections = Vec::with_capacity(proxies.len() + 1);
    for connector in proxies.into_iter().chain(std::iter::once(agent)) {
        let name = connector.name();
        debug!(component = %name, "connecting component");
        connections.push((name, connector.connect(request).await?));
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_chain_position() {
        // client, two proxies, agent
        let roles: Vec<_> = (0..4).map(|source| Role::of(source, 4)).collect();
        assert_eq!(
            roles,
            [Role::Client, Role::Proxy(0), Role::Proxy(1), Role::Agent]
        );
        assert_eq!(Role::of(1, 2), Role::Agent);
        assert_eq!(Role::Proxy(1).to_string(), "proxy 1");
    }
}
