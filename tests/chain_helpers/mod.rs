//! Shared plumbing for the conductor integration tests.
//!
//! Components are in-memory channel pairs: each test plays every component by
//! hand through the far end of its pair, which makes ordering observable.

#![allow(dead_code)]

use std::time::Duration;

use conductor::{
    Conductor, ShutdownHandle,
    acp_proto::{Id, JsonRpcMessage, ResponseError, Result},
    connector::{ChannelConnector, Connection, Connector},
    instantiator::from_connectors,
    mcp_over_acp::McpOverAcpHandler,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Chain {
    pub client: Connection,
    /// Component ends in chain order; the agent is last.
    pub components: Vec<Connection>,
    pub conductor: JoinHandle<Result<()>>,
    pub shutdown: ShutdownHandle,
    pub mcp: McpOverAcpHandler,
}

impl Chain {
    pub fn agent(&mut self) -> &mut Connection {
        self.components.last_mut().expect("chain has an agent")
    }

    pub fn proxy(&mut self, index: usize) -> &mut Connection {
        &mut self.components[index]
    }
}

/// Start a conductor over `proxies` proxies and an agent, all in memory.
pub fn start_chain(proxies: usize, configure: impl FnOnce(Conductor) -> Conductor) -> Chain {
    init_tracing();

    let mut proxy_connectors: Vec<Box<dyn Connector>> = Vec::new();
    let mut components = Vec::new();
    for index in 1..=proxies {
        let (connector, end) = ChannelConnector::pair(format!("proxy{index}"));
        proxy_connectors.push(Box::new(connector));
        components.push(end);
    }
    let (agent, agent_end) = ChannelConnector::pair("agent");
    components.push(agent_end);

    let conductor = configure(Conductor::new(from_connectors(
        Box::new(agent),
        proxy_connectors,
    )));
    let shutdown = conductor.shutdown_handle();
    let mcp = conductor.mcp_handler();
    let (client, conductor) = serve(conductor);

    Chain {
        client,
        components,
        conductor,
        shutdown,
        mcp,
    }
}

/// Run `conductor` against an in-memory client; returns the client's end.
pub fn serve(conductor: Conductor) -> (Connection, JoinHandle<Result<()>>) {
    init_tracing();
    let (conductor_side, client) = Connection::pair("client");
    (client, tokio::spawn(conductor.run(conductor_side)))
}

pub async fn recv(connection: &mut Connection) -> JsonRpcMessage {
    tokio::time::timeout(Duration::from_secs(10), connection.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
        .expect("connection failed")
}

/// Nothing arrives on `connection` for a little while.
pub async fn assert_quiet(connection: &mut Connection) {
    if let Ok(message) = tokio::time::timeout(Duration::from_millis(150), connection.recv()).await {
        panic!("expected no message, got {message:?}");
    }
}

pub fn request(id: impl Into<Id>, method: &str, params: Value) -> JsonRpcMessage {
    JsonRpcMessage::request(id, method, params)
}

pub fn response(id: Id, result: std::result::Result<Value, ResponseError>) -> JsonRpcMessage {
    JsonRpcMessage::response(id, result)
}

#[track_caller]
pub fn expect_request(message: JsonRpcMessage, expected: &str) -> (Id, Option<Value>) {
    match message {
        JsonRpcMessage::Request { id, method, params } if method == expected => (id, params),
        other => panic!("expected a `{expected}` request, got {other:?}"),
    }
}

#[track_caller]
pub fn expect_notification(message: JsonRpcMessage, expected: &str) -> Option<Value> {
    match message {
        JsonRpcMessage::Notification { method, params } if method == expected => params,
        other => panic!("expected a `{expected}` notification, got {other:?}"),
    }
}

#[track_caller]
pub fn expect_response(message: JsonRpcMessage) -> (Id, std::result::Result<Value, ResponseError>) {
    match message {
        JsonRpcMessage::Response { id, result } => (id, result),
        other => panic!("expected a response, got {other:?}"),
    }
}

/// Run the handshake for a chain whose proxies all pass `initialize` on.
/// Returns the result the client received.
pub async fn initialize(chain: &mut Chain) -> Value {
    chain
        .client
        .send(request("init", "initialize", json!({"clientInfo": {"name": "test"}})))
        .unwrap();

    let count = chain.components.len();
    let mut received = Vec::new();
    for index in 0..count {
        let (id, params) = expect_request(recv(&mut chain.components[index]).await, "initialize");
        received.push(id);
        if index + 1 < count {
            chain.components[index]
                .send(JsonRpcMessage::Request {
                    id: Id::from(format!("forward-{index}")),
                    method: "initialize".to_string(),
                    params,
                })
                .unwrap();
        }
    }

    chain.components[count - 1]
        .send(response(received[count - 1].clone(), Ok(json!({"agentInfo": {"name": "agent"}}))))
        .unwrap();
    for index in (0..count - 1).rev() {
        let (id, result) = expect_response(recv(&mut chain.components[index]).await);
        assert_eq!(id, Id::from(format!("forward-{index}")));
        chain.components[index]
            .send(response(received[index].clone(), result))
            .unwrap();
    }

    let (id, result) = expect_response(recv(&mut chain.client).await);
    assert_eq!(id, Id::from("init"));
    result.expect("initialize succeeds")
}
