//! MCP servers hosted by the conductor and reached through `_mcp/*` requests,
//! plus holding prompts until a session's tools are discovered.

mod chain_helpers;

use std::time::{Duration, Instant};

use chain_helpers::*;
use conductor::{
    acp_proto::{
        Id, JsonRpcMessage, McpContext, McpServer, jsonrpc,
        mcp_over_acp::{McpConnectRequest, McpDisconnectRequest, McpMessageRequest},
    },
    config::ConductorConfig,
    mcp_over_acp::McpOverAcpHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Deserialize, JsonSchema)]
struct AddInput {
    a: i64,
    b: i64,
}

#[derive(Serialize, JsonSchema)]
struct AddOutput {
    sum: i64,
}

fn calculator() -> McpServer {
    McpServer::builder("calculator")
        .tool_fn("add", "Add two numbers", |input: AddInput, _cx| async move {
            Ok(AddOutput {
                sum: input.a + input.b,
            })
        })
        .tool(
            "whoami",
            "Reports the calling session",
            json!({"type": "object"}),
            json!({"type": "object"}),
            |_args, cx: McpContext| async move { Ok(json!({"sessionId": cx.session_id})) },
        )
        .build()
}

fn connect(handler: &McpOverAcpHandler, acp_url: &str, session_id: Option<&str>) -> String {
    handler
        .connect(McpConnectRequest {
            connection_id: None,
            acp_url: acp_url.to_string(),
            session_id: session_id.map(str::to_string),
        })
        .unwrap()
        .connection_id
}

fn message(connection_id: &str, method: &str, params: Option<Value>) -> McpMessageRequest {
    McpMessageRequest {
        connection_id: connection_id.to_string(),
        method: method.to_string(),
        params,
    }
}

#[tokio::test]
async fn connect_message_disconnect() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());

    let connection_id = connect(&handler, &acp_url, Some("s1"));
    Uuid::parse_str(&connection_id).expect("generated ids are UUIDs");

    let listed = handler
        .message(message(&connection_id, "tools/list", None))
        .await
        .unwrap();
    let names: Vec<_> = listed["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["add", "whoami"]);
    assert!(handler.tools_discovered("s1"));

    let disconnect = McpDisconnectRequest {
        connection_id: connection_id.clone(),
    };
    handler.disconnect(disconnect.clone());
    handler.disconnect(disconnect);
    assert_eq!(handler.connection_count(), 0);

    let error = handler
        .message(message(&connection_id, "tools/list", None))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("unknown connection"), "{error}");
}

#[tokio::test]
async fn connect_to_unknown_url() {
    let handler = McpOverAcpHandler::new();
    handler.register(calculator());

    let error = handler
        .connect(McpConnectRequest {
            connection_id: None,
            acp_url: "acp:not-registered".to_string(),
            session_id: None,
        })
        .unwrap_err();
    assert_eq!(error.to_response_error().code, jsonrpc::INVALID_PARAMS);
    assert!(error.to_string().contains("no MCP server registered"), "{error}");
}

#[tokio::test]
async fn caller_chosen_connection_id_is_kept() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());

    let response = handler
        .connect(McpConnectRequest {
            connection_id: Some("conn-1".to_string()),
            acp_url,
            session_id: None,
        })
        .unwrap();
    assert_eq!(response.connection_id, "conn-1");
    assert_eq!(response.server_info.name, "calculator");
    assert_eq!(response.tools.map(|tools| tools.len()), Some(2));
}

#[tokio::test]
async fn unregistered_server_is_unreachable() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());
    assert!(handler.has_servers());

    assert!(handler.unregister(&acp_url).is_some());
    assert!(!handler.has_servers());
    assert!(
        handler
            .connect(McpConnectRequest {
                connection_id: None,
                acp_url,
                session_id: None,
            })
            .is_err()
    );
}

#[tokio::test]
async fn discovery_wait_times_out() {
    let handler = McpOverAcpHandler::new();

    let start = Instant::now();
    handler
        .wait_for_tools_discovery("quiet", Duration::from_millis(50))
        .await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    // Released for good.
    assert!(handler.tools_discovered("quiet"));
    let start = Instant::now();
    handler
        .wait_for_tools_discovery("quiet", Duration::from_secs(30))
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn one_tools_list_releases_every_waiter() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());
    let connection_id = connect(&handler, &acp_url, Some("s1"));

    let waiter = |handler: McpOverAcpHandler| {
        tokio::spawn(async move {
            handler
                .wait_for_tools_discovery("s1", Duration::from_secs(30))
                .await;
            Instant::now()
        })
    };
    let first = waiter(handler.clone());
    let second = waiter(handler.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    let listed_at = Instant::now();
    handler
        .message(message(&connection_id, "tools/list", None))
        .await
        .unwrap();

    let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
        (first.await.unwrap(), second.await.unwrap())
    })
    .await
    .expect("waiters are released");
    assert!(first >= listed_at);
    assert!(second >= listed_at);
}

#[tokio::test]
async fn late_session_binds_earlier_connections() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());

    let early = connect(&handler, &acp_url, None);
    handler
        .message(message(&early, "tools/list", None))
        .await
        .unwrap();
    assert!(!handler.tools_discovered("late"));

    handler.set_session_id("late");
    assert_eq!(handler.session_id().as_deref(), Some("late"));
    assert!(handler.tools_discovered("late"));

    let later = connect(&handler, &acp_url, None);
    let result = handler
        .message(message(
            &later,
            "tools/call",
            Some(json!({"name": "whoami", "arguments": {}})),
        ))
        .await
        .unwrap();
    assert_eq!(result["structuredContent"], json!({"sessionId": "late"}));
}

#[tokio::test]
async fn finished_sessions_drop_their_latches() {
    let handler = McpOverAcpHandler::new();
    let acp_url = handler.register(calculator());

    handler.set_session_id("old");
    let connection_id = connect(&handler, &acp_url, None);
    handler
        .message(message(&connection_id, "tools/list", None))
        .await
        .unwrap();
    assert!(handler.tools_discovered("old"));

    // Still bound to an open connection.
    handler.set_session_id("new");
    assert!(handler.tools_discovered("old"));

    handler.disconnect(McpDisconnectRequest { connection_id });
    assert!(!handler.tools_discovered("old"));

    // The current session keeps its latch with no connection at all.
    handler
        .wait_for_tools_discovery("new", Duration::from_millis(10))
        .await;
    handler.set_session_id("new");
    assert!(handler.tools_discovered("new"));
}

#[tokio::test]
async fn unknown_tunnel_method() {
    let handler = McpOverAcpHandler::new();
    let error = handler.dispatch("mcp/reconnect", None).unwrap_err();
    assert_eq!(error.to_response_error().code, jsonrpc::METHOD_NOT_FOUND);
}

/// Create a session whose `session/new` the agent answers with `session_id`.
/// Returns the `mcpServers` the agent was handed.
async fn new_session(chain: &mut Chain, session_id: &str) -> Value {
    chain
        .client
        .send(request("new", "session/new", json!({"cwd": "/tmp", "mcpServers": []})))
        .unwrap();
    let (hop_id, params) = expect_request(recv(chain.agent()).await, "session/new");
    chain
        .agent()
        .send(response(hop_id, Ok(json!({"sessionId": session_id}))))
        .unwrap();
    let (id, _) = expect_response(recv(&mut chain.client).await);
    assert_eq!(id, Id::from("new"));
    params.unwrap()["mcpServers"].clone()
}

/// Send a request from the agent and wait for the conductor's answer to it.
async fn agent_call(
    chain: &mut Chain,
    id: i64,
    method: &str,
    params: Value,
) -> Result<Value, jsonrpc::ResponseError> {
    chain
        .agent()
        .send(request(Id::Number(id), method, params))
        .unwrap();
    let (got, result) = expect_response(recv(chain.agent()).await);
    assert_eq!(got, Id::Number(id));
    result
}

#[tokio::test]
async fn agent_calls_a_tool_through_the_chain() {
    let server = calculator();
    let acp_url = server.acp_url();
    let mut chain = start_chain(1, |c| c.with_mcp_server(server));
    initialize(&mut chain).await;

    // The proxy forwards session/new; the agent is handed the server.
    chain
        .client
        .send(request("new", "session/new", json!({"cwd": "/tmp"})))
        .unwrap();
    let (proxy_hop, params) = expect_request(recv(chain.proxy(0)).await, "session/new");
    assert_eq!(params, Some(json!({"cwd": "/tmp"})));
    chain
        .proxy(0)
        .send(request(Id::Number(10), "session/new", params.unwrap()))
        .unwrap();
    let (agent_hop, params) = expect_request(recv(chain.agent()).await, "session/new");
    assert_eq!(
        params.unwrap()["mcpServers"],
        json!([{"type": "http", "name": "calculator", "url": acp_url}])
    );
    chain
        .agent()
        .send(response(agent_hop, Ok(json!({"sessionId": "s1"}))))
        .unwrap();
    let (_, result) = expect_response(recv(chain.proxy(0)).await);
    chain.proxy(0).send(response(proxy_hop, result)).unwrap();
    expect_response(recv(&mut chain.client).await);

    let connected = agent_call(&mut chain, 100, "_mcp/connect", json!({"acp_url": acp_url}))
        .await
        .unwrap();
    let connection_id = connected["connectionId"].as_str().unwrap().to_string();
    assert_eq!(connected["serverInfo"]["name"], "calculator");

    let result = agent_call(
        &mut chain,
        101,
        "_mcp/message",
        json!({
            "connectionId": connection_id,
            "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 2, "b": 3}},
        }),
    )
    .await
    .unwrap();
    assert_eq!(result["structuredContent"], json!({"sum": 5}));
    assert_eq!(result["isError"], json!(false));

    let result = agent_call(
        &mut chain,
        102,
        "_mcp/disconnect",
        json!({"connectionId": connection_id}),
    )
    .await
    .unwrap();
    assert_eq!(result, Value::Null);

    let error = agent_call(
        &mut chain,
        103,
        "_mcp/message",
        json!({"connectionId": connection_id, "method": "tools/list"}),
    )
    .await
    .unwrap_err();
    assert_eq!(error.code, jsonrpc::INVALID_PARAMS);
    assert!(error.message.contains("unknown connection"), "{error}");

    // None of the tunnel traffic left the conductor.
    assert_quiet(chain.proxy(0)).await;
    assert_quiet(&mut chain.client).await;
}

#[tokio::test]
async fn servers_already_listed_are_not_repeated() {
    let server = calculator();
    let acp_url = server.acp_url();
    let mut chain = start_chain(0, |c| c.with_mcp_server(server));
    initialize(&mut chain).await;

    let entry = json!({"type": "http", "name": "calculator", "url": acp_url});
    chain
        .client
        .send(request("new", "session/new", json!({"mcpServers": [entry.clone()]})))
        .unwrap();
    let (_, params) = expect_request(recv(chain.agent()).await, "session/new");
    assert_eq!(params.unwrap()["mcpServers"], json!([entry]));
}

#[tokio::test]
async fn prompt_waits_for_tools_discovery() {
    let server = calculator();
    let acp_url = server.acp_url();
    let mut chain = start_chain(0, |c| {
        c.with_mcp_server(server)
            .with_config(ConductorConfig::default().tools_discovery_timeout(Duration::from_secs(30)))
    });
    initialize(&mut chain).await;
    new_session(&mut chain, "s1").await;

    chain
        .client
        .send(request("p1", "session/prompt", json!({"sessionId": "s1", "prompt": []})))
        .unwrap();
    chain
        .client
        .send(JsonRpcMessage::notification(
            "session/cancel",
            json!({"sessionId": "s1"}),
        ))
        .unwrap();
    assert_quiet(chain.agent()).await;

    // Without a session id, the connection is bound to the current session.
    let connected = agent_call(&mut chain, 1, "_mcp/connect", json!({"acp_url": acp_url}))
        .await
        .unwrap();
    let connection_id = connected["connectionId"].as_str().unwrap().to_string();
    chain
        .agent()
        .send(request(
            Id::Number(2),
            "_mcp/message",
            json!({"connectionId": connection_id, "method": "tools/list"}),
        ))
        .unwrap();

    // The tools/list answer may land before or after the released prompt,
    // but the prompt always precedes what the client sent after it.
    let mut routed = Vec::new();
    while routed.len() < 3 {
        routed.push(recv(chain.agent()).await);
    }
    let client_traffic: Vec<_> = routed
        .iter()
        .filter_map(|message| message.method().map(str::to_string))
        .collect();
    assert_eq!(client_traffic, ["session/prompt", "session/cancel"]);
}

#[tokio::test]
async fn client_replies_are_not_held_behind_a_waiting_prompt() {
    let mut chain = start_chain(0, |c| {
        c.with_mcp_server(calculator())
            .with_config(ConductorConfig::default().tools_discovery_timeout(Duration::from_secs(30)))
    });
    initialize(&mut chain).await;
    new_session(&mut chain, "s1").await;

    chain
        .agent()
        .send(request(Id::Number(7), "session/request_permission", json!({"sessionId": "s1"})))
        .unwrap();
    let (permission, _) =
        expect_request(recv(&mut chain.client).await, "session/request_permission");

    chain
        .client
        .send(request("p1", "session/prompt", json!({"sessionId": "s1"})))
        .unwrap();
    chain
        .client
        .send(response(permission, Ok(json!({"outcome": "allowed"}))))
        .unwrap();

    let (id, result) = expect_response(recv(chain.agent()).await);
    assert_eq!((id, result.unwrap()), (Id::Number(7), json!({"outcome": "allowed"})));
    assert_quiet(chain.agent()).await;
}

#[tokio::test]
async fn prompt_proceeds_after_discovery_timeout() {
    let mut chain = start_chain(0, |c| {
        c.with_mcp_server(calculator())
            .with_config(ConductorConfig::default().tools_discovery_timeout(Duration::from_millis(100)))
    });
    initialize(&mut chain).await;
    new_session(&mut chain, "s2").await;

    let start = Instant::now();
    chain
        .client
        .send(request("p1", "session/prompt", json!({"sessionId": "s2"})))
        .unwrap();
    expect_request(recv(chain.agent()).await, "session/prompt");
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Later prompts on the same session are not held again.
    let start = Instant::now();
    chain
        .client
        .send(request("p2", "session/prompt", json!({"sessionId": "s2"})))
        .unwrap();
    expect_request(recv(chain.agent()).await, "session/prompt");
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn prompts_pass_straight_through_without_servers() {
    let mut chain = start_chain(0, |c| c);
    initialize(&mut chain).await;
    let servers = new_session(&mut chain, "s3").await;
    assert_eq!(servers, json!([]));

    chain
        .client
        .send(request("p1", "session/prompt", json!({"sessionId": "s3"})))
        .unwrap();
    expect_request(recv(chain.agent()).await, "session/prompt");
}
