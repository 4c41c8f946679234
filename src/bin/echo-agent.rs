//! A stand-in agent for tests: answers every request with
//! `{"method": <method>, "params": <params>}` and ignores everything else.

use conductor::{acp_proto::JsonRpcMessage, connector::Connection};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut connection = Connection::stdio();
    while let Some(message) = connection.recv().await {
        if let JsonRpcMessage::Request { id, method, params } = message? {
            tracing::debug!(%id, %method, "echoing");
            let params = params.unwrap_or(Value::Null);
            connection.send(JsonRpcMessage::response(
                id,
                Ok(json!({ "method": method, "params": params })),
            ))?;
        }
    }
    connection.close().await;
    Ok(())
}
