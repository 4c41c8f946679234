use std::process::Stdio;

use acp_proto::{Error, InitializeRequest, JsonRpcMessage, Result};
use futures::{StreamExt as _, future::BoxFuture, stream};
use tokio::process::Command;

use super::{Connection, Connector};
use crate::config::ComponentCommand;

/// Spawns a component as a child process speaking line-delimited JSON on stdio.
///
/// The child's stderr is inherited. The child is killed when its connection
/// is dropped.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    command: ComponentCommand,
}

impl ProcessConnector {
    pub fn new(command: ComponentCommand) -> Self {
        Self { command }
    }

    fn spawn(self) -> Result<Connection> {
        let label = self.command.to_string();
        let ComponentCommand { command, args, env } = self.command;

        let mut child = Command::new(&command)
            .args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: label.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::closed(format!("`{label}` has no stdio pipes")));
        };

        tracing::info!(component = %label, pid = ?child.id(), "spawned component");

        let Connection {
            sender,
            incoming,
            writer,
        } = Connection::from_io(label.clone(), stdout, stdin);

        // Once stdout is exhausted, report how the process ended. The child is
        // owned by this stream so dropping the connection kills it.
        let exit = stream::once(async move {
            let error = match child.wait().await {
                Ok(status) => Error::closed(format!("`{label}` exited ({status})")),
                Err(error) => Error::Io(error),
            };
            Err::<JsonRpcMessage, _>(error)
        });

        Ok(Connection {
            sender,
            incoming: incoming.chain(exit).boxed(),
            writer,
        })
    }
}

impl Connector for ProcessConnector {
    fn name(&self) -> String {
        self.command.to_string()
    }

    fn connect(self: Box<Self>, _request: &InitializeRequest) -> BoxFuture<'static, Result<Connection>> {
        Box::pin(async move { self.spawn() })
    }
}
