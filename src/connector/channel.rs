use acp_proto::{InitializeRequest, Result};
use futures::future::BoxFuture;

use super::{Connection, Connector};

/// Wires the conductor to an in-process component through linked queues.
#[derive(Debug)]
pub struct ChannelConnector {
    connection: Connection,
}

impl ChannelConnector {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// A connector named `name` plus the component's end of the link.
    pub fn pair(name: impl Into<String>) -> (Self, Connection) {
        let (near, far) = Connection::pair(name);
        (Self::new(near), far)
    }
}

impl Connector for ChannelConnector {
    fn name(&self) -> String {
        self.connection.name().to_string()
    }

    fn connect(self: Box<Self>, _request: &InitializeRequest) -> BoxFuture<'static, Result<Connection>> {
        Box::pin(async move { Ok(self.connection) })
    }
}
