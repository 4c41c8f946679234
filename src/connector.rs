//! Duplex message channels to components.
//!
//! A [`Connection`] is a sender plus a lazy stream of inbound messages. The
//! stream ends when the peer goes away; a peer that dies reports why as a
//! final `Err` item.

use std::{fmt, sync::Arc};

use acp_proto::{Error, InitializeRequest, JsonRpcMessage, Result};
use futures::{
    SinkExt as _, StreamExt as _,
    channel::mpsc,
    future::BoxFuture,
    stream::BoxStream,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

mod channel;
mod process;

pub use channel::ChannelConnector;
pub use process::ProcessConnector;

/// Something that can produce a live [`Connection`] to a component.
///
/// Connectors are used once: `connect` consumes them.
pub trait Connector: Send {
    /// A human-readable label for logs.
    fn name(&self) -> String;

    fn connect(self: Box<Self>, request: &InitializeRequest) -> BoxFuture<'static, Result<Connection>>;
}

/// The sending half of a connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<JsonRpcMessage>,
}

impl ConnectionSender {
    pub fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.tx
            .unbounded_send(message)
            .map_err(|_| Error::closed(format!("`{}` is no longer accepting messages", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ConnectionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionSender").field(&self.name).finish()
    }
}

pub struct Connection {
    pub(crate) sender: ConnectionSender,
    pub(crate) incoming: BoxStream<'static, Result<JsonRpcMessage>>,

    /// Task writing outgoing lines, if this connection is backed by I/O.
    /// It finishes once every sender is dropped and the queue is flushed.
    pub(crate) writer: Option<JoinHandle<()>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.sender.name)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Frame newline-delimited JSON-RPC over a reader/writer pair.
    ///
    /// Lines that do not parse as a message are logged and skipped.
    pub fn from_io<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name: Arc<str> = name.into().into();
        let (tx, mut outgoing_rx) = mpsc::unbounded::<JsonRpcMessage>();

        let writer = tokio::spawn({
            let name = name.clone();
            async move {
                let mut lines = FramedWrite::new(writer, LinesCodec::new());
                while let Some(message) = outgoing_rx.next().await {
                    let line = match message.to_line() {
                        Ok(line) => line,
                        Err(error) => {
                            tracing::error!(connection = %name, %error, "failed to serialize message");
                            continue;
                        }
                    };
                    if let Err(error) = lines.send(line).await {
                        tracing::warn!(connection = %name, %error, "write failed, closing");
                        break;
                    }
                }
            }
        });

        let incoming = FramedRead::new(reader, LinesCodec::new())
            .filter_map({
                let name = name.clone();
                move |line| {
                    let name = name.clone();
                    async move { parse_line(&name, line) }
                }
            })
            .boxed();

        Connection {
            sender: ConnectionSender { name, tx },
            incoming,
            writer: Some(writer),
        }
    }

    /// The conductor's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::from_io("client", tokio::io::stdin(), tokio::io::stdout())
    }

    /// Two linked in-memory ends. Dropping one end closes the other.
    pub fn pair(name: impl Into<String>) -> (Connection, Connection) {
        let name: String = name.into();
        let (near_tx, near_rx) = mpsc::unbounded();
        let (far_tx, far_rx) = mpsc::unbounded();

        let near = Connection {
            sender: ConnectionSender {
                name: name.into(),
                tx: far_tx,
            },
            incoming: near_rx.map(Ok).boxed(),
            writer: None,
        };
        let far = Connection {
            sender: ConnectionSender {
                name: "conductor".into(),
                tx: near_tx,
            },
            incoming: far_rx.map(Ok).boxed(),
            writer: None,
        };
        (near, far)
    }

    /// Name of the peer this connection sends to.
    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    pub fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.sender.send(message)
    }

    /// The next inbound message, or `None` once the peer has gone away.
    pub async fn recv(&mut self) -> Option<Result<JsonRpcMessage>> {
        self.incoming.next().await
    }

    /// Stop reading and wait until everything already sent has been written.
    pub async fn close(self) {
        let Connection {
            sender,
            incoming,
            writer,
        } = self;
        drop(incoming);
        drop(sender);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

fn parse_line(name: &str, line: Result<String, LinesCodecError>) -> Option<Result<JsonRpcMessage>> {
    match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => match JsonRpcMessage::from_line(&line) {
            Ok(message) => Some(Ok(message)),
            Err(error) => {
                tracing::warn!(connection = name, %error, "skipping malformed line");
                None
            }
        },
        Err(LinesCodecError::Io(error)) => Some(Err(Error::Io(error))),
        Err(error) => Some(Err(Error::closed(format!("`{name}`: {error}")))),
    }
}
