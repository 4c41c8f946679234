//! Per-connection ordering.
//!
//! Each connection gets a pump task that forwards its inbound stream into the
//! router channel, one message at a time and in arrival order. The bounded
//! router channel provides back-pressure. On the router side, a
//! [`MessageQueue`] holds a source's messages while an earlier message from
//! the same source is suspended (waiting for instantiation or tools
//! discovery), and gives them back in order once it resumes. Responses are
//! never held: they answer requests the peer received earlier and do not
//! depend on the suspended message.

use std::collections::VecDeque;

use acp_proto::{JsonRpcMessage, Result};
use futures::{SinkExt as _, StreamExt as _, channel::mpsc, stream::BoxStream};
use tokio::task::JoinHandle;

use crate::conductor::{ConductorMessage, SourceIndex};

pub(crate) fn spawn_pump(
    source: SourceIndex,
    mut incoming: BoxStream<'static, Result<JsonRpcMessage>>,
    mut conductor_tx: mpsc::Sender<ConductorMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let error = loop {
            match incoming.next().await {
                Some(Ok(message)) => {
                    if conductor_tx
                        .send(ConductorMessage::Incoming { source, message })
                        .await
                        .is_err()
                    {
                        // Router is gone.
                        return;
                    }
                }
                Some(Err(error)) => break Some(error),
                None => break None,
            }
        };
        let _ = conductor_tx
            .send(ConductorMessage::Closed { source, error })
            .await;
    })
}

#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    suspended: bool,
    backlog: VecDeque<JsonRpcMessage>,
}

impl MessageQueue {
    /// Returns the message if it may be processed now, or keeps it for later.
    pub fn admit(&mut self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        if matches!(message, JsonRpcMessage::Response { .. }) {
            return Some(message);
        }
        if self.suspended || !self.backlog.is_empty() {
            self.backlog.push_back(message);
            None
        } else {
            Some(message)
        }
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The next held message, unless the queue is suspended again.
    pub fn next_ready(&mut self) -> Option<JsonRpcMessage> {
        if self.suspended {
            None
        } else {
            self.backlog.pop_front()
        }
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn clear(&mut self) {
        self.backlog.clear();
    }
}
