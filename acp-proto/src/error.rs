use crate::jsonrpc::{self, ResponseError};

/// Errors produced while setting up or running a conductor session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The instantiator was set up incorrectly (e.g., no agent command).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A component process could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O was attempted after the peer closed, or a peer went away unexpectedly.
    #[error("connection closed: {0}")]
    ClosedConnection(String),

    /// The peer sent something we cannot make sense of.
    #[error("protocol error: {message}")]
    Protocol { code: i32, message: String },

    /// A tool handler failed. Recovered into an error-flagged tool result.
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn configuration(message: impl ToString) -> Self {
        Error::Configuration(message.to_string())
    }

    pub fn closed(message: impl ToString) -> Self {
        Error::ClosedConnection(message.to_string())
    }

    /// A protocol error for a request the peer should not have sent.
    pub fn protocol(message: impl ToString) -> Self {
        Error::Protocol {
            code: jsonrpc::INVALID_REQUEST,
            message: message.to_string(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Error::Protocol {
            code: jsonrpc::METHOD_NOT_FOUND,
            message: format!("method not found: `{method}`"),
        }
    }

    pub fn invalid_params(message: impl ToString) -> Self {
        Error::Protocol {
            code: jsonrpc::INVALID_PARAMS,
            message: message.to_string(),
        }
    }

    /// The JSON-RPC error object to send when this error answers a request.
    pub fn to_response_error(&self) -> ResponseError {
        let code = match self {
            Error::Protocol { code, .. } => *code,
            Error::ClosedConnection(_) => jsonrpc::COMMUNICATION_FAILURE,
            Error::Json(_) => jsonrpc::INVALID_PARAMS,
            Error::Configuration(_)
            | Error::Spawn { .. }
            | Error::ToolExecution { .. }
            | Error::Io(_) => jsonrpc::INTERNAL_ERROR,
        };
        let message = match self {
            Error::Protocol { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ResponseError::new(code, message)
    }
}

impl From<ResponseError> for Error {
    fn from(error: ResponseError) -> Self {
        Error::Protocol {
            code: error.code,
            message: error.message,
        }
    }
}
