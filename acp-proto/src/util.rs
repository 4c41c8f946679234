use serde::{Serialize, de::DeserializeOwned};

use crate::Error;

/// Convert between two serde types by way of a JSON value.
pub fn json_cast<N, M>(params: N) -> Result<M, Error>
where
    N: Serialize,
    M: DeserializeOwned,
{
    let json = serde_json::to_value(params)?;
    serde_json::from_value(json).map_err(|e| Error::invalid_params(e.to_string()))
}

/// Parse optional request params, treating absent params as `{}`.
pub fn parse_params<M: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<M, Error> {
    let params = params.unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| Error::invalid_params(e.to_string()))
}
