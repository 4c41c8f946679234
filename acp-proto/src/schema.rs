use std::marker::PhantomData;

use schemars::JsonSchema;
use serde_json::Value;

/// Anything that can describe itself as a JSON Schema.
///
/// Tool input and output shapes are declared with values of this trait. The
/// schema is advertised to MCP clients as-is; payloads are never validated
/// against it.
pub trait ToJsonSchema {
    fn to_json_schema(&self) -> Value;
}

impl ToJsonSchema for Value {
    fn to_json_schema(&self) -> Value {
        self.clone()
    }
}

impl<S: ToJsonSchema + ?Sized> ToJsonSchema for &S {
    fn to_json_schema(&self) -> Value {
        (**self).to_json_schema()
    }
}

/// The schema `schemars` derives for `T`.
pub struct SchemaOf<T>(PhantomData<fn() -> T>);

impl<T> SchemaOf<T> {
    pub fn new() -> Self {
        SchemaOf(PhantomData)
    }
}

impl<T> Default for SchemaOf<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: JsonSchema> ToJsonSchema for SchemaOf<T> {
    fn to_json_schema(&self) -> Value {
        let schema = schemars::schema_for!(T);
        serde_json::to_value(schema).unwrap_or(Value::Null)
    }
}
