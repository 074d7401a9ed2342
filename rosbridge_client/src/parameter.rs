//! Blocking and non-blocking accessors over the standard `rosapi`
//! parameter services.
//!
//! `rosapi/GetParam` and `rosapi/SetParam` carry the parameter's value as a
//! JSON-encoded string (that's how ROS's own `rosapi` node does it, since
//! `.srv` files have no notion of an open value type); this wrapper hides
//! that encoding so callers just pass/receive [`Value`].

use crate::protocol::Multiplexer;
use crate::service::ServiceClient;
use rosbridge_common::{Error, Result, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A parameter name bound to the standard `get_param` / `set_param` /
/// `delete_param` rosapi services.
#[derive(Clone)]
pub struct Parameter {
    get_client: ServiceClient,
    set_client: ServiceClient,
    delete_client: ServiceClient,
    name: String,
}

impl Parameter {
    pub fn new(mux: Arc<Multiplexer>, name: impl Into<String>) -> Self {
        Self {
            get_client: ServiceClient::new(mux.clone(), "/rosapi/get_param"),
            set_client: ServiceClient::new(mux.clone(), "/rosapi/set_param"),
            delete_client: ServiceClient::new(mux, "/rosapi/delete_param"),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetches the current value, awaiting the reply without blocking the
    /// calling thread.
    pub async fn get(&self) -> Result<Value> {
        let response = self.get_client.call(json!({ "name": self.name, "default": "" })).await?;
        decode_param_value(&response)
    }

    /// Fetches the current value with an explicit timeout.
    pub async fn get_with_timeout(&self, timeout: Duration) -> Result<Value> {
        let response = self
            .get_client
            .call_with_timeout(json!({ "name": self.name, "default": "" }), timeout)
            .await?;
        decode_param_value(&response)
    }

    /// Sets the value, awaiting acknowledgement.
    pub async fn set(&self, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        self.set_client.call(json!({ "name": self.name, "value": encoded })).await?;
        Ok(())
    }

    pub async fn set_with_timeout(&self, value: Value, timeout: Duration) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        self.set_client
            .call_with_timeout(json!({ "name": self.name, "value": encoded }), timeout)
            .await?;
        Ok(())
    }

    /// Deletes the parameter from the server.
    pub async fn delete(&self) -> Result<()> {
        self.delete_client.call(json!({ "name": self.name })).await?;
        Ok(())
    }

    pub async fn delete_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.delete_client
            .call_with_timeout(json!({ "name": self.name }), timeout)
            .await?;
        Ok(())
    }

    /// Blocking variant of [`Parameter::get`].
    pub fn get_blocking(&self, timeout: Duration) -> Result<Value> {
        tokio::runtime::Handle::current().block_on(self.get_with_timeout(timeout))
    }

    pub fn set_blocking(&self, value: Value, timeout: Duration) -> Result<()> {
        tokio::runtime::Handle::current().block_on(self.set_with_timeout(value, timeout))
    }

    pub fn delete_blocking(&self, timeout: Duration) -> Result<()> {
        tokio::runtime::Handle::current().block_on(self.delete_with_timeout(timeout))
    }
}

fn decode_param_value(response: &Value) -> Result<Value> {
    let raw = response
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidFrame("get_param response missing string 'value' field".to_string()))?;
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    // rosapi encodes the value as a JSON string; fall back to a bare
    // string for parameters a non-ROS node stored as plain text.
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_json_encoded_value() {
        let response = json!({ "value": "42" });
        assert_eq!(decode_param_value(&response).unwrap(), json!(42));
    }

    #[test]
    fn falls_back_to_plain_string() {
        let response = json!({ "value": "not json at all {{{" });
        assert_eq!(decode_param_value(&response).unwrap(), json!("not json at all {{{"));
    }

    #[test]
    fn empty_value_is_null() {
        let response = json!({ "value": "" });
        assert_eq!(decode_param_value(&response).unwrap(), Value::Null);
    }
}
