//! Blocking/non-blocking wrappers for the `rosapi` meta-query services:
//! topic/service discovery, type lookups, and node listing, built on
//! [`crate::service::ServiceClient`].
//!
//! This is the library surface a `topic list|type|find`, `service
//! list|type|find`, `msg info`/`srv info` style CLI would be built on top
//! of; the CLI itself is out of scope here.

use crate::protocol::Multiplexer;
use crate::service::ServiceClient;
use rosbridge_common::{Result, Value};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Façade over the standard `rosapi` services. Construct once per session
/// and reuse; each call allocates its own correlation id under the hood.
#[derive(Clone)]
pub struct RosApi {
    mux: Arc<Multiplexer>,
    default_timeout: Duration,
}

impl RosApi {
    pub fn new(mux: Arc<Multiplexer>) -> Self {
        Self { mux, default_timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn client(&self, service: &str) -> ServiceClient {
        ServiceClient::new(self.mux.clone(), service).with_default_timeout(self.default_timeout)
    }

    /// Every topic currently advertised on the graph, as `(name, type)`
    /// pairs.
    pub async fn topics(&self) -> Result<Vec<(String, String)>> {
        let response = self.client("/rosapi/topics").call(Value::Null).await?;
        let names = string_array(&response, "topics");
        let types = string_array(&response, "types");
        Ok(names.into_iter().zip(types).collect())
    }

    /// The message type published on `topic`.
    pub async fn topic_type(&self, topic: &str) -> Result<String> {
        let response = self.client("/rosapi/topic_type").call(json!({ "topic": topic })).await?;
        Ok(response.get("type").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    /// All topic names currently publishing `message_type`.
    pub async fn find_topics(&self, message_type: &str) -> Result<Vec<String>> {
        let response = self
            .client("/rosapi/topics_for_type")
            .call(json!({ "type": message_type }))
            .await?;
        Ok(string_array(&response, "topics"))
    }

    /// Every service currently advertised on the graph.
    pub async fn services(&self) -> Result<Vec<String>> {
        let response = self.client("/rosapi/services").call(Value::Null).await?;
        Ok(string_array(&response, "services"))
    }

    /// The service type of `service`.
    pub async fn service_type(&self, service: &str) -> Result<String> {
        let response = self.client("/rosapi/service_type").call(json!({ "service": service })).await?;
        Ok(response.get("type").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    /// All service names currently advertising `service_type`.
    pub async fn find_services(&self, service_type: &str) -> Result<Vec<String>> {
        let response = self
            .client("/rosapi/services_for_type")
            .call(json!({ "type": service_type }))
            .await?;
        Ok(string_array(&response, "services"))
    }

    /// Every node currently in the graph.
    pub async fn nodes(&self) -> Result<Vec<String>> {
        let response = self.client("/rosapi/nodes").call(Value::Null).await?;
        Ok(string_array(&response, "nodes"))
    }

    /// Raw field/type breakdown for a message type, as returned by
    /// `rosapi/message_details`. Left as an open [`Value`] rather than a
    /// typed tree since the engine core is never schema-aware.
    pub async fn message_details(&self, message_type: &str) -> Result<Value> {
        self.client("/rosapi/message_details").call(json!({ "type": message_type })).await
    }

    /// Raw field/type breakdown for a service type's request, as returned
    /// by `rosapi/service_request_details`.
    pub async fn service_request_details(&self, service_type: &str) -> Result<Value> {
        self.client("/rosapi/service_request_details")
            .call(json!({ "type": service_type }))
            .await
    }

    /// Every parameter name currently on the parameter server.
    pub async fn param_names(&self) -> Result<Vec<String>> {
        let response = self.client("/rosapi/get_param_names").call(Value::Null).await?;
        Ok(string_array(&response, "names"))
    }

    pub fn topics_blocking(&self) -> Result<Vec<(String, String)>> {
        block_on(self.topics())
    }

    pub fn services_blocking(&self) -> Result<Vec<String>> {
        block_on(self.services())
    }

    pub fn nodes_blocking(&self) -> Result<Vec<String>> {
        block_on(self.nodes())
    }
}

fn string_array(value: &Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn block_on<T>(fut: impl Future<Output = T>) -> T {
    tokio::runtime::Handle::current().block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_parallel_string_arrays() {
        let response = json!({ "topics": ["/chatter", "/odom"], "types": ["std_msgs/String", "nav_msgs/Odometry"] });
        let names = string_array(&response, "topics");
        let types = string_array(&response, "types");
        let zipped: Vec<(String, String)> = names.into_iter().zip(types).collect();
        assert_eq!(
            zipped,
            vec![
                ("/chatter".to_string(), "std_msgs/String".to_string()),
                ("/odom".to_string(), "nav_msgs/Odometry".to_string()),
            ]
        );
    }

    #[test]
    fn missing_field_yields_empty_vec() {
        let response = json!({});
        assert!(string_array(&response, "topics").is_empty());
    }
}
