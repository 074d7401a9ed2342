//! The top-level façade tying transport, connection lifecycle, and the
//! protocol multiplexer into one handle.

use crate::actionlib::client::ActionClient;
use crate::actionlib::server::SimpleActionServer;
use crate::connection::{Backoff, ConnectionManager};
use crate::events::EventBus;
use crate::id::IdAllocator;
use crate::parameter::Parameter;
use crate::protocol::Multiplexer;
use crate::rosapi::RosApi;
use crate::service::{self, ServiceClient, ServiceServerHandle};
use crate::topic::Topic;
use crate::transport::{Connector, WsConnector};
use rosbridge_common::{Result, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Construction-time settings for a [`RosBridge`] session.
#[derive(Debug, Clone)]
pub struct RosBridgeConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub default_timeout: Duration,
    /// How long [`RosBridge::run`] waits for the first `ready` event before
    /// failing with `NotReady`. Defaults to 10 seconds.
    pub ready_timeout: Duration,
    pub authentication: Option<Value>,
}

impl Default for RosBridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            secure: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 0,
            default_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(10),
            authentication: None,
        }
    }
}

impl RosBridgeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_authentication(mut self, auth: Value) -> Self {
        self.authentication = Some(auth);
        self
    }

    fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            max_retries: self.max_retries,
        }
    }
}

/// A rosbridge v2 session: owns the connection lifecycle and the protocol
/// multiplexer, and is the entry point for constructing every other handle
/// (topics, services, parameters, the rosapi façade, actions).
///
/// Generic over the [`Connector`] so tests can substitute
/// [`crate::transport::mock::MockConnector`]; application code uses the
/// default [`WsConnector`] via [`RosBridge::connect`].
pub struct RosBridge<C: Connector = WsConnector> {
    conn: ConnectionManager<C>,
    mux: Arc<Multiplexer>,
    events: EventBus,
    ids: Arc<IdAllocator>,
    default_timeout: Duration,
    ready_timeout: Duration,
}

impl RosBridge<WsConnector> {
    /// Builds a session with the default WebSocket connector, matching
    /// `ws(s)://<host>:<port>`.
    pub fn connect(config: RosBridgeConfig) -> Self {
        Self::with_connector(config, WsConnector)
    }
}

impl<C: Connector> RosBridge<C> {
    pub fn with_connector(config: RosBridgeConfig, connector: C) -> Self {
        let events = EventBus::new();
        let ids = Arc::new(IdAllocator::new());
        let conn = ConnectionManager::new(connector, config.url(), config.authentication.clone(), config.backoff(), events.clone());
        let mux = Arc::new(Multiplexer::new(Arc::new(conn.clone()), events.clone(), ids.clone()));
        Self {
            conn,
            mux,
            events,
            ids,
            default_timeout: config.default_timeout,
            ready_timeout: config.ready_timeout,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.is_connected().await
    }

    pub async fn is_ready(&self) -> bool {
        self.conn.is_ready().await
    }

    /// Background mode: spawns the I/O loop and waits up to the configured
    /// `ready_timeout` (10 s by default) for the first `ready` event.
    pub async fn run(&self) -> Result<()> {
        self.run_with_timeout(self.ready_timeout).await
    }

    /// Like [`RosBridge::run`] but with an explicit readiness wait,
    /// overriding the configured `ready_timeout`.
    pub async fn run_with_timeout(&self, ready_timeout: Duration) -> Result<()> {
        self.conn.set_multiplexer(&self.mux).await;
        self.conn.run(ready_timeout).await
    }

    /// Foreground mode: blocks the calling task in the I/O loop until
    /// [`RosBridge::close`] is called elsewhere.
    pub async fn run_forever(&self) {
        self.conn.set_multiplexer(&self.mux).await;
        self.conn.run_forever().await
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    pub fn topic(&self, name: impl Into<String>, message_type: impl Into<String>) -> Topic {
        Topic::new(self.mux.clone(), name, message_type)
    }

    pub fn service(&self, name: impl Into<String>) -> ServiceClient {
        ServiceClient::new(self.mux.clone(), name).with_default_timeout(self.default_timeout)
    }

    /// Advertises `name` as a local service server, routing each incoming
    /// call through `callback`.
    pub async fn advertise_service<F, Fut>(&self, name: impl Into<String>, service_type: impl Into<String>, callback: F) -> Result<ServiceServerHandle>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        service::advertise_service(self.mux.clone(), name, service_type, callback).await
    }

    pub fn parameter(&self, name: impl Into<String>) -> Parameter {
        Parameter::new(self.mux.clone(), name)
    }

    pub fn rosapi(&self) -> RosApi {
        RosApi::new(self.mux.clone()).with_default_timeout(self.default_timeout)
    }

    pub async fn action_client(&self, action_name: impl Into<String>, action_type: impl Into<String>) -> Result<ActionClient> {
        ActionClient::new(self.mux.clone(), self.ids.clone(), action_name, action_type).await
    }

    /// Spawns a [`SimpleActionServer`] hosting `action_name` and executing
    /// each accepted goal via `execute`.
    pub async fn simple_action_server<F, Fut>(&self, action_name: impl Into<String>, action_type: impl Into<String>, execute: F) -> Result<Arc<SimpleActionServer>>
    where
        F: Fn(crate::actionlib::server::ActiveGoalHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        SimpleActionServer::new(self.mux.clone(), action_name, action_type, execute).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;

    #[test]
    fn default_url_uses_ws_scheme_and_port_9090() {
        let config = RosBridgeConfig::new("robot.local", 9090);
        assert_eq!(config.url(), "ws://robot.local:9090");
    }

    #[test]
    fn secure_config_uses_wss_scheme() {
        let config = RosBridgeConfig::new("robot.local", 9090).with_secure(true);
        assert_eq!(config.url(), "wss://robot.local:9090");
    }

    #[tokio::test]
    async fn run_reaches_ready_against_a_mock_connector() {
        let config = RosBridgeConfig::new("localhost", 9090)
            .with_default_timeout(Duration::from_millis(200))
            .with_ready_timeout(Duration::from_secs(1));
        let bridge = RosBridge::with_connector(config, MockConnector::new());
        bridge.run().await.unwrap();
        assert!(bridge.is_ready().await);
        bridge.close().await;
        assert!(!bridge.is_connected().await);
    }
}
