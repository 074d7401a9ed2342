//! Request/response services, both as a client calling a remote service and
//! as a server hosting one locally.
//!
//! Every operation that has a reply offers both a non-blocking future
//! variant ([`ServiceClient::call`]) and a blocking variant
//! ([`ServiceClient::call_blocking`]) over the same underlying pending
//! entry.

use crate::protocol::{Compression, Multiplexer, ServiceCallback};
use rosbridge_common::{Error, Result, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A handle to call a remote service repeatedly. Each call allocates a
/// fresh correlation id.
#[derive(Clone)]
pub struct ServiceClient {
    mux: Arc<Multiplexer>,
    name: String,
    compression: Compression,
    default_timeout: Option<Duration>,
}

impl ServiceClient {
    pub fn new(mux: Arc<Multiplexer>, name: impl Into<String>) -> Self {
        Self {
            mux,
            name: name.into(),
            compression: Compression::None,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls the service, awaiting the reply (or the configured default
    /// timeout, if any) without blocking the calling thread.
    pub async fn call(&self, request: Value) -> Result<Value> {
        match self.default_timeout {
            Some(d) => self.call_with_timeout(request, d).await,
            None => {
                let rx = self.mux.call_service(&self.name, request, self.compression).await?;
                match rx.await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(values)) => Err(Error::ServiceFailed(values)),
                    Err(_) => Err(Error::ConnectionLost),
                }
            }
        }
    }

    /// Calls the service with an explicit timeout, overriding any default.
    pub async fn call_with_timeout(&self, request: Value, timeout: Duration) -> Result<Value> {
        let rx = self.mux.call_service(&self.name, request, self.compression).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(v))) => Ok(v),
            Ok(Ok(Err(values))) => Err(Error::ServiceFailed(values)),
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => Err(Error::Timeout(self.name.clone())),
        }
    }

    /// The blocking variant: suspends the calling thread — not the I/O
    /// loop — until the reply arrives or `timeout` elapses. Must be called
    /// from outside the tokio runtime that drives the session's I/O loop (a
    /// plain OS thread, or a `spawn_blocking` task), matching how every
    /// blocking accessor in this engine is implemented.
    pub fn call_blocking(&self, request: Value, timeout: Duration) -> Result<Value> {
        tokio::runtime::Handle::current().block_on(self.call_with_timeout(request, timeout))
    }
}

/// Wraps a user function as a [`ServiceCallback`]. Accepts both sync
/// closures (via `Fut = std::future::Ready<...>`) and genuinely async ones.
pub fn service_fn<F, Fut>(f: F) -> ServiceCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
{
    Arc::new(move |req: Value| -> Pin<Box<dyn Future<Output = std::result::Result<Value, Value>> + Send>> {
        Box::pin(f(req))
    })
}

/// A live advertised service. Dropping it sends `unadvertise_service`.
pub struct ServiceServerHandle {
    mux: Arc<Multiplexer>,
    name: String,
}

impl ServiceServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ServiceServerHandle {
    fn drop(&mut self) {
        let mux = self.mux.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = mux.unadvertise_service(&name).await {
                log::debug!("unadvertise_service for {name} on drop failed: {e}");
            }
        });
    }
}

/// Advertises `name` as a `service_type` service, routing each incoming
/// `call_service` to `callback`. If `callback` returns `Err`, the peer
/// receives `result: false` with the error's payload as `values`.
pub async fn advertise_service<F, Fut>(
    mux: Arc<Multiplexer>,
    name: impl Into<String>,
    service_type: impl Into<String>,
    callback: F,
) -> Result<ServiceServerHandle>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
{
    let name = name.into();
    mux.advertise_service(&name, &service_type.into(), service_fn(callback)).await?;
    Ok(ServiceServerHandle { mux, name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Backoff, ConnectionManager};
    use crate::events::EventBus;
    use crate::id::IdAllocator;
    use crate::transport::mock::MockConnector;

    async fn test_mux() -> (Arc<Multiplexer>, MockConnector) {
        let events = EventBus::new();
        let connector = MockConnector::new();
        let conn = ConnectionManager::new(connector.clone(), "ws://x".into(), None, Backoff::default(), events.clone());
        let mux = Arc::new(Multiplexer::new(Arc::new(conn.clone()), events, Arc::new(IdAllocator::new())));
        conn.set_multiplexer(&mux).await;
        conn.run(Duration::from_secs(1)).await.unwrap();
        (mux, connector)
    }

    fn unrun_mux() -> Arc<Multiplexer> {
        let events = EventBus::new();
        let connector = MockConnector::new();
        let conn = Arc::new(ConnectionManager::new(connector, "ws://x".into(), None, Backoff::default(), events.clone()));
        Arc::new(Multiplexer::new(conn, events, Arc::new(IdAllocator::new())))
    }

    #[tokio::test]
    async fn call_times_out_without_a_reply() {
        let mux = unrun_mux();
        let client = ServiceClient::new(mux, "/rosout/get_loggers");
        // No live connection means send itself fails before the timeout
        // even starts, which is the realistic "no connection" case.
        let result = client.call_with_timeout(Value::Null, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn hosted_service_resolves_calls() {
        let (mux, _connector) = test_mux().await;
        let _server = advertise_service(mux.clone(), "/toggle", "std_srvs/SetBool", |req: Value| async move {
            let data = req["data"].as_bool().unwrap_or(false);
            Ok(serde_json::json!({ "success": true, "message": format!("data:{data}") }))
        })
        .await
        .unwrap();

        // Simulate the server dispatching an inbound call_service frame to
        // itself, as rosbridge would when a peer calls /toggle.
        mux.dispatch(r#"{"op":"call_service","id":"call_service:/toggle:0","service":"/toggle","args":{"data":true}}"#).await;
    }
}
