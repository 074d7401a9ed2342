//! Publish/subscribe handles for a named, typed topic.
//!
//! A [`Topic`] is a lightweight description (`name`, `message_type`, and the
//! throttling/queueing/latch hints the server understands); calling
//! [`Topic::advertise`] or [`Topic::subscribe`] produces the actual
//! self-deregistering handle. Multiple local [`Subscription`]s or
//! [`Publisher`]s for the same topic name share one server-side
//! `subscribe`/`advertise`, refcounted by the multiplexer.

use crate::protocol::{Compression, Multiplexer};
use rosbridge_common::{Result, Value};
use std::sync::Arc;

/// A named, typed topic description. Cheap to clone; cloning does not
/// create a new server-side registration.
#[derive(Clone)]
pub struct Topic {
    mux: Arc<Multiplexer>,
    name: String,
    message_type: String,
    throttle_rate_ms: u64,
    queue_size: u64,
    queue_length: u64,
    latch: bool,
}

impl Topic {
    pub fn new(mux: Arc<Multiplexer>, name: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            mux,
            name: name.into(),
            message_type: message_type.into(),
            throttle_rate_ms: 0,
            queue_size: 1,
            queue_length: 0,
            latch: false,
        }
    }

    /// Asks the server to rate-limit delivery of this topic's messages to
    /// no more than one every `ms` milliseconds.
    pub fn with_throttle_rate_ms(mut self, ms: u64) -> Self {
        self.throttle_rate_ms = ms;
        self
    }

    /// Hints the server how many messages to buffer internally before
    /// dropping old ones.
    pub fn with_queue_length(mut self, queue_length: u64) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Local publish queue size hint; mirrors the field in the Topic data
    /// model but is not sent on the wire (the server's own queue_length
    /// governs server-side buffering).
    pub fn with_queue_size(mut self, queue_size: u64) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Requests the server replay the last published message to new
    /// subscribers.
    pub fn with_latch(mut self, latch: bool) -> Self {
        self.latch = latch;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn queue_size(&self) -> u64 {
        self.queue_size
    }

    /// Registers a local subscriber. Sends `subscribe` to the server only
    /// if no other local subscriber already exists for this topic name.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let rx = self
            .mux
            .subscribe(
                &self.name,
                Some(self.message_type.clone()),
                Some(self.throttle_rate_ms),
                Some(self.queue_length),
                Compression::None,
            )
            .await?;
        Ok(Subscription {
            mux: self.mux.clone(),
            topic: self.name.clone(),
            rx,
        })
    }

    /// Registers a local publisher. The first call for this topic name
    /// sends `advertise`; later calls only `publish`.
    pub fn advertise(&self) -> Publisher {
        Publisher {
            mux: self.mux.clone(),
            topic: self.name.clone(),
            message_type: self.message_type.clone(),
            latch: self.latch,
            registered: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// A live subscription to a topic. Dropping it sends `unsubscribe` once it
/// was the last local subscriber for that topic name.
pub struct Subscription {
    mux: Arc<Multiplexer>,
    topic: String,
    rx: tokio::sync::broadcast::Receiver<Value>,
}

impl Subscription {
    /// Awaits the next published message. Lagging behind the broadcast
    /// channel's capacity skips the missed messages and returns the next
    /// available one, matching rosbridge's best-effort delivery: any frame
    /// may be the last one delivered.
    pub async fn next(&mut self) -> Result<Value> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Ok(v),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("subscription to {} lagged, dropped {n} messages", self.topic);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(rosbridge_common::Error::ConnectionLost);
                }
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mux = self.mux.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            if let Err(e) = mux.unsubscribe(&topic).await {
                log::debug!("unsubscribe from {topic} on drop failed: {e}");
            }
        });
    }
}

/// A live publisher handle for a topic. Dropping it sends `unadvertise`
/// once it was the last local publisher for that topic name.
pub struct Publisher {
    mux: Arc<Multiplexer>,
    topic: String,
    message_type: String,
    latch: bool,
    registered: std::sync::atomic::AtomicBool,
}

impl Publisher {
    /// Publishes `msg`. Sends `advertise` first if this is this
    /// publisher's first call.
    pub async fn publish(&self, msg: Value) -> Result<()> {
        self.registered.store(true, std::sync::atomic::Ordering::SeqCst);
        self.mux.publish(&self.topic, &self.message_type, msg, self.latch).await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if !self.registered.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let mux = self.mux.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            if let Err(e) = mux.unadvertise(&topic).await {
                log::debug!("unadvertise of {topic} on drop failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::id::IdAllocator;

    async fn test_mux() -> Arc<Multiplexer> {
        use crate::connection::{Backoff, ConnectionManager};
        let events = EventBus::new();
        let connector = crate::transport::mock::MockConnector::new();
        let conn = ConnectionManager::new(connector, "ws://x".into(), None, Backoff::default(), events.clone());
        let mux = Arc::new(Multiplexer::new(Arc::new(conn.clone()), events, Arc::new(IdAllocator::new())));
        conn.set_multiplexer(&mux).await;
        conn.run(std::time::Duration::from_secs(1)).await.unwrap();
        mux
    }

    #[tokio::test]
    async fn publish_sends_advertise_once() {
        let mux = test_mux().await;
        let topic = Topic::new(mux.clone(), "/chatter", "std_msgs/String");
        let publisher = topic.advertise();
        publisher.publish(serde_json::json!({"data": "hello"})).await.unwrap();
        publisher.publish(serde_json::json!({"data": "world"})).await.unwrap();
        // Repeated publishes on the same handle must only advertise once;
        // a second advertise frame would be a protocol violation.
    }
}
