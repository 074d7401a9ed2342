//! Drives the transport lifecycle: opens the socket, authenticates,
//! reconnects with exponential backoff, and replays resubscription intents
//! on every successful `ready`.

use crate::events::EventBus;
use crate::protocol::Multiplexer;
use crate::transport::{Connector, DynTransport, FrameSink, TransportEvent};
use futures::future::BoxFuture;
use rosbridge_common::{Error, Result, Value};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};

/// Reconnect backoff parameters: `delay = min(max_delay, initial_delay *
/// 2^attempt)`, up to `max_retries` attempts (0 = unlimited).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Opening,
    Open,
    Ready,
    Closing,
}

struct Inner<C: Connector> {
    connector: C,
    url: String,
    authentication: Option<Value>,
    backoff: Backoff,
    events: EventBus,
    multiplexer: Mutex<Weak<Multiplexer>>,
    state: Mutex<ConnState>,
    transport: Mutex<Option<DynTransport>>,
    shutting_down: AtomicBool,
    shutdown: Notify,
    attempt: AtomicU32,
}

/// Owns the WebSocket session: reconnection, backoff, and `ready`/`close`
/// lifecycle events. Generic over the [`Connector`] so tests can substitute
/// [`crate::transport::mock::MockConnector`].
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, url: String, authentication: Option<Value>, backoff: Backoff, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                url,
                authentication,
                backoff,
                events,
                multiplexer: Mutex::new(Weak::new()),
                state: Mutex::new(ConnState::Closed),
                transport: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                shutdown: Notify::new(),
                attempt: AtomicU32::new(0),
            }),
        }
    }

    /// Wires the multiplexer this connection manager routes inbound frames
    /// to and replays resubscription intents through on `ready`. Held as a
    /// weak reference: the multiplexer's owner (the session) holds the
    /// strong reference, avoiding a reference cycle between the two.
    pub async fn set_multiplexer(&self, mux: &Arc<Multiplexer>) {
        *self.inner.multiplexer.lock().await = Arc::downgrade(mux);
    }

    pub async fn state(&self) -> ConnState {
        *self.inner.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, ConnState::Open | ConnState::Ready)
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == ConnState::Ready
    }

    /// Blocks the calling task in the I/O loop until `close`.
    pub async fn run_forever(&self) {
        self.io_loop().await;
    }

    /// Spawns the I/O loop on a background task and waits up to
    /// `ready_timeout` for the first `ready` event before returning.
    /// `NotReady` is returned on timeout; the loop keeps running regardless
    /// so a later `ready` still arrives.
    pub async fn run(self: &ConnectionManager<C>, ready_timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        self.inner.events.once(
            "ready",
            Arc::new(move |_| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }),
        );

        let this = self.clone();
        tokio::spawn(async move { this.io_loop().await });

        match tokio::time::timeout(ready_timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::NotReady),
        }
    }

    /// Requests a graceful shutdown: stops reconnecting, fires `closing`,
    /// and closes the live transport if any. Also wakes the I/O loop
    /// directly, so the task spawned by `run` terminates even against a
    /// transport whose `close` doesn't itself end the event stream.
    pub async fn close(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        *self.inner.state.lock().await = ConnState::Closing;
        self.inner.events.emit("closing", Value::Null);
        if let Some(t) = self.inner.transport.lock().await.take() {
            let _ = t.close().await;
        }
        self.inner.shutdown.notify_one();
        *self.inner.state.lock().await = ConnState::Closed;
        self.inner.events.emit("close", Value::Null);
    }

    async fn mux(&self) -> Option<Arc<Multiplexer>> {
        self.inner.multiplexer.lock().await.upgrade()
    }

    async fn io_loop(&self) {
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            *self.inner.state.lock().await = ConnState::Opening;
            self.inner.events.emit("connecting", Value::Null);

            let attempt = self.inner.attempt.load(Ordering::SeqCst);
            if attempt > 0 {
                let delay = self.inner.backoff.delay_for_attempt(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let connected = self.inner.connector.connect(&self.inner.url).await;
            let (transport, mut events_rx) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    self.inner.events.emit("error", json!({ "message": e.to_string() }));
                    let next_attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    if self.inner.backoff.max_retries != 0 && next_attempt >= self.inner.backoff.max_retries {
                        *self.inner.state.lock().await = ConnState::Closed;
                        self.inner.events.emit("close", Value::Null);
                        return;
                    }
                    continue;
                }
            };

            *self.inner.transport.lock().await = Some(transport.clone());

            // Drive this connection's event stream until it closes or a
            // shutdown is requested. events_rx.recv() is cancel-safe, so
            // racing it against the shutdown notification across loop
            // iterations never drops a buffered event.
            let mut became_ready = false;
            loop {
                let event = tokio::select! {
                    event = events_rx.recv() => event,
                    _ = self.inner.shutdown.notified() => None,
                };
                let Some(event) = event else {
                    break;
                };
                match event {
                    TransportEvent::Open => {
                        *self.inner.state.lock().await = ConnState::Open;
                        self.inner.events.emit("connection", Value::Null);

                        if let Some(auth) = self.inner.authentication.clone() {
                            let op = crate::protocol::OutgoingOp::Auth(auth);
                            if let Ok(text) = op.to_json_string() {
                                let _ = transport.send(text).await;
                            }
                        }

                        // Ready is reached once the transport is open and
                        // auth (if any) has been sent without an immediate
                        // close; we don't wait for an explicit ack because
                        // rosbridge's `auth` op has none, so a close
                        // arriving right after is handled like any other
                        // disconnect below.
                        *self.inner.state.lock().await = ConnState::Ready;
                        self.inner.attempt.store(0, Ordering::SeqCst);
                        became_ready = true;
                        if let Some(mux) = self.mux().await {
                            if let Err(e) = mux.resubscribe_all().await {
                                log::warn!("failed to replay resubscription intents: {e}");
                            }
                        }
                        self.inner.events.emit("ready", Value::Null);
                    }
                    TransportEvent::Message(text) => {
                        if let Some(mux) = self.mux().await {
                            mux.dispatch(&text).await;
                        }
                    }
                    TransportEvent::Error(reason) => {
                        self.inner.events.emit("error", json!({ "message": reason }));
                    }
                    TransportEvent::Close { code, reason } => {
                        self.inner.events.emit(
                            "close",
                            json!({ "code": code, "reason": reason }),
                        );
                        break;
                    }
                }
            }

            *self.inner.transport.lock().await = None;
            if let Some(mux) = self.mux().await {
                mux.fail_all_pending();
            }

            if self.inner.shutting_down.load(Ordering::SeqCst) {
                *self.inner.state.lock().await = ConnState::Closed;
                return;
            }

            *self.inner.state.lock().await = ConnState::Closed;
            if !became_ready {
                // Never reached ready this attempt; still counts toward
                // max_retries via the same counter used for connect failures.
                self.inner.attempt.fetch_add(1, Ordering::SeqCst);
            }
            // loop back around: delay computed from attempt at top of loop
        }
    }
}

impl<C: Connector> FrameSink for ConnectionManager<C> {
    fn send_text(&self, text: String) -> BoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let transport = inner.transport.lock().await.clone();
            match transport {
                Some(t) => t.send(text).await,
                None => Err(Error::ConnectionLost),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_delay() {
        let b = Backoff { initial_delay: Duration::from_secs(1), max_delay: Duration::from_secs(4), max_retries: 0 };
        assert_eq!(b.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(b.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(b.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(b.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn connect_ready_close() {
        let events = EventBus::new();
        let connector = crate::transport::mock::MockConnector::new();
        let conn = ConnectionManager::new(connector, "ws://localhost:9090".into(), None, Backoff::default(), events.clone());
        let mux = Arc::new(Multiplexer::new(
            Arc::new(conn.clone()),
            events.clone(),
            Arc::new(crate::id::IdAllocator::new()),
        ));
        conn.set_multiplexer(&mux).await;

        conn.run(Duration::from_secs(1)).await.unwrap();
        assert!(conn.is_connected().await);
        conn.close().await;
        assert!(!conn.is_connected().await);
    }
}
