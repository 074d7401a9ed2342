//! Transport abstraction over a single bidirectional text-frame socket.
//!
//! The engine treats the transport as unreliable: any frame may be the last
//! one delivered, but delivered frames arrive in order. The default
//! implementation wraps `tokio-tungstenite`; tests substitute
//! [`MockConnector`] so the rest of the engine can be exercised without a
//! real socket.

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rosbridge_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Lifecycle events a transport surfaces to its owner (the connection
/// manager). Ordering of delivered events matches the order frames were
/// received on the wire.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close { code: u16, reason: String },
}

/// A single open text-frame channel. `send` enqueues a frame; outgoing
/// frames for one transport are never interleaved because exactly one
/// writer task owns the underlying sink, written only from the I/O loop.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, text: String) -> BoxFuture<'static, Result<()>>;
    fn close(&self) -> BoxFuture<'static, Result<()>>;
}

/// A `Transport` type-erased behind `Arc<dyn Transport>` so the rest of the
/// engine never needs to know which concrete transport backs a session.
pub type DynTransport = Arc<dyn Transport>;

/// A place to hand an [`OutgoingOp`](crate::protocol::OutgoingOp)-shaped
/// frame to and have it delivered to the server, without the caller
/// knowing whether there's currently a live connection. Implemented by
/// [`crate::connection::ConnectionManager`]; used by everything that
/// originates frames (topics, services, actionlib, auth) so only the
/// connection manager needs to hold the real transport handle, breaking
/// what would otherwise be a reference cycle.
pub trait FrameSink: Send + Sync + 'static {
    fn send_text(&self, text: String) -> BoxFuture<'static, Result<()>>;
}

/// Factory that opens a fresh transport for a URL, handing back both the
/// sender half and a stream of lifecycle events. Implementations are free
/// to retry internally or fail fast; the connection manager supplies its
/// own backoff on top.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(DynTransport, mpsc::UnboundedReceiver<TransportEvent>)>>;
}

/// Sends text frames over a `tokio-tungstenite` WebSocket. Frames handed to
/// `send` are pushed onto an unbounded queue drained by a single writer
/// task so concurrent callers never interleave writes on the socket.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<String>,
}

impl Transport for WsTransport {
    fn send(&self, text: String) -> BoxFuture<'static, Result<()>> {
        let outbound = self.outbound.clone();
        Box::pin(async move {
            outbound
                .send(text)
                .map_err(|_| Error::ConnectionLost)
        })
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        // Dropping the sender half closes the writer task's queue, which in
        // turn drops the socket's write half. The server observes a normal
        // WebSocket close.
        let outbound = self.outbound.clone();
        Box::pin(async move {
            drop(outbound);
            Ok(())
        })
    }
}

/// Opens real WebSocket connections. This is the default connector used by
/// [`crate::session::RosBridge`].
#[derive(Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
    ) -> BoxFuture<'static, Result<(DynTransport, mpsc::UnboundedReceiver<TransportEvent>)>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
            let (mut sink, mut stream) = ws_stream.split();

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

            // Single writer task: the only place the socket is ever written to.
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        log::warn!("rosbridge write failed: {e}");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let event_tx_open = event_tx.clone();
            tokio::spawn(async move {
                let _ = event_tx_open.send(TransportEvent::Open);
                loop {
                    match stream.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            if event_tx_open.send(TransportEvent::Message(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            // rosbridge only sends text frames for JSON/`cbor` is
                            // offered as text too; binary frames aren't part of
                            // the mandatory wire protocol.
                            log::debug!("dropping unexpected binary frame");
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, String::new()));
                            let _ = event_tx_open.send(TransportEvent::Close { code, reason });
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/Pong handled transparently by tungstenite.
                        }
                        Some(Err(e)) => {
                            let _ = event_tx_open.send(TransportEvent::Error(e.to_string()));
                        }
                        None => {
                            let _ = event_tx_open.send(TransportEvent::Close {
                                code: 1006,
                                reason: "connection closed abnormally".to_string(),
                            });
                            break;
                        }
                    }
                }
            });

            let transport: DynTransport = Arc::new(WsTransport {
                outbound: outbound_tx,
            });
            Ok((transport, event_rx))
        })
    }
}

#[cfg(test)]
pub mod mock {
    //! An in-process connector used by unit tests to exercise the
    //! multiplexer, connection manager and higher-level modules without a
    //! real socket. Mirrors the shape of `roslibrust_mock`'s channel-backed
    //! fake backend.
    use super::*;
    use std::sync::Mutex;

    /// A transport backed by channels. `sent` captures every frame handed
    /// to `send` so tests can assert on wire traffic; `inject` lets a test
    /// simulate an inbound server frame.
    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<String>>>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockTransport {
        pub fn inject_message(&self, text: impl Into<String>) {
            let _ = self.event_tx.send(TransportEvent::Message(text.into()));
        }

        pub fn inject_close(&self, code: u16, reason: impl Into<String>) {
            let _ = self.event_tx.send(TransportEvent::Close {
                code,
                reason: reason.into(),
            });
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send(&self, text: String) -> BoxFuture<'static, Result<()>> {
            self.sent.lock().unwrap().push(text);
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Connector that hands back a fresh [`MockTransport`] on every
    /// `connect`, optionally failing the first N attempts to exercise
    /// reconnect/backoff logic.
    #[derive(Clone)]
    pub struct MockConnector {
        pub fail_next: Arc<std::sync::atomic::AtomicU32>,
        pub last_transport: Arc<Mutex<Option<(Arc<Mutex<Vec<String>>>, mpsc::UnboundedSender<TransportEvent>)>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self {
                fail_next: Arc::new(std::sync::atomic::AtomicU32::new(0)),
                last_transport: Arc::new(Mutex::new(None)),
            }
        }

        /// Injects a message on the most recently connected transport.
        pub fn inject_message(&self, text: impl Into<String>) {
            if let Some((_, tx)) = self.last_transport.lock().unwrap().as_ref() {
                let _ = tx.send(TransportEvent::Message(text.into()));
            }
        }

        pub fn inject_close(&self, code: u16, reason: impl Into<String>) {
            if let Some((_, tx)) = self.last_transport.lock().unwrap().as_ref() {
                let _ = tx.send(TransportEvent::Close {
                    code,
                    reason: reason.into(),
                });
            }
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.last_transport
                .lock()
                .unwrap()
                .as_ref()
                .map(|(sent, _)| sent.lock().unwrap().clone())
                .unwrap_or_default()
        }
    }

    impl Default for MockConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            _url: &str,
        ) -> BoxFuture<'static, Result<(DynTransport, mpsc::UnboundedReceiver<TransportEvent>)>> {
            let fail_next = self.fail_next.clone();
            let last_transport = self.last_transport.clone();
            Box::pin(async move {
                if fail_next.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                    fail_next.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    return Err(Error::ConnectionFailed("mock connector told to fail".into()));
                }
                let sent = Arc::new(Mutex::new(Vec::new()));
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                *last_transport.lock().unwrap() = Some((sent.clone(), event_tx.clone()));
                let _ = event_tx.send(TransportEvent::Open);
                let transport: DynTransport = Arc::new(MockTransport { sent, event_tx });
                Ok((transport, event_rx))
            })
        }
    }
}
