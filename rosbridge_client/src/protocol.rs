//! The rosbridge v2 wire format: outgoing op construction, incoming frame
//! parsing, and the multiplexer that routes parsed frames to whichever
//! topic subscription, pending service call, advertised service, or
//! status listener they correlate with.

use rosbridge_common::{Error, Result, Value};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;

/// Compression requested for a subscribe/call_service frame. `None` is the
/// only mandatory wire encoding; `Png`/`Cbor` are accepted as configuration
/// but this engine does not implement their codecs — they're offered
/// through pluggable decoders on some servers but are never required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Png,
    Cbor,
}

impl Compression {
    fn as_wire(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Png => "png",
            Compression::Cbor => "cbor",
        }
    }
}

/// One outgoing rosbridge op. `to_value` renders it as the JSON envelope
/// sent on the wire.
#[derive(Debug, Clone)]
pub enum OutgoingOp {
    Advertise {
        id: String,
        topic: String,
        msg_type: String,
        latch: bool,
    },
    Unadvertise {
        id: String,
        topic: String,
    },
    Publish {
        topic: String,
        msg: Value,
        latch: bool,
    },
    Subscribe {
        id: String,
        topic: String,
        msg_type: Option<String>,
        throttle_rate_ms: Option<u64>,
        queue_length: Option<u64>,
        compression: Compression,
    },
    Unsubscribe {
        id: String,
        topic: String,
    },
    CallService {
        id: String,
        service: String,
        args: Value,
        compression: Compression,
    },
    AdvertiseService {
        id: String,
        service: String,
        service_type: String,
    },
    UnadvertiseService {
        service: String,
    },
    ServiceResponse {
        id: Option<String>,
        service: String,
        values: Value,
        result: bool,
    },
    Auth(Value),
    SetLevel {
        level: String,
        id: Option<String>,
    },
}

impl OutgoingOp {
    pub fn to_value(&self) -> Value {
        match self {
            OutgoingOp::Advertise {
                id,
                topic,
                msg_type,
                latch,
            } => json!({
                "op": "advertise", "id": id, "topic": topic, "type": msg_type, "latch": latch,
            }),
            OutgoingOp::Unadvertise { id, topic } => json!({
                "op": "unadvertise", "id": id, "topic": topic,
            }),
            OutgoingOp::Publish { topic, msg, latch } => json!({
                "op": "publish", "topic": topic, "msg": msg, "latch": latch,
            }),
            OutgoingOp::Subscribe {
                id,
                topic,
                msg_type,
                throttle_rate_ms,
                queue_length,
                compression,
            } => {
                let mut frame = json!({
                    "op": "subscribe",
                    "id": id,
                    "topic": topic,
                    "compression": compression.as_wire(),
                });
                let obj = frame.as_object_mut().unwrap();
                if let Some(t) = msg_type {
                    obj.insert("type".to_string(), json!(t));
                }
                if let Some(t) = throttle_rate_ms {
                    obj.insert("throttle_rate".to_string(), json!(t));
                }
                if let Some(q) = queue_length {
                    obj.insert("queue_length".to_string(), json!(q));
                }
                frame
            }
            OutgoingOp::Unsubscribe { id, topic } => json!({
                "op": "unsubscribe", "id": id, "topic": topic,
            }),
            OutgoingOp::CallService {
                id,
                service,
                args,
                compression,
            } => json!({
                "op": "call_service",
                "id": id,
                "service": service,
                "args": args,
                "compression": compression.as_wire(),
            }),
            OutgoingOp::AdvertiseService {
                id,
                service,
                service_type,
            } => json!({
                "op": "advertise_service", "id": id, "service": service, "type": service_type,
            }),
            OutgoingOp::UnadvertiseService { service } => json!({
                "op": "unadvertise_service", "service": service,
            }),
            OutgoingOp::ServiceResponse {
                id,
                service,
                values,
                result,
            } => {
                let mut frame = json!({
                    "op": "service_response",
                    "service": service,
                    "values": values,
                    "result": result,
                });
                if let Some(id) = id {
                    frame.as_object_mut().unwrap().insert("id".to_string(), json!(id));
                }
                frame
            }
            OutgoingOp::Auth(payload) => {
                let mut frame = payload.clone();
                if !frame.is_object() {
                    frame = json!({});
                }
                frame.as_object_mut().unwrap().insert("op".to_string(), json!("auth"));
                frame
            }
            OutgoingOp::SetLevel { level, id } => {
                let mut frame = json!({ "op": "set_level", "level": level });
                if let Some(id) = id {
                    frame.as_object_mut().unwrap().insert("id".to_string(), json!(id));
                }
                frame
            }
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }
}

/// A parsed inbound frame, recognized by its `op` field.
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    Publish {
        topic: String,
        msg: Value,
    },
    ServiceResponse {
        id: Option<String>,
        values: Value,
        result: bool,
    },
    CallService {
        id: Option<String>,
        service: String,
        args: Value,
    },
    Status {
        id: Option<String>,
        level: Option<String>,
        msg: Option<String>,
    },
    /// Recognized op this engine doesn't act on beyond logging (`png`,
    /// `fragment`, etc).
    Ignored {
        op: String,
    },
    /// An `op` the engine has never heard of. Reported via the `error`
    /// event; never a reason to disconnect.
    Unknown {
        op: String,
        raw: Value,
    },
}

/// Parses one inbound text frame. A frame that isn't even valid JSON, or is
/// valid JSON missing a string `op` field, is reported as
/// [`Error::InvalidFrame`] — logged and dropped by the caller, never fatal
/// to the session.
pub fn parse_frame(text: &str) -> Result<IncomingFrame> {
    let value: Value = serde_json::from_str(text).map_err(|e| Error::InvalidFrame(e.to_string()))?;
    let op = value
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidFrame("frame missing string 'op' field".to_string()))?;

    let frame = match op {
        "publish" => IncomingFrame::Publish {
            topic: field_str(&value, "topic")?,
            msg: value.get("msg").cloned().unwrap_or(Value::Null),
        },
        "service_response" => IncomingFrame::ServiceResponse {
            id: value.get("id").and_then(Value::as_str).map(str::to_string),
            values: value.get("values").cloned().unwrap_or(Value::Null),
            result: value.get("result").and_then(Value::as_bool).unwrap_or(true),
        },
        "call_service" => IncomingFrame::CallService {
            id: value.get("id").and_then(Value::as_str).map(str::to_string),
            service: field_str(&value, "service")?,
            args: value.get("args").cloned().unwrap_or(Value::Null),
        },
        "status" => IncomingFrame::Status {
            id: value.get("id").and_then(Value::as_str).map(str::to_string),
            level: value.get("level").and_then(Value::as_str).map(str::to_string),
            msg: value.get("msg").and_then(Value::as_str).map(str::to_string),
        },
        "png" | "fragment" | "cbor" | "set_level" | "auth" => IncomingFrame::Ignored { op: op.to_string() },
        other => IncomingFrame::Unknown {
            op: other.to_string(),
            raw: value,
        },
    };
    Ok(frame)
}

fn field_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidFrame(format!("frame missing string '{field}' field")))
}

/// A synchronous callback invoked for each incoming `call_service` frame
/// addressed to a locally advertised service. Returning `Err` produces a
/// `service_response` with `result: false` and an empty `values` payload.
pub type ServiceCallback =
    std::sync::Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<Value, Value>> + Send>> + Send + Sync>;

/// Refcounted state for a topic's active `subscribe` or `advertise`
/// registration with the server: the id the `subscribe`/`advertise` frame
/// was sent with, and how many local handles are relying on it.
struct RefcountedRegistration {
    id: String,
    count: u32,
}

/// Tracks everything the multiplexer needs to dispatch incoming frames and
/// to enforce "at most one subscribe / advertise per topic", "at most one
/// outstanding id per call_service/advertise_service", and resubscription
/// fidelity across reconnects (together with
/// [`crate::connection::ConnectionManager`] which replays these on `ready`).
pub struct Multiplexer {
    sink: std::sync::Arc<dyn crate::transport::FrameSink>,
    events: crate::events::EventBus,
    ids: std::sync::Arc<crate::id::IdAllocator>,
    pending: dashmap::DashMap<String, tokio::sync::oneshot::Sender<std::result::Result<Value, Value>>>,
    topic_channels: dashmap::DashMap<String, tokio::sync::broadcast::Sender<Value>>,
    subscriptions: tokio::sync::Mutex<std::collections::HashMap<String, RefcountedRegistration>>,
    advertisements: tokio::sync::Mutex<std::collections::HashMap<String, RefcountedRegistration>>,
    service_servers: dashmap::DashMap<String, ServiceCallback>,
    /// Every advertise/subscribe/advertise_service intent still considered
    /// "wanted" by the user, replayed verbatim on every `ready`. Keyed by a
    /// description unique enough for debugging; order of insertion is
    /// preserved.
    resub_intents: tokio::sync::Mutex<Vec<ResubIntent>>,
}

/// One resubscription intent: enough information to reissue the original
/// frame verbatim after a reconnect.
#[derive(Debug, Clone)]
pub enum ResubIntent {
    Subscribe {
        topic: String,
        msg_type: Option<String>,
        throttle_rate_ms: Option<u64>,
        queue_length: Option<u64>,
        compression: Compression,
    },
    Advertise {
        topic: String,
        msg_type: String,
    },
    AdvertiseService {
        service: String,
        service_type: String,
        id: String,
    },
}

impl Multiplexer {
    pub fn new(
        sink: std::sync::Arc<dyn crate::transport::FrameSink>,
        events: crate::events::EventBus,
        ids: std::sync::Arc<crate::id::IdAllocator>,
    ) -> Self {
        Self {
            sink,
            events,
            ids,
            pending: dashmap::DashMap::new(),
            topic_channels: dashmap::DashMap::new(),
            subscriptions: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            advertisements: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            service_servers: dashmap::DashMap::new(),
            resub_intents: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn send(&self, op: OutgoingOp) -> Result<()> {
        self.sink.send_text(op.to_json_string()?).await
    }

    /// Routes one parsed inbound frame. Never returns an error that should
    /// terminate the session: malformed frames and unknown ops are reported
    /// via the event bus and dropped.
    pub async fn dispatch(&self, frame_text: &str) {
        let frame = match parse_frame(frame_text) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping invalid frame: {e}");
                self.events.emit("error", json!({ "message": e.to_string() }));
                return;
            }
        };

        match frame {
            IncomingFrame::Publish { topic, msg } => {
                if let Some(tx) = self.topic_channels.get(&topic) {
                    // No subscribers is not an error: the engine may have
                    // advertised the topic itself, or a race during
                    // unsubscribe.
                    let _ = tx.send(msg);
                }
            }
            IncomingFrame::ServiceResponse { id, values, result } => {
                let Some(id) = id else {
                    log::debug!("service_response with no id, dropping");
                    return;
                };
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let payload = if result { Ok(values) } else { Err(values) };
                    // The receiver may already have timed out and been
                    // dropped; that's fine, first-match-wins.
                    let _ = tx.send(payload);
                } else {
                    log::debug!("unmatched service_response for id {id}, dropping");
                }
            }
            IncomingFrame::CallService { id, service, args } => {
                let Some(callback) = self.service_servers.get(&service).map(|c| c.clone()) else {
                    log::warn!("call_service for unadvertised service {service}, dropping");
                    return;
                };
                let fut = callback(args);
                let result = fut.await;
                let (result_flag, values) = match result {
                    Ok(values) => (true, values),
                    Err(values) => (false, values),
                };
                let op = OutgoingOp::ServiceResponse {
                    id,
                    service,
                    values,
                    result: result_flag,
                };
                if let Err(e) = self.send(op).await {
                    log::warn!("failed to send service_response: {e}");
                }
            }
            IncomingFrame::Status { id, level, msg } => {
                let payload = json!({ "level": level, "msg": msg });
                if let Some(id) = id {
                    self.events.emit(&format!("status:{id}"), payload.clone());
                }
                self.events.emit("status", payload);
            }
            IncomingFrame::Ignored { op } => {
                log::trace!("ignoring recognized but unhandled op {op}");
            }
            IncomingFrame::Unknown { op, raw } => {
                log::warn!("unknown op '{op}' received");
                self.events.emit("error", json!({ "message": format!("unknown op: {op}"), "frame": raw }));
            }
        }
    }

    /// Registers a new local subscriber for `topic`, sending `subscribe` to
    /// the server only if this is the first local subscriber. Returns a
    /// receiver the caller polls for published messages.
    pub async fn subscribe(
        &self,
        topic: &str,
        msg_type: Option<String>,
        throttle_rate_ms: Option<u64>,
        queue_length: Option<u64>,
        compression: Compression,
    ) -> Result<tokio::sync::broadcast::Receiver<Value>> {
        let rx = self
            .topic_channels
            .entry(topic.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(256).0)
            .subscribe();

        let mut subs = self.subscriptions.lock().await;
        match subs.get_mut(topic) {
            Some(reg) => reg.count += 1,
            None => {
                let id = self.ids.next("subscribe", topic);
                let op = OutgoingOp::Subscribe {
                    id: id.clone(),
                    topic: topic.to_string(),
                    msg_type: msg_type.clone(),
                    throttle_rate_ms,
                    queue_length,
                    compression,
                };
                self.send(op).await?;
                subs.insert(topic.to_string(), RefcountedRegistration { id, count: 1 });
                self.resub_intents.lock().await.push(ResubIntent::Subscribe {
                    topic: topic.to_string(),
                    msg_type,
                    throttle_rate_ms,
                    queue_length,
                    compression,
                });
            }
        }
        Ok(rx)
    }

    /// Releases one local subscriber for `topic`; sends `unsubscribe` once
    /// the last one is released.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut subs = self.subscriptions.lock().await;
        let done = match subs.get_mut(topic) {
            Some(reg) => {
                reg.count = reg.count.saturating_sub(1);
                reg.count == 0
            }
            None => return Ok(()),
        };
        if done {
            let reg = subs.remove(topic).unwrap();
            self.topic_channels.remove(topic);
            drop(subs);
            self.resub_intents
                .lock()
                .await
                .retain(|i| !matches!(i, ResubIntent::Subscribe { topic: t, .. } if t == topic));
            return self.send(OutgoingOp::Unsubscribe { id: reg.id, topic: topic.to_string() }).await;
        }
        Ok(())
    }

    /// Ensures `advertise` has been sent for `topic` (only once, mirroring
    /// the subscribe-side refcounting), then publishes `msg`.
    pub async fn publish(&self, topic: &str, msg_type: &str, msg: Value, latch: bool) -> Result<()> {
        let mut ads = self.advertisements.lock().await;
        if let Some(reg) = ads.get_mut(topic) {
            reg.count += 1;
        } else {
            let id = self.ids.next("advertise", topic);
            self.send(OutgoingOp::Advertise {
                id: id.clone(),
                topic: topic.to_string(),
                msg_type: msg_type.to_string(),
                latch,
            })
            .await?;
            ads.insert(topic.to_string(), RefcountedRegistration { id, count: 1 });
            self.resub_intents.lock().await.push(ResubIntent::Advertise {
                topic: topic.to_string(),
                msg_type: msg_type.to_string(),
            });
        }
        drop(ads);
        self.send(OutgoingOp::Publish { topic: topic.to_string(), msg, latch }).await
    }

    /// Releases one local publisher handle for `topic`; sends `unadvertise`
    /// once the last one is released.
    pub async fn unadvertise(&self, topic: &str) -> Result<()> {
        let mut ads = self.advertisements.lock().await;
        let done = match ads.get_mut(topic) {
            Some(reg) => {
                reg.count = reg.count.saturating_sub(1);
                reg.count == 0
            }
            None => return Ok(()),
        };
        if done {
            let reg = ads.remove(topic).unwrap();
            drop(ads);
            self.resub_intents
                .lock()
                .await
                .retain(|i| !matches!(i, ResubIntent::Advertise { topic: t, .. } if t == topic));
            return self.send(OutgoingOp::Unadvertise { id: reg.id, topic: topic.to_string() }).await;
        }
        Ok(())
    }

    /// Allocates a fresh correlation id, registers a one-shot pending
    /// entry, and sends `call_service`. The caller awaits the returned
    /// receiver (with whatever timeout it likes) to get the reply.
    pub async fn call_service(
        &self,
        service: &str,
        args: Value,
        compression: Compression,
    ) -> Result<tokio::sync::oneshot::Receiver<std::result::Result<Value, Value>>> {
        let id = self.ids.next("call_service", service);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(e) = self
            .send(OutgoingOp::CallService {
                id: id.clone(),
                service: service.to_string(),
                args,
                compression,
            })
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Removes a pending call without waiting for its reply (used by the
    /// blocking/future wrapper on timeout).
    pub fn cancel_pending(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Advertises a service, registering `callback` to answer incoming
    /// `call_service` frames.
    pub async fn advertise_service(&self, service: &str, service_type: &str, callback: ServiceCallback) -> Result<()> {
        self.service_servers.insert(service.to_string(), callback);
        let id = self.ids.next("advertise_service", service);
        self.send(OutgoingOp::AdvertiseService {
            id: id.clone(),
            service: service.to_string(),
            service_type: service_type.to_string(),
        })
        .await?;
        self.resub_intents.lock().await.push(ResubIntent::AdvertiseService {
            service: service.to_string(),
            service_type: service_type.to_string(),
            id,
        });
        Ok(())
    }

    /// Stops serving `service` locally and tells the server to forget it.
    pub async fn unadvertise_service(&self, service: &str) -> Result<()> {
        self.service_servers.remove(service);
        self.resub_intents
            .lock()
            .await
            .retain(|i| !matches!(i, ResubIntent::AdvertiseService { service: s, .. } if s == service));
        self.send(OutgoingOp::UnadvertiseService { service: service.to_string() }).await
    }

    /// Fails every outstanding service call with `ConnectionLost`; called
    /// when the connection drops so no caller waits forever on a reply
    /// that will never arrive.
    pub fn fail_all_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(json!({ "error": "ConnectionLost" })));
            }
        }
    }

    /// Replays every resubscription intent in insertion order. Called by
    /// the connection manager on every `ready` event.
    pub async fn resubscribe_all(&self) -> Result<()> {
        let intents = self.resub_intents.lock().await.clone();
        for intent in intents {
            match intent {
                ResubIntent::Subscribe {
                    topic,
                    msg_type,
                    throttle_rate_ms,
                    queue_length,
                    compression,
                } => {
                    let id = {
                        let subs = self.subscriptions.lock().await;
                        subs.get(&topic).map(|r| r.id.clone())
                    };
                    let Some(id) = id else { continue };
                    self.send(OutgoingOp::Subscribe {
                        id,
                        topic,
                        msg_type,
                        throttle_rate_ms,
                        queue_length,
                        compression,
                    })
                    .await?;
                }
                ResubIntent::Advertise { topic, msg_type } => {
                    let id = {
                        let ads = self.advertisements.lock().await;
                        ads.get(&topic).map(|r| r.id.clone())
                    };
                    let Some(id) = id else { continue };
                    self.send(OutgoingOp::Advertise { id, topic, msg_type, latch: false }).await?;
                }
                ResubIntent::AdvertiseService { service, service_type, id } => {
                    self.send(OutgoingOp::AdvertiseService { id, service, service_type }).await?;
                }
            }
        }
        Ok(())
    }

    /// Number of resubscription intents currently tracked. Exposed for
    /// tests asserting resubscription fidelity.
    pub async fn intent_count(&self) -> usize {
        self.resub_intents.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_subscribe_frame() {
        let op = OutgoingOp::Subscribe {
            id: "subscribe:/chatter:0".into(),
            topic: "/chatter".into(),
            msg_type: Some("std_msgs/String".into()),
            throttle_rate_ms: Some(0),
            queue_length: Some(1),
            compression: Compression::None,
        };
        let v = op.to_value();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["topic"], "/chatter");
        assert_eq!(v["compression"], "none");
        assert_eq!(v["throttle_rate"], 0);
    }

    #[test]
    fn parses_publish_frame() {
        let text = r#"{"op":"publish","topic":"/chatter","msg":{"data":"hello"}}"#;
        match parse_frame(text).unwrap() {
            IncomingFrame::Publish { topic, msg } => {
                assert_eq!(topic, "/chatter");
                assert_eq!(msg["data"], "hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_service_response_failure() {
        let text = r#"{"op":"service_response","id":"x","values":{"err":"nope"},"result":false}"#;
        match parse_frame(text).unwrap() {
            IncomingFrame::ServiceResponse { id, values, result } => {
                assert_eq!(id.as_deref(), Some("x"));
                assert!(!result);
                assert_eq!(values["err"], "nope");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_reported_not_fatal() {
        let text = r#"{"op":"totally_unheard_of","foo":1}"#;
        match parse_frame(text).unwrap() {
            IncomingFrame::Unknown { op, .. } => assert_eq!(op, "totally_unheard_of"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn missing_op_field_is_invalid_frame() {
        let text = r#"{"topic":"/chatter"}"#;
        assert!(matches!(parse_frame(text), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn malformed_json_is_invalid_frame() {
        assert!(matches!(parse_frame("{not json"), Err(Error::InvalidFrame(_))));
    }
}
