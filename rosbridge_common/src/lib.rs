//! # rosbridge_common
//!
//! Error taxonomy and dynamic value helpers shared by the rosbridge client
//! engine. This crate is intentionally runtime-agnostic: it knows nothing
//! about WebSockets or tokio, only about the shapes errors and payloads take
//! on the wire.

/// The central error type returned by every fallible operation in the
/// engine.
///
/// Errors tied to one outstanding operation (a service call, a blocking
/// topic wait, a goal wait) only ever affect that operation's pending
/// entry. Session-level errors (transport open/close) are surfaced through
/// the event bus in addition to being returned here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport refused to open (DNS failure, connection refused, TLS
    /// handshake failure, etc).
    #[error("failed to connect to rosbridge server: {0}")]
    ConnectionFailed(String),
    /// The transport closed while one or more operations were in flight.
    /// All pending entries are rejected with this error when it occurs.
    #[error("connection to rosbridge server was lost")]
    ConnectionLost,
    /// `run()`'s readiness wait expired before the session reached `ready`.
    #[error("session did not become ready in time")]
    NotReady,
    /// A blocking call's deadline elapsed before a reply arrived.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The peer replied with `result: false`. Carries the `values` payload
    /// the peer sent alongside the failure.
    #[error("service call failed: {0}")]
    ServiceFailed(serde_json::Value),
    /// An inbound frame could not be parsed as a recognized rosbridge
    /// envelope. Logged and dropped; never terminates the session.
    #[error("received malformed frame: {0}")]
    InvalidFrame(String),
    /// A user-supplied callback (service server, subscriber) raised.
    /// Surfaced via the `error` event; never terminates the session.
    #[error("callback raised an error: {0}")]
    CallbackError(String),
    /// JSON encode/decode failure outside of frame parsing (e.g.
    /// serializing a request payload).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Catch-all for failures that don't cleanly fit the taxonomy above.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The open, recursive, untyped payload every topic message and service
/// request/response is expressed as. Topic and service schemas are never
/// enforced client-side.
pub type Value = serde_json::Value;

/// Ergonomic constructors for the handful of ROS value shapes that show up
/// constantly on the wire. These never make the engine's core aware of
/// message schemas; they just save callers from hand-writing the same JSON
/// shape over and over.
pub mod shapes {
    use super::Value;
    use serde_json::json;

    /// Builds a ROS `Time` value: `{secs, nsecs}`, both non-negative
    /// integers. The wire format never uses floats for time.
    pub fn time(secs: u32, nsecs: u32) -> Value {
        json!({ "secs": secs, "nsecs": nsecs })
    }

    /// Builds a `Time` value from the current wall clock, truncated to
    /// whole seconds and nanoseconds.
    pub fn time_from_duration(d: std::time::Duration) -> Value {
        time(d.as_secs() as u32, d.subsec_nanos())
    }

    /// Builds a ROS `Duration` value. Same shape as `Time`, different
    /// semantic meaning on the ROS side.
    pub fn duration(secs: i32, nsecs: i32) -> Value {
        json!({ "secs": secs, "nsecs": nsecs })
    }

    /// Builds a `std_msgs/Header` value with the given sequence id, stamp
    /// and frame id.
    pub fn header(seq: u32, stamp: Value, frame_id: &str) -> Value {
        json!({ "seq": seq, "stamp": stamp, "frame_id": frame_id })
    }

    /// Builds a `geometry_msgs/Point`.
    pub fn point(x: f64, y: f64, z: f64) -> Value {
        json!({ "x": x, "y": y, "z": z })
    }

    /// Builds a `geometry_msgs/Quaternion`, defaulting to the identity
    /// rotation when no components are given via `with_xyzw`.
    pub fn quaternion(x: f64, y: f64, z: f64, w: f64) -> Value {
        json!({ "x": x, "y": y, "z": z, "w": w })
    }

    /// Builds a `geometry_msgs/Pose` from a position and orientation.
    pub fn pose(position: Value, orientation: Value) -> Value {
        json!({ "position": position, "orientation": orientation })
    }

    /// Validates that every `secs`/`nsecs` pair reachable from `value` is
    /// encoded as a JSON integer, never a float. Used by tests to catch a
    /// stray float timestamp before it hits the wire.
    pub fn has_integer_stamps(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                let looks_like_stamp = map.contains_key("secs") && map.contains_key("nsecs");
                if looks_like_stamp {
                    let secs_ok = map.get("secs").is_some_and(|v| v.is_u64() || v.is_i64());
                    let nsecs_ok = map.get("nsecs").is_some_and(|v| v.is_u64() || v.is_i64());
                    if !(secs_ok && nsecs_ok) {
                        return false;
                    }
                }
                map.values().all(has_integer_stamps)
            }
            Value::Array(items) => items.iter().all(has_integer_stamps),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::shapes::*;

    #[test]
    fn time_is_always_integer() {
        let t = time(12, 500);
        assert!(has_integer_stamps(&t));
        assert_eq!(t["secs"], 12);
        assert_eq!(t["nsecs"], 500);
    }

    #[test]
    fn detects_float_stamp() {
        let bad = serde_json::json!({ "secs": 1.5, "nsecs": 0 });
        assert!(!has_integer_stamps(&bad));
    }

    #[test]
    fn header_nests_stamp() {
        let h = header(1, time(0, 0), "map");
        assert!(has_integer_stamps(&h));
        assert_eq!(h["frame_id"], "map");
    }
}
