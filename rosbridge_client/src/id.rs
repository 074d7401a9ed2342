//! Monotonic per-session identifier generator.
//!
//! IDs take the form `<stream-kind>:<name>:<monotonic-int>`, e.g.
//! `call_service:/rosout/get_loggers:7`. The prefix is purely informational
//! for debugging frames on the wire; only uniqueness within the session is
//! required.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates unique correlation ids for outgoing ops. One allocator per
/// session; the counter is never reset across reconnects so resubscription
/// never collides with ids still referenced by in-flight pending entries.
#[derive(Debug, Default)]
pub struct IdAllocator {
    counter: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Allocates the next id for a logical stream of the given `kind`
    /// (`"subscribe"`, `"call_service"`, `"advertise_service"`, ...) against
    /// `name` (the topic or service name).
    pub fn next(&self, kind: &str, name: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{kind}:{name}:{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let alloc = IdAllocator::new();
        let a = alloc.next("call_service", "/rosout/get_loggers");
        let b = alloc.next("call_service", "/rosout/get_loggers");
        assert_ne!(a, b);
        assert!(a.ends_with(":0"));
        assert!(b.ends_with(":1"));
    }

    #[test]
    fn prefix_carries_kind_and_name() {
        let alloc = IdAllocator::new();
        let id = alloc.next("subscribe", "/chatter");
        assert_eq!(id, "subscribe:/chatter:0");
    }
}
