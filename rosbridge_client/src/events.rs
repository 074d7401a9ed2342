//! Named-event pub/sub used both internally (wiring the connection manager
//! to the multiplexer) and as the library's public observation surface
//! (`ready`, `close`, `error`, ...).
//!
//! Delivery is synchronous in the caller's thread. A listener that returns
//! `Err` is caught and reported via the `error` event; it never prevents
//! the remaining listeners for that event from running.

use dashmap::DashMap;
use rosbridge_common::{Result, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single event listener. Takes the event's payload and may fail; a
/// failure is reported through the `error` event rather than propagated to
/// the emitter.
pub type Listener = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// Opaque handle returned by [`EventBus::on`] / [`EventBus::once`], usable
/// with [`EventBus::off`] to remove a listener before it would otherwise
/// fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

#[derive(Default)]
struct Listeners {
    entries: Vec<Entry>,
}

/// A named-event bus. Cloning shares the same underlying registry.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<DashMap<String, Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn register(&self, event: &str, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event.to_string())
            .or_default()
            .entries
            .push(Entry {
                id,
                listener,
                once,
            });
        id
    }

    /// Registers a persistent listener for `event`. Fires every time the
    /// event is emitted until removed with [`EventBus::off`].
    pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
        self.register(event, listener, false)
    }

    /// Registers a listener that fires at most once, then is automatically
    /// removed.
    pub fn once(&self, event: &str, listener: Listener) -> ListenerId {
        self.register(event, listener, true)
    }

    /// Removes a previously registered listener. No-op if it already fired
    /// (one-shot) or was already removed.
    pub fn off(&self, event: &str, id: ListenerId) {
        if let Some(mut listeners) = self.listeners.get_mut(event) {
            listeners.entries.retain(|e| e.id != id);
        }
    }

    /// Emits `event` with `payload` to every current listener, synchronously
    /// on the calling thread. One-shot listeners are removed after firing.
    pub fn emit(&self, event: &str, payload: Value) {
        let to_run: Vec<Entry> = match self.listeners.get_mut(event) {
            Some(mut listeners) => {
                let (once, persistent): (Vec<Entry>, Vec<Entry>) =
                    listeners.entries.drain(..).partition(|e| e.once);
                listeners.entries = persistent;
                once.into_iter()
                    .chain(listeners.entries.iter().map(|e| Entry {
                        id: e.id,
                        listener: e.listener.clone(),
                        once: e.once,
                    }))
                    .collect()
            }
            None => Vec::new(),
        };

        for entry in to_run {
            if let Err(e) = (entry.listener)(payload.clone()) {
                if event == "error" {
                    log::error!("listener for 'error' event itself failed: {e}");
                } else {
                    self.emit(
                        "error",
                        serde_json::json!({ "source_event": event, "message": e.to_string() }),
                    );
                }
            }
        }
    }

    /// Number of listeners (persistent + one-shot) currently registered for
    /// `event`. Mostly useful for tests.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|l| l.entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn persistent_listener_fires_repeatedly() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.on(
            "ready",
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.emit("ready", Value::Null);
        bus.emit("ready", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.once(
            "ready",
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.emit("ready", Value::Null);
        bus.emit("ready", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        bus.on("x", Arc::new(|_| Err(rosbridge_common::Error::CallbackError("boom".into()))));
        let ran2 = ran.clone();
        bus.on(
            "x",
            Arc::new(move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let saw_error = Arc::new(AtomicUsize::new(0));
        let saw_error2 = saw_error.clone();
        bus.on(
            "error",
            Arc::new(move |_| {
                saw_error2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.emit("x", Value::Null);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(saw_error.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.on(
            "ready",
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.off("ready", id);
        bus.emit("ready", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
