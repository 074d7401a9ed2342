//! SimpleActionServer: accepts goals via a goal topic, publishes
//! status/feedback/result, and supports preemption.
//!
//! Exactly one goal is active at a time. A goal arriving while one is
//! active is queued as `next` and the active goal's execution callback
//! observes [`ActiveGoalHandle::is_preempt_requested`] going true; it is
//! expected to wind down and call `set_preempted`.

use super::GoalState;
use crate::protocol::Multiplexer;
use crate::topic::{Publisher, Topic};
use rosbridge_common::{Result, Value};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Outcome {
    Succeeded(Value),
    Aborted(Value),
    Preempted(Value),
}

/// Handed to the user's execution callback for one accepted goal. The
/// callback is expected to call exactly one of `set_succeeded`,
/// `set_aborted`, or `set_preempted` before returning.
pub struct ActiveGoalHandle {
    id: String,
    goal: Value,
    preempt_requested: Arc<AtomicBool>,
    outcome: Arc<Mutex<Option<Outcome>>>,
    notify: Arc<tokio::sync::Notify>,
    feedback_pub: Arc<Publisher>,
}

impl ActiveGoalHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &Value {
        &self.goal
    }

    /// True once a new goal has arrived and is waiting for this one to
    /// yield.
    pub fn is_preempt_requested(&self) -> bool {
        self.preempt_requested.load(Ordering::SeqCst)
    }

    /// Resolves after this goal either reaches
    /// [`ActiveGoalHandle::is_preempt_requested`] or is externally
    /// cancelled. Useful for a callback that's otherwise waiting on work
    /// with no natural poll point.
    pub async fn preempted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_preempt_requested() {
                return;
            }
            notified.await;
        }
    }

    pub async fn publish_feedback(&self, feedback: Value) -> Result<()> {
        self.feedback_pub
            .publish(json!({
                "status": { "goal_id": { "id": self.id }, "status": GoalState::Active.to_wire() },
                "feedback": feedback,
            }))
            .await
    }

    pub fn set_succeeded(&self, result: Value) {
        self.finish(Outcome::Succeeded(result));
    }

    pub fn set_aborted(&self, result: Value) {
        self.finish(Outcome::Aborted(result));
    }

    pub fn set_preempted(&self, result: Value) {
        self.finish(Outcome::Preempted(result));
    }

    fn finish(&self, outcome: Outcome) {
        let mut guard = self.outcome.lock().unwrap();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        self.notify.notify_waiters();
    }
}

#[derive(Clone)]
struct Slot {
    id: String,
    goal: Value,
    preempt_requested: Arc<AtomicBool>,
    outcome: Arc<Mutex<Option<Outcome>>>,
    notify: Arc<tokio::sync::Notify>,
    status: Arc<Mutex<GoalState>>,
}

impl Slot {
    fn new(id: String, goal: Value, status: GoalState) -> Self {
        Self {
            id,
            goal,
            preempt_requested: Arc::new(AtomicBool::new(false)),
            outcome: Arc::new(Mutex::new(None)),
            notify: Arc::new(tokio::sync::Notify::new()),
            status: Arc::new(Mutex::new(status)),
        }
    }
}

type ExecuteFn = Arc<dyn Fn(ActiveGoalHandle) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One action server for `action_name`, enforcing "one active goal at a
/// time".
pub struct SimpleActionServer {
    status_pub: Arc<Publisher>,
    feedback_pub: Arc<Publisher>,
    result_pub: Arc<Publisher>,
    current: Mutex<Option<Slot>>,
    next: Mutex<Option<Slot>>,
    execute: ExecuteFn,
}

impl SimpleActionServer {
    /// Subscribes to `<action_name>/goal` and `<action_name>/cancel`,
    /// advertises `<action_name>/{status,feedback,result}`, and starts the
    /// 10 Hz status publishing loop.
    pub async fn new<F, Fut>(
        mux: Arc<Multiplexer>,
        action_name: impl Into<String>,
        action_type: impl Into<String>,
        execute: F,
    ) -> Result<Arc<Self>>
    where
        F: Fn(ActiveGoalHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action_name = action_name.into();
        let action_type = action_type.into();
        let execute: ExecuteFn = Arc::new(move |handle| Box::pin(execute(handle)));

        let status_topic = Topic::new(mux.clone(), format!("{action_name}/status"), "actionlib_msgs/GoalStatusArray");
        let feedback_topic = Topic::new(mux.clone(), format!("{action_name}/feedback"), format!("{action_type}Feedback"));
        let result_topic = Topic::new(mux.clone(), format!("{action_name}/result"), format!("{action_type}Result"));
        let goal_topic = Topic::new(mux.clone(), format!("{action_name}/goal"), format!("{action_type}Goal"));
        let cancel_topic = Topic::new(mux.clone(), format!("{action_name}/cancel"), "actionlib_msgs/GoalID");

        let status_pub = Arc::new(status_topic.advertise());
        let feedback_pub = Arc::new(feedback_topic.advertise());
        let result_pub = Arc::new(result_topic.advertise());

        let mut goal_sub = goal_topic.subscribe().await?;
        let mut cancel_sub = cancel_topic.subscribe().await?;

        let server = Arc::new(Self {
            status_pub,
            feedback_pub,
            result_pub,
            current: Mutex::new(None),
            next: Mutex::new(None),
            execute,
        });

        let goal_server = server.clone();
        tokio::spawn(async move {
            while let Ok(msg) = goal_sub.next().await {
                goal_server.accept_goal(msg).await;
            }
        });

        let cancel_server = server.clone();
        tokio::spawn(async move {
            while let Ok(msg) = cancel_sub.next().await {
                cancel_server.handle_cancel(&msg).await;
            }
        });

        server.clone().spawn_status_loop();

        Ok(server)
    }

    async fn accept_goal(self: &Arc<Self>, msg: Value) {
        let Some(id) = msg.pointer("/goal_id/id").and_then(Value::as_str) else {
            log::warn!("rejecting goal with no goal_id");
            return;
        };
        let goal_payload = msg.get("goal").cloned().unwrap_or(Value::Null);

        let had_current = {
            let mut current = self.current.lock().unwrap();
            if current.is_none() {
                *current = Some(Slot::new(id.to_string(), goal_payload.clone(), GoalState::Active));
                false
            } else {
                if let Some(cur) = current.as_ref() {
                    cur.preempt_requested.store(true, Ordering::SeqCst);
                    cur.notify.notify_waiters();
                }
                true
            }
        };

        if had_current {
            *self.next.lock().unwrap() = Some(Slot::new(id.to_string(), goal_payload, GoalState::Pending));
            return;
        }

        let slot = self.current.lock().unwrap().clone().expect("just inserted");
        self.spawn_execution(slot);
    }

    fn spawn_execution(self: &Arc<Self>, slot: Slot) {
        let server = self.clone();
        let feedback_pub = self.feedback_pub.clone();
        let execute = self.execute.clone();
        tokio::spawn(async move {
            let handle = ActiveGoalHandle {
                id: slot.id.clone(),
                goal: slot.goal.clone(),
                preempt_requested: slot.preempt_requested.clone(),
                outcome: slot.outcome.clone(),
                notify: slot.notify.clone(),
                feedback_pub,
            };
            execute(handle).await;
            let outcome = slot
                .outcome
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Outcome::Aborted(json!({ "message": "goal execution ended without a terminal call" })));
            server.finish_current(slot.id, outcome).await;
        });
    }

    async fn finish_current(self: &Arc<Self>, id: String, outcome: Outcome) {
        let (status, result) = match outcome {
            Outcome::Succeeded(r) => (GoalState::Succeeded, r),
            Outcome::Aborted(r) => (GoalState::Aborted, r),
            Outcome::Preempted(r) => (GoalState::Preempted, r),
        };
        if let Err(e) = self
            .result_pub
            .publish(json!({
                "status": { "goal_id": { "id": id }, "status": status.to_wire() },
                "result": result,
            }))
            .await
        {
            log::warn!("failed to publish result for goal {id}: {e}");
        }

        *self.current.lock().unwrap() = None;
        let promoted = self.next.lock().unwrap().take();
        if let Some(slot) = promoted {
            *slot.status.lock().unwrap() = GoalState::Active;
            *self.current.lock().unwrap() = Some(slot.clone());
            self.spawn_execution(slot);
        }
    }

    async fn handle_cancel(self: &Arc<Self>, cancel_msg: &Value) {
        let target = cancel_msg.get("id").and_then(Value::as_str).unwrap_or("");
        let cancel_all = target.is_empty();

        let preempt_current = {
            let current = self.current.lock().unwrap();
            current.as_ref().map(|c| cancel_all || c.id == target).unwrap_or(false)
        };
        if preempt_current {
            let current = self.current.lock().unwrap();
            if let Some(cur) = current.as_ref() {
                cur.preempt_requested.store(true, Ordering::SeqCst);
                cur.notify.notify_waiters();
            }
        }

        let recalled = {
            let mut next = self.next.lock().unwrap();
            match next.as_ref() {
                Some(n) if cancel_all || n.id == target => next.take(),
                _ => None,
            }
        };
        if let Some(slot) = recalled {
            let _ = self
                .result_pub
                .publish(json!({
                    "status": { "goal_id": { "id": slot.id }, "status": GoalState::Recalled.to_wire() },
                    "result": Value::Null,
                }))
                .await;
        }
    }

    fn spawn_status_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                let mut status_list = Vec::new();
                if let Some(cur) = self.current.lock().unwrap().as_ref() {
                    status_list.push(json!({
                        "goal_id": { "id": cur.id },
                        "status": (*cur.status.lock().unwrap()).to_wire(),
                    }));
                }
                if let Some(next) = self.next.lock().unwrap().as_ref() {
                    status_list.push(json!({
                        "goal_id": { "id": next.id },
                        "status": GoalState::Pending.to_wire(),
                    }));
                }
                if let Err(e) = self.status_pub.publish(json!({ "status_list": status_list })).await {
                    log::trace!("status tick failed to publish (disconnected?): {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Backoff, ConnectionManager};
    use crate::events::EventBus;
    use crate::id::IdAllocator;
    use crate::transport::mock::MockConnector;

    async fn test_mux() -> Arc<Multiplexer> {
        let events = EventBus::new();
        let connector = MockConnector::new();
        let conn = ConnectionManager::new(connector, "ws://x".into(), None, Backoff::default(), events.clone());
        let mux = Arc::new(Multiplexer::new(Arc::new(conn.clone()), events, Arc::new(IdAllocator::new())));
        conn.set_multiplexer(&mux).await;
        conn.run(Duration::from_secs(1)).await.unwrap();
        mux
    }

    #[tokio::test]
    async fn accepts_a_single_goal_and_runs_it() {
        let mux = test_mux().await;
        let server = SimpleActionServer::new(mux, "/fibonacci", "actionlib_tutorials/Fibonacci", |handle: ActiveGoalHandle| async move {
            handle.set_succeeded(json!({ "sequence": [0, 1, 1, 2, 3, 5] }));
        })
        .await
        .unwrap();

        server
            .accept_goal(json!({ "goal_id": { "id": "goal:1" }, "goal": { "order": 5 } }))
            .await;
        // Give the spawned execution task a chance to run to completion.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.current.lock().unwrap().is_none());
    }
}
