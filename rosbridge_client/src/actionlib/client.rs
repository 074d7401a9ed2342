//! Actionlib client: translates `goal/cancel/status/feedback/result` topic
//! traffic into a request/response-with-preemption abstraction.

use super::GoalState;
use crate::events::EventBus;
use crate::id::IdAllocator;
use crate::protocol::Multiplexer;
use crate::topic::{Publisher, Topic};
use rosbridge_common::{shapes, Error, Result, Value};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct GoalInner {
    id: String,
    goal_message: Value,
    state: Mutex<GoalState>,
    result: Mutex<Option<Value>>,
    cancel_requested: AtomicBool,
    events: EventBus,
    notify: tokio::sync::Notify,
}

/// A single in-flight (or completed) action goal. Cheap to clone; every
/// clone observes the same underlying state.
#[derive(Clone)]
pub struct Goal {
    inner: Arc<GoalInner>,
    cancel_pub: Arc<Publisher>,
}

impl Goal {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn goal_message(&self) -> &Value {
        &self.inner.goal_message
    }

    pub fn status(&self) -> GoalState {
        *self.inner.state.lock().unwrap()
    }

    pub fn last_result(&self) -> Option<Value> {
        self.inner.result.lock().unwrap().clone()
    }

    /// A goal is terminal iff both a result has been observed on
    /// `<name>/result` AND its latest status is in the terminal set.
    /// Status alone is deliberately not enough: actionlib servers are known
    /// to publish a terminal status tick before the matching result frame,
    /// and reporting terminal on status alone would race that gap.
    pub fn is_terminal(&self) -> bool {
        self.terminal_result().is_some()
    }

    fn terminal_result(&self) -> Option<Value> {
        let status = *self.inner.state.lock().unwrap();
        if !status.is_terminal_status() {
            return None;
        }
        self.inner.result.lock().unwrap().clone()
    }

    /// Registers a persistent listener for this goal's `status`,
    /// `feedback`, or `result` events.
    pub fn on(&self, event: &str, listener: crate::events::Listener) -> crate::events::ListenerId {
        self.inner.events.on(event, listener)
    }

    /// Awaits the goal reaching a terminal state and returns the observed
    /// result payload, without blocking the calling thread.
    pub async fn wait_for_result(&self) -> Value {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(result) = self.terminal_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Blocking variant of [`Goal::wait_for_result`].
    pub fn wait_for_result_blocking(&self, timeout: Duration) -> Result<Value> {
        tokio::runtime::Handle::current()
            .block_on(tokio::time::timeout(timeout, self.wait_for_result()))
            .map_err(|_| Error::Timeout(format!("goal {} did not terminate", self.inner.id)))
    }

    /// Publishes a cancel request for this goal. Idempotent: a second
    /// cancel is a harmless no-op.
    pub async fn cancel(&self) -> Result<()> {
        if self.inner.cancel_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_pub
            .publish(json!({ "stamp": shapes::time(0, 0), "id": self.inner.id }))
            .await
    }

    fn update_status(&self, status: GoalState) {
        *self.inner.state.lock().unwrap() = status;
        self.inner.events.emit("status", json!({ "status": status.to_wire() }));
        self.inner.notify.notify_waiters();
    }

    fn update_feedback(&self, feedback: Value) {
        self.inner.events.emit("feedback", feedback);
    }

    fn update_result(&self, result: Value) {
        *self.inner.result.lock().unwrap() = Some(result.clone());
        self.inner.events.emit("result", result);
        self.inner.notify.notify_waiters();
    }
}

/// Owns the five topics for one action name and the map of goals sent
/// through it.
pub struct ActionClient {
    action_name: String,
    action_type: String,
    ids: Arc<IdAllocator>,
    goal_pub: Arc<Publisher>,
    cancel_pub: Arc<Publisher>,
    goals: Arc<dashmap::DashMap<String, Goal>>,
}

impl ActionClient {
    pub async fn new(mux: Arc<Multiplexer>, ids: Arc<IdAllocator>, action_name: impl Into<String>, action_type: impl Into<String>) -> Result<Self> {
        let action_name = action_name.into();
        let action_type = action_type.into();

        let goal_topic = Topic::new(mux.clone(), format!("{action_name}/goal"), format!("{action_type}Goal"));
        let cancel_topic = Topic::new(mux.clone(), format!("{action_name}/cancel"), "actionlib_msgs/GoalID");
        let status_topic = Topic::new(mux.clone(), format!("{action_name}/status"), "actionlib_msgs/GoalStatusArray");
        let feedback_topic = Topic::new(mux.clone(), format!("{action_name}/feedback"), format!("{action_type}Feedback"));
        let result_topic = Topic::new(mux.clone(), format!("{action_name}/result"), format!("{action_type}Result"));

        let goal_pub = Arc::new(goal_topic.advertise());
        let cancel_pub = Arc::new(cancel_topic.advertise());

        let goals: Arc<dashmap::DashMap<String, Goal>> = Arc::new(dashmap::DashMap::new());

        let mut status_sub = status_topic.subscribe().await?;
        let goals_for_status = goals.clone();
        tokio::spawn(async move {
            while let Ok(msg) = status_sub.next().await {
                dispatch_status(&goals_for_status, &msg);
            }
        });

        let mut feedback_sub = feedback_topic.subscribe().await?;
        let goals_for_feedback = goals.clone();
        tokio::spawn(async move {
            while let Ok(msg) = feedback_sub.next().await {
                dispatch_feedback(&goals_for_feedback, &msg);
            }
        });

        let mut result_sub = result_topic.subscribe().await?;
        let goals_for_result = goals.clone();
        tokio::spawn(async move {
            while let Ok(msg) = result_sub.next().await {
                dispatch_result(&goals_for_result, &msg);
            }
        });

        Ok(Self {
            action_name,
            action_type,
            ids,
            goal_pub,
            cancel_pub,
            goals,
        })
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Sends a new goal and returns a handle to track it.
    pub async fn send_goal(&self, goal_message: Value) -> Result<Goal> {
        let goal_id = self.ids.next("goal", &self.action_name);
        let envelope = json!({
            "goal_id": { "stamp": shapes::time(0, 0), "id": goal_id },
            "goal": goal_message,
        });
        self.goal_pub.publish(envelope).await?;

        let goal = Goal {
            inner: Arc::new(GoalInner {
                id: goal_id.clone(),
                goal_message,
                state: Mutex::new(GoalState::Pending),
                result: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
                events: EventBus::new(),
                notify: tokio::sync::Notify::new(),
            }),
            cancel_pub: self.cancel_pub.clone(),
        };
        self.goals.insert(goal_id, goal.clone());
        Ok(goal)
    }

    /// Looks up a previously sent goal by id.
    pub fn goal(&self, goal_id: &str) -> Option<Goal> {
        self.goals.get(goal_id).map(|g| g.clone())
    }

    /// Cancels a goal by id. A no-op if the id is unknown to this client.
    pub async fn cancel(&self, goal_id: &str) -> Result<()> {
        match self.goal(goal_id) {
            Some(goal) => goal.cancel().await,
            None => Ok(()),
        }
    }
}

fn dispatch_status(goals: &dashmap::DashMap<String, Goal>, msg: &Value) {
    let Some(entries) = msg.get("status_list").and_then(Value::as_array) else {
        return;
    };
    for entry in entries {
        let Some(id) = entry.pointer("/goal_id/id").and_then(Value::as_str) else {
            continue;
        };
        let Some(code) = entry.get("status").and_then(Value::as_u64) else {
            continue;
        };
        let Some(status) = GoalState::from_wire(code as u8) else {
            log::warn!("unrecognized goal status code {code} for goal {id}");
            continue;
        };
        if let Some(goal) = goals.get(id) {
            goal.update_status(status);
        }
    }
}

fn dispatch_feedback(goals: &dashmap::DashMap<String, Goal>, msg: &Value) {
    let Some(id) = msg.pointer("/status/goal_id/id").and_then(Value::as_str) else {
        return;
    };
    if let Some(goal) = goals.get(id) {
        let feedback = msg.get("feedback").cloned().unwrap_or(Value::Null);
        goal.update_feedback(feedback);
        if let Some(code) = msg.pointer("/status/status").and_then(Value::as_u64) {
            if let Some(status) = GoalState::from_wire(code as u8) {
                goal.update_status(status);
            }
        }
    }
}

fn dispatch_result(goals: &dashmap::DashMap<String, Goal>, msg: &Value) {
    let Some(id) = msg.pointer("/status/goal_id/id").and_then(Value::as_str) else {
        return;
    };
    if let Some(goal) = goals.get(id) {
        if let Some(code) = msg.pointer("/status/status").and_then(Value::as_u64) {
            if let Some(status) = GoalState::from_wire(code as u8) {
                goal.update_status(status);
            }
        }
        let result = msg.get("result").cloned().unwrap_or(Value::Null);
        goal.update_result(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Backoff, ConnectionManager};
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
    async fn goal_is_not_terminal_on_status_alone() {
        let mux = test_mux().await;
        let client = ActionClient::new(mux, Arc::new(IdAllocator::new()), "/fibonacci", "actionlib_tutorials/Fibonacci")
            .await
            .unwrap();
        let goal = client.send_goal(json!({ "order": 5 })).await.unwrap();
        goal.update_status(GoalState::Succeeded);
        assert!(!goal.is_terminal(), "status alone must never be reported terminal");
        goal.update_result(json!({ "sequence": [0, 1, 1, 2, 3, 5] }));
        assert!(goal.is_terminal());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mux = test_mux().await;
        let client = ActionClient::new(mux, Arc::new(IdAllocator::new()), "/fibonacci", "actionlib_tutorials/Fibonacci")
            .await
            .unwrap();
        let goal = client.send_goal(json!({ "order": 1 })).await.unwrap();
        goal.cancel().await.unwrap();
        goal.cancel().await.unwrap();
        assert!(goal.inner.cancel_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelling_unknown_goal_is_a_no_op() {
        let mux = test_mux().await;
        let client = ActionClient::new(mux, Arc::new(IdAllocator::new()), "/fibonacci", "actionlib_tutorials/Fibonacci")
            .await
            .unwrap();
        client.cancel("goal:/fibonacci:999").await.unwrap();
    }
}
