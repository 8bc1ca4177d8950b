use crate::types::TaskStatus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Task lifecycle notification delivered to task callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Added {
        task_id: String,
    },
    Assigned {
        task_id: String,
        agent_ids: Vec<String>,
    },
    Progress {
        task_id: String,
        progress: f64,
        status: TaskStatus,
    },
    Completed {
        task_id: String,
        agent_ids: Vec<String>,
    },
    Failed {
        task_id: String,
        reason: Option<String>,
    },
    Cancelled {
        task_id: String,
        reason: String,
    },
}

/// Agent registry notification delivered to agent callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Registered { agent_id: String },
    Unregistered { agent_id: String },
    Updated { agent_id: String },
}

pub type TaskCallback = Arc<dyn Fn(&TaskEvent) + Send + Sync>;
pub type AgentCallback = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Registered callbacks. Each invocation is isolated: a panicking callback is
/// logged and the remaining callbacks still run.
#[derive(Default)]
pub(crate) struct Subscribers {
    task: RwLock<Vec<TaskCallback>>,
    agent: RwLock<Vec<AgentCallback>>,
}

impl Subscribers {
    pub(crate) fn add_task(&self, callback: TaskCallback) {
        self.task.write().push(callback);
    }

    pub(crate) fn add_agent(&self, callback: AgentCallback) {
        self.agent.write().push(callback);
    }

    pub(crate) fn emit_tasks(&self, events: &[TaskEvent]) {
        if events.is_empty() {
            return;
        }
        // Snapshot so callbacks may register further callbacks.
        let callbacks = self.task.read().clone();
        for event in events {
            for callback in &callbacks {
                invoke(callback.as_ref(), event);
            }
        }
    }

    pub(crate) fn emit_agent(&self, event: &AgentEvent) {
        let callbacks = self.agent.read().clone();
        for callback in &callbacks {
            invoke(callback.as_ref(), event);
        }
    }
}

fn invoke<E: Debug>(callback: &(dyn Fn(&E) + Send + Sync), event: &E) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(event = ?event, "Event callback panicked");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_panicking_callback_is_isolated() {
        let subscribers = Subscribers::default();
        let calls = Arc::new(AtomicUsize::new(0));

        subscribers.add_task(Arc::new(|_: &TaskEvent| panic!("subscriber bug")));
        let counter = calls.clone();
        subscribers.add_task(Arc::new(move |_: &TaskEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        subscribers.emit_tasks(&[
            TaskEvent::Added {
                task_id: "t1".into(),
            },
            TaskEvent::Added {
                task_id: "t2".into(),
            },
        ]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_agent_callbacks_receive_event() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        subscribers.add_agent(Arc::new(move |event: &AgentEvent| sink.lock().push(event.clone())));

        subscribers.emit_agent(&AgentEvent::Registered {
            agent_id: "a1".into(),
        });
        assert_eq!(
            *seen.lock(),
            vec![AgentEvent::Registered {
                agent_id: "a1".into()
            }]
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(TaskEvent::Cancelled {
            task_id: "t1".into(),
            reason: "shutdown".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "cancelled");
        assert_eq!(json["reason"], "shutdown");
    }
}
