//! Wait registry for synchronous task execution
//!
//! Maps a task id to the channel its caller is blocked on. Resolving an
//! entry removes it, so a waiter is woken at most once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::task::model::{DelegateTaskResponse, TaskStatus};

/// Final state of a task as delivered to waiters and callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub account_id: String,
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<DelegateTaskResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Default)]
pub struct WaitRegistry {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<TaskCompletion>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register before the task becomes visible to delegates, so a fast
    /// response cannot be missed
    pub fn register(&self, task_id: Uuid) -> oneshot::Receiver<TaskCompletion> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(task_id, tx);
        rx
    }

    /// Wake the waiter for this task, if any. Returns true if one was woken.
    pub fn notify(&self, completion: TaskCompletion) -> bool {
        let sender = self.waiters.lock().remove(&completion.task_id);
        match sender {
            Some(tx) => tx.send(completion).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter that gave up
    pub fn cancel(&self, task_id: Uuid) {
        self.waiters.lock().remove(&task_id);
    }

    pub fn is_waiting(&self, task_id: Uuid) -> bool {
        self.waiters.lock().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
