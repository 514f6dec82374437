//! Wire types for the conductor protocol
//!
//! These types mirror the server's HTTP bodies and delegate stream messages.
//! Fields the CLI never reads are kept as raw JSON.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Registration body
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewDelegate {
    pub host_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub delegate_name: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delegate {
    pub id: Uuid,
    pub account_id: String,
    pub host_name: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Capability a task requires of its delegate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionCapability {
    Selector {
        selectors: Vec<String>,
        #[serde(default)]
        origin: Option<String>,
    },
    Http {
        url: String,
    },
    SocketConnectivity {
        host: String,
        port: u16,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub timeout_ms: u64,
    #[serde(default)]
    pub is_async: bool,
}

/// Submission body
#[derive(Debug, Clone, Serialize)]
pub struct TaskRequest {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub setup_abstractions: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub capabilities: Vec<ExecutionCapability>,
    pub data: TaskData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_assigned_delegate_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegateTask {
    pub id: Uuid,
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<ExecutionCapability>,
    pub data: TaskData,
    #[serde(default)]
    pub delegate_id: Option<Uuid>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Failed,
    RetryOnOtherDelegate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateTaskResponse {
    pub response_code: ResponseCode,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub criteria: String,
    pub validated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub delegate_id: Option<Uuid>,
    #[serde(default)]
    pub response: Option<DelegateTaskResponse>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

/// Body of a synchronous execution, for both 200 and 504
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed(TaskCompletion),
    TimedOut { task_id: Uuid },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Assigned { task: DelegateTask },
    ValidationRequired { task: DelegateTask },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    TaskBroadcast {
        account_id: String,
        task_id: Uuid,
        delegate_ids: Vec<Uuid>,
        is_async: bool,
    },
    TaskAssigned {
        account_id: String,
        task_id: Uuid,
        delegate_id: Uuid,
    },
    TaskCompleted {
        account_id: String,
        task_id: Uuid,
        status: String,
    },
    TaskAborted {
        account_id: String,
        task_id: Uuid,
        delegate_id: Option<Uuid>,
    },
    TaskRequeued {
        account_id: String,
        task_id: Uuid,
        from_delegate: Uuid,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingTaskEvent {
    pub task_id: Uuid,
    pub is_async: bool,
}

/// Messages from delegate to server
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Heartbeat { connection_id: Uuid, version: String },
    Poll,
    Acquire { task_id: Uuid },
    Validation {
        task_id: Uuid,
        results: Vec<ConnectionCheck>,
    },
    Response {
        task_id: Uuid,
        response: DelegateTaskResponse,
    },
}

/// Messages from server to delegate
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        delegate_id: Uuid,
    },
    Dispatch {
        event: DispatchEvent,
    },
    HeartbeatAck {
        connection_id: Uuid,
    },
    Pending {
        tasks: Vec<PendingTaskEvent>,
    },
    Acquired {
        task_id: Uuid,
        outcome: Option<AcquireOutcome>,
    },
    ValidationRecorded {
        task_id: Uuid,
        task: Option<DelegateTask>,
    },
    ResponseAccepted {
        task_id: Uuid,
    },
    Error {
        message: String,
    },
}

/// Resource constraint throttle bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerRequest {
    pub consumer_id: String,
    pub permits: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub release_entity_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub release_entity_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConstraintInstance {
    pub id: Uuid,
    pub resource_unit: String,
    pub consumer_id: String,
    pub permits: u32,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquirePermitsResponse {
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromotedResponse {
    pub promoted: Vec<ResourceConstraintInstance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintUsage {
    pub constraint: ResourceConstraint,
    pub active: Vec<ResourceConstraintInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::Acquire {
            task_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"acquire""#));
    }

    #[test]
    fn test_server_dispatch_deserialization() {
        let json = r#"{
            "type": "dispatch",
            "event": {
                "type": "task_broadcast",
                "account_id": "acct",
                "task_id": "00000000-0000-0000-0000-000000000000",
                "delegate_ids": [],
                "is_async": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::Dispatch {
                event: DispatchEvent::TaskBroadcast { is_async: true, .. }
            }
        ));
    }

    #[test]
    fn test_timed_out_outcome() {
        let json = r#"{"outcome":"timed_out","task_id":"00000000-0000-0000-0000-000000000000"}"#;
        let outcome: ExecutionOutcome = serde_json::from_str(json).unwrap();
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    }

    #[test]
    fn test_response_code_wire_names() {
        let response = DelegateTaskResponse {
            response_code: ResponseCode::RetryOnOtherDelegate,
            data: serde_json::Value::Null,
            error_message: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("RETRY_ON_OTHER_DELEGATE"));
    }
}
