//! Delegate tasks and delegate responses

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::capability::{normalize_selector, ExecutionCapability};

/// Well-known setup abstraction keys
pub mod context_keys {
    pub const APP_ID: &str = "appId";
    pub const ENV_ID: &str = "envId";
    pub const ENV_TYPE: &str = "envType";
    pub const SERVICE_ID: &str = "serviceId";
    pub const INFRA_DEFINITION_ID: &str = "infrastructureDefinitionId";
}

/// Origin reported for selectors that come from the task's own tag list
pub const TASK_TAGS_ORIGIN: &str = "task tags";

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and waiting for a delegate
    Queued,
    /// Assigned to a delegate
    Acquired,
    Completed,
    Error,
    Expired,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Acquired => "acquired",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Expired => "expired",
            TaskStatus::Aborted => "aborted",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Acquired)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "acquired" => Ok(TaskStatus::Acquired),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            "expired" => Ok(TaskStatus::Expired),
            "aborted" => Ok(TaskStatus::Aborted),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Task payload. Parameters are opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// How long the task may wait for a result
    pub timeout_ms: u64,
    #[serde(default)]
    pub is_async: bool,
}

impl TaskData {
    pub fn new(task_type: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: serde_json::Value::Null,
            timeout_ms,
            is_async: false,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// `None` when the timeout does not fit a duration
    pub fn timeout(&self) -> Option<Duration> {
        Duration::try_milliseconds(i64::try_from(self.timeout_ms).ok()?)
    }

    /// Instant the task expires when submitted at `now`
    pub fn deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_add_signed(self.timeout()?)
    }
}

/// Producer request to run a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<ExecutionCapability>,
    pub data: TaskData,
    /// Skip broadcast and hand the task to this delegate only
    #[serde(default)]
    pub pre_assigned_delegate_id: Option<Uuid>,
}

impl TaskRequest {
    pub fn new(data: TaskData) -> Self {
        Self {
            setup_abstractions: BTreeMap::new(),
            tags: Vec::new(),
            capabilities: Vec::new(),
            data,
            pre_assigned_delegate_id: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn with_capability(mut self, capability: ExecutionCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn pre_assigned_to(mut self, delegate_id: Uuid) -> Self {
        self.pre_assigned_delegate_id = Some(delegate_id);
        self
    }
}

/// A unit of work submitted to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateTask {
    pub id: Uuid,
    pub account_id: String,
    pub setup_abstractions: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub capabilities: Vec<ExecutionCapability>,
    pub data: TaskData,
    pub status: TaskStatus,
    pub broadcast_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_broadcast_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_assigned_delegate_id: Option<Uuid>,
    pub validating_delegate_ids: BTreeSet<Uuid>,
    pub validation_complete_delegate_ids: BTreeSet<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_started_at: Option<DateTime<Utc>>,
    pub already_tried_delegates: BTreeSet<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<DelegateTaskResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DelegateTask {
    pub fn from_request(
        account_id: impl Into<String>,
        request: TaskRequest,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = request.data.deadline(now).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            setup_abstractions: request.setup_abstractions,
            tags: request.tags,
            capabilities: request.capabilities,
            data: request.data,
            status: TaskStatus::Queued,
            broadcast_count: 0,
            last_broadcast_at: None,
            delegate_id: None,
            pre_assigned_delegate_id: request.pre_assigned_delegate_id,
            validating_delegate_ids: BTreeSet::new(),
            validation_complete_delegate_ids: BTreeSet::new(),
            validation_started_at: None,
            already_tried_delegates: BTreeSet::new(),
            response: None,
            error_reason: None,
            created_at: now,
            expires_at,
        }
    }

    pub fn is_async(&self) -> bool {
        self.data.is_async
    }

    /// Whitelist keys derived from the connectivity capabilities
    pub fn criteria(&self) -> Vec<String> {
        let mut criteria: Vec<String> = self
            .capabilities
            .iter()
            .filter_map(ExecutionCapability::criteria)
            .collect();
        criteria.sort();
        criteria.dedup();
        criteria
    }

    /// Every required selector mapped to where it was configured.
    ///
    /// When a selector appears both in the tags and in a capability, the
    /// capability's origin wins.
    pub fn selector_origins(&self) -> BTreeMap<String, String> {
        let mut origins = BTreeMap::new();
        for tag in &self.tags {
            if let Some(selector) = normalize_selector(tag) {
                origins.insert(selector, TASK_TAGS_ORIGIN.to_string());
            }
        }
        for capability in &self.capabilities {
            if let ExecutionCapability::Selector { selectors, origin } = capability {
                let origin = origin.clone().unwrap_or_else(|| TASK_TAGS_ORIGIN.to_string());
                for selector in selectors.iter().filter_map(|s| normalize_selector(s)) {
                    origins.insert(selector, origin.clone());
                }
            }
        }
        origins
    }

    /// Delegates that were handed this task and gave it back
    pub fn has_tried(&self, delegate_id: Uuid) -> bool {
        self.already_tried_delegates.contains(&delegate_id)
    }

    /// All validating delegates have reported, or validation has run too long
    pub fn validation_complete(&self, now: DateTime<Utc>, validation_timeout: Duration) -> bool {
        let all_reported = !self.validating_delegate_ids.is_empty()
            && self
                .validating_delegate_ids
                .is_subset(&self.validation_complete_delegate_ids);
        let timed_out = self
            .validation_started_at
            .map(|started| now - started > validation_timeout)
            .unwrap_or(false);
        all_reported || timed_out
    }
}

/// Outcome code attached to a delegate's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Failed,
    RetryOnOtherDelegate,
}

/// Result reported by a delegate for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTaskResponse {
    pub response_code: ResponseCode,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DelegateTaskResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            response_code: ResponseCode::Ok,
            data,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::Failed,
            data: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }

    pub fn retry_on_other_delegate(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::RetryOnOtherDelegate,
            data: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }
}

/// One connectivity check a delegate ran for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub criteria: String,
    pub validated: bool,
}

/// Whitelist entry keyed by (account, delegate, criteria)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateConnectionResult {
    pub account_id: String,
    pub delegate_id: Uuid,
    pub criteria: String,
    pub validated: bool,
    pub last_updated_at: DateTime<Utc>,
}
