//! Resource constraint model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order in which blocked consumers are promoted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintStrategy {
    #[default]
    Fifo,
}

impl ConstraintStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintStrategy::Fifo => "fifo",
        }
    }
}

impl std::str::FromStr for ConstraintStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(ConstraintStrategy::Fifo),
            _ => Err(format!("Invalid constraint strategy: {}", s)),
        }
    }
}

/// A named, capacity-limited resource owned by an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub capacity: u32,
    pub strategy: ConstraintStrategy,
    pub created_at: DateTime<Utc>,
}

/// State of one consumer's claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Holds its permits
    Active,
    /// Queued until capacity frees up
    Blocked,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Active => "active",
            ConsumerState::Blocked => "blocked",
        }
    }
}

impl std::str::FromStr for ConsumerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConsumerState::Active),
            "blocked" => Ok(ConsumerState::Blocked),
            _ => Err(format!("Invalid consumer state: {}", s)),
        }
    }
}

/// One consumer's claim against a (constraint, unit) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraintInstance {
    pub id: Uuid,
    pub constraint_id: Uuid,
    pub resource_unit: String,
    pub consumer_id: String,
    /// Kind of entity whose completion releases the claim, e.g. "workflow_execution"
    pub release_entity_type: String,
    pub release_entity_id: String,
    pub permits: u32,
    pub state: ConsumerState,
    /// Arrival order within the unit
    pub ordinal: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Request to acquire permits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRequest {
    pub consumer_id: String,
    #[serde(default = "default_permits")]
    pub permits: u32,
    #[serde(default)]
    pub release_entity_type: String,
    #[serde(default)]
    pub release_entity_id: String,
}

fn default_permits() -> u32 {
    1
}

impl ConsumerRequest {
    pub fn new(consumer_id: impl Into<String>, permits: u32) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            permits,
            release_entity_type: String::new(),
            release_entity_id: String::new(),
        }
    }

    pub fn released_by(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.release_entity_type = entity_type.into();
        self.release_entity_id = entity_id.into();
        self
    }
}

/// Active holders of one constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintUsage {
    pub constraint: ResourceConstraint,
    /// Ordered by unit, then arrival
    pub active: Vec<ResourceConstraintInstance>,
}

/// Published whenever a blocked consumer becomes active
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThrottleEvent {
    ConsumerUnblocked {
        constraint_id: Uuid,
        resource_unit: String,
        consumer_id: String,
        release_entity_type: String,
        release_entity_id: String,
    },
}
