//! Tasks and the execution capabilities they require

pub mod capability;
pub mod model;

pub use capability::{normalize_selector, trimmed_lowercase_set, ExecutionCapability};
pub use model::{
    context_keys, ConnectionCheck, DelegateConnectionResult, DelegateTask, DelegateTaskResponse,
    ResponseCode, TaskData, TaskRequest, TaskStatus,
};
