//! Selection audit log
//!
//! A `BatchSelectionLog` collects why each delegate was accepted or rejected
//! during one assignment attempt for one task. It is flushed once with
//! [`SelectionLogService::save`] and then dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;

/// Audit group identifiers
pub mod groups {
    pub const CAN_ASSIGN: &str = "CAN_ASSIGN";
    pub const NO_INCLUDE_SCOPE_MATCHED: &str = "NO_INCLUDE_SCOPE_MATCHED";
    pub const EXCLUDE_SCOPE_MATCHED: &str = "EXCLUDE_SCOPE_MATCHED";
    pub const MISSING_SELECTOR: &str = "MISSING_SELECTOR";
    pub const MISSING_ALL_SELECTORS: &str = "MISSING_ALL_SELECTORS";
    pub const DISCONNECTED: &str = "DISCONNECTED";
    pub const WAITING_ON_APPROVAL: &str = "WAITING_ON_APPROVAL";
    pub const TASK_ASSIGNED: &str = "TASK_ASSIGNED";
}

/// Outcome recorded for a group of delegates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionConclusion {
    Accepted,
    Rejected,
    Disconnected,
    WaitingForApproval,
    Selected,
}

impl SelectionConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionConclusion::Accepted => "accepted",
            SelectionConclusion::Rejected => "rejected",
            SelectionConclusion::Disconnected => "disconnected",
            SelectionConclusion::WaitingForApproval => "waiting_for_approval",
            SelectionConclusion::Selected => "selected",
        }
    }
}

impl std::str::FromStr for SelectionConclusion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(SelectionConclusion::Accepted),
            "rejected" => Ok(SelectionConclusion::Rejected),
            "disconnected" => Ok(SelectionConclusion::Disconnected),
            "waiting_for_approval" => Ok(SelectionConclusion::WaitingForApproval),
            "selected" => Ok(SelectionConclusion::Selected),
            _ => Err(format!("Invalid selection conclusion: {}", s)),
        }
    }
}

/// One accumulated decision; delegates sharing group and message are merged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionLogEntry {
    pub delegate_ids: BTreeSet<Uuid>,
    pub group_id: String,
    pub conclusion: SelectionConclusion,
    pub message: String,
    pub event_timestamp: DateTime<Utc>,
}

/// A persisted entry as read back for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionLogRecord {
    pub id: Uuid,
    pub account_id: String,
    pub task_id: Uuid,
    #[serde(flatten)]
    pub entry: SelectionLogEntry,
}

/// Per-attempt accumulator. Entries are never removed once added.
#[derive(Debug, Clone)]
pub struct BatchSelectionLog {
    account_id: String,
    task_id: Uuid,
    enabled: bool,
    entries: Vec<SelectionLogEntry>,
}

impl BatchSelectionLog {
    pub fn new(account_id: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            account_id: account_id.into(),
            task_id,
            enabled: true,
            entries: Vec::new(),
        }
    }

    /// A batch that records nothing
    pub fn disabled(account_id: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            enabled: false,
            ..Self::new(account_id, task_id)
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn entries(&self) -> &[SelectionLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add<I>(
        &mut self,
        delegate_ids: I,
        group_id: &str,
        conclusion: SelectionConclusion,
        message: String,
        at: DateTime<Utc>,
    ) where
        I: IntoIterator<Item = Uuid>,
    {
        if !self.enabled {
            return;
        }
        let delegate_ids: BTreeSet<Uuid> = delegate_ids.into_iter().collect();
        if delegate_ids.is_empty() {
            return;
        }

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.group_id == group_id && e.message == message)
        {
            existing.delegate_ids.extend(delegate_ids);
            return;
        }

        self.entries.push(SelectionLogEntry {
            delegate_ids,
            group_id: group_id.to_string(),
            conclusion,
            message,
            event_timestamp: at,
        });
    }

    pub fn log_can_assign(&mut self, delegate_id: Uuid, at: DateTime<Utc>) {
        self.add(
            [delegate_id],
            groups::CAN_ASSIGN,
            SelectionConclusion::Accepted,
            "Successfully matched required delegate capabilities".to_string(),
            at,
        );
    }

    pub fn log_no_include_scope_matched(&mut self, delegate_id: Uuid, at: DateTime<Utc>) {
        self.add(
            [delegate_id],
            groups::NO_INCLUDE_SCOPE_MATCHED,
            SelectionConclusion::Rejected,
            "No matching include scope".to_string(),
            at,
        );
    }

    pub fn log_exclude_scope_matched(&mut self, delegate_id: Uuid, scope_name: &str, at: DateTime<Utc>) {
        self.add(
            [delegate_id],
            groups::EXCLUDE_SCOPE_MATCHED,
            SelectionConclusion::Rejected,
            format!("Matched exclude scope {}", scope_name),
            at,
        );
    }

    pub fn log_missing_all_selectors(&mut self, delegate_id: Uuid, at: DateTime<Utc>) {
        self.add(
            [delegate_id],
            groups::MISSING_ALL_SELECTORS,
            SelectionConclusion::Rejected,
            "Missing all selectors".to_string(),
            at,
        );
    }

    pub fn log_missing_selector(
        &mut self,
        delegate_id: Uuid,
        selector: &str,
        origin: &str,
        at: DateTime<Utc>,
    ) {
        self.add(
            [delegate_id],
            groups::MISSING_SELECTOR,
            SelectionConclusion::Rejected,
            format!(
                "The selector {} is configured in {}, but is not attached to this Delegate.",
                selector, origin
            ),
            at,
        );
    }

    pub fn log_disconnected_delegates<I>(&mut self, delegate_ids: I, at: DateTime<Utc>)
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.add(
            delegate_ids,
            groups::DISCONNECTED,
            SelectionConclusion::Disconnected,
            "Delegate was disconnected".to_string(),
            at,
        );
    }

    pub fn log_waiting_for_approval_delegates<I>(&mut self, delegate_ids: I, at: DateTime<Utc>)
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.add(
            delegate_ids,
            groups::WAITING_ON_APPROVAL,
            SelectionConclusion::WaitingForApproval,
            "Delegate was waiting for approval".to_string(),
            at,
        );
    }

    pub fn log_task_assigned(&mut self, delegate_id: Uuid, at: DateTime<Utc>) {
        self.add(
            [delegate_id],
            groups::TASK_ASSIGNED,
            SelectionConclusion::Selected,
            "Delegate assigned for task execution".to_string(),
            at,
        );
    }
}

/// Creates batches and persists them
pub struct SelectionLogService {
    store: Store,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl SelectionLogService {
    pub fn new(store: Store, clock: Arc<dyn Clock>, enabled: bool) -> Self {
        Self {
            store,
            clock,
            enabled,
        }
    }

    pub fn create_batch(&self, account_id: &str, task_id: Uuid) -> BatchSelectionLog {
        if self.enabled {
            BatchSelectionLog::new(account_id, task_id)
        } else {
            BatchSelectionLog::disabled(account_id, task_id)
        }
    }

    /// Flush a batch. Failures are logged and swallowed; auditing never
    /// blocks assignment.
    pub async fn save(&self, batch: BatchSelectionLog) {
        if !batch.is_enabled() || batch.is_empty() {
            return;
        }

        if let Err(e) = self
            .store
            .insert_selection_logs(batch.account_id(), batch.task_id(), batch.entries())
            .await
        {
            tracing::error!(
                task_id = %batch.task_id(),
                "Failed to save delegate selection logs: {}",
                e
            );
        }
    }

    pub async fn fetch_task_selection_logs(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Vec<SelectionLogRecord>> {
        self.store.list_selection_logs(account_id, task_id).await
    }

    /// Human readable summary used as the error reason of an expired task
    pub async fn expiry_message(&self, account_id: &str, task_id: Uuid) -> String {
        let records = match self.fetch_task_selection_logs(account_id, task_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(%task_id, "Failed to read selection logs: {}", e);
                Vec::new()
            }
        };

        let rejections: Vec<String> = records
            .iter()
            .filter(|r| r.entry.conclusion != SelectionConclusion::Accepted)
            .filter(|r| r.entry.conclusion != SelectionConclusion::Selected)
            .map(|r| format!("{} ({} delegates)", r.entry.message, r.entry.delegate_ids.len()))
            .collect();

        if rejections.is_empty() {
            format!(
                "Task {} expired at {} with no eligible delegate",
                task_id,
                self.clock.now().to_rfc3339()
            )
        } else {
            format!(
                "Task {} expired with no eligible delegate: {}",
                task_id,
                rejections.join("; ")
            )
        }
    }
}
