//! Capability matcher
//!
//! Decides whether a delegate may run a task: include scopes, then exclude
//! scopes, then selectors. Every rejection is recorded in the attempt's
//! selection log.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::audit::BatchSelectionLog;
use crate::clock::Clock;
use crate::delegate::model::Delegate;
use crate::delegate::registry::DelegateRegistry;
use crate::error::{AppError, Result};
use crate::task::model::DelegateTask;

/// Every selector the task requires, trimmed, lowercased and deduplicated.
///
/// Task tags and the selectors of every selector capability are merged;
/// other capability kinds are ignored.
pub fn extract_selectors(task: &DelegateTask) -> BTreeSet<String> {
    task.selector_origins().into_keys().collect()
}

/// Check one delegate against one task
pub fn can_assign_delegate(
    batch: &mut BatchSelectionLog,
    delegate: &Delegate,
    task: &DelegateTask,
    now: DateTime<Utc>,
) -> bool {
    let assignable = scopes_match(batch, delegate, task, now) && selectors_match(batch, delegate, task, now);
    if assignable {
        batch.log_can_assign(delegate.id, now);
    }
    assignable
}

fn scopes_match(
    batch: &mut BatchSelectionLog,
    delegate: &Delegate,
    task: &DelegateTask,
    now: DateTime<Utc>,
) -> bool {
    let context = &task.setup_abstractions;

    let mut includes = delegate.include_scopes().peekable();
    if includes.peek().is_some() && !includes.any(|scope| scope.matches(context)) {
        tracing::debug!(delegate_id = %delegate.id, task_id = %task.id, "No matching include scope");
        batch.log_no_include_scope_matched(delegate.id, now);
        return false;
    }

    if let Some(scope) = delegate.exclude_scopes().find(|scope| scope.matches(context)) {
        tracing::debug!(
            delegate_id = %delegate.id,
            task_id = %task.id,
            scope = %scope.name,
            "Matched exclude scope"
        );
        batch.log_exclude_scope_matched(delegate.id, &scope.name, now);
        return false;
    }

    true
}

fn selectors_match(
    batch: &mut BatchSelectionLog,
    delegate: &Delegate,
    task: &DelegateTask,
    now: DateTime<Utc>,
) -> bool {
    let required = task.selector_origins();
    if required.is_empty() {
        return true;
    }

    let explicit = delegate.explicit_selectors();
    let implicit = delegate.implicit_selectors();
    let missing: Vec<(&String, &String)> = required
        .iter()
        .filter(|(selector, _)| !explicit.contains(*selector) && !implicit.contains(*selector))
        .collect();

    if missing.is_empty() {
        return true;
    }

    if explicit.is_empty() {
        tracing::debug!(delegate_id = %delegate.id, task_id = %task.id, "Delegate has no selectors");
        batch.log_missing_all_selectors(delegate.id, now);
        return false;
    }

    for (selector, origin) in missing {
        tracing::debug!(delegate_id = %delegate.id, task_id = %task.id, %selector, "Missing selector");
        batch.log_missing_selector(delegate.id, selector, origin, now);
    }
    false
}

/// Registry-backed matcher
pub struct CapabilityMatcher {
    registry: Arc<DelegateRegistry>,
    clock: Arc<dyn Clock>,
}

impl CapabilityMatcher {
    pub fn new(registry: Arc<DelegateRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// An unknown delegate is never assignable
    pub async fn can_assign(
        &self,
        batch: &mut BatchSelectionLog,
        delegate_id: Uuid,
        task: &DelegateTask,
    ) -> Result<bool> {
        let delegate = match self.registry.get(&task.account_id, delegate_id).await {
            Ok(delegate) => delegate,
            Err(AppError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.can_assign_delegate(batch, &delegate, task))
    }

    pub fn can_assign_delegate(
        &self,
        batch: &mut BatchSelectionLog,
        delegate: &Delegate,
        task: &DelegateTask,
    ) -> bool {
        can_assign_delegate(batch, delegate, task, self.clock.now())
    }
}
