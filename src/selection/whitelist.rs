//! Connection whitelist
//!
//! Remembers which delegates proved they can reach a task's resources, keyed
//! by (account, delegate, criteria). A validated entry counts for
//! `whitelist_ttl`; a failed one blacklists the delegate for `blacklist_ttl`.

use std::sync::Arc;
use uuid::Uuid;

use super::audit::BatchSelectionLog;
use super::matcher::CapabilityMatcher;
use crate::clock::Clock;
use crate::config::DispatchSettings;
use crate::delegate::registry::DelegateRegistry;
use crate::error::Result;
use crate::store::Store;
use crate::task::model::{ConnectionCheck, DelegateConnectionResult, DelegateTask};

pub struct ConnectionWhitelist {
    store: Store,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    registry: Arc<DelegateRegistry>,
    matcher: Arc<CapabilityMatcher>,
}

impl ConnectionWhitelist {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
        registry: Arc<DelegateRegistry>,
        matcher: Arc<CapabilityMatcher>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            registry,
            matcher,
        }
    }

    /// Every criteria of the task has a fresh, validated entry for the delegate.
    /// A task without criteria needs no validation and is always whitelisted.
    pub async fn is_whitelisted(&self, task: &DelegateTask, delegate_id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        for criteria in task.criteria() {
            let fresh = self
                .store
                .get_connection_result(&task.account_id, delegate_id, &criteria)
                .await?
                .map(|r| r.validated && now - r.last_updated_at <= self.settings.whitelist_ttl)
                .unwrap_or(false);
            if !fresh {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether the delegate should run a live connectivity check for the task.
    ///
    /// Only a delegate freshly blacklisted for every criteria is skipped, and
    /// only while some other connected delegate is whitelisted.
    pub async fn should_validate(&self, task: &DelegateTask, delegate_id: Uuid) -> Result<bool> {
        if self.settings.revalidate_whitelisted {
            return Ok(true);
        }

        let now = self.clock.now();
        for criteria in task.criteria() {
            let blacklisted = self
                .store
                .get_connection_result(&task.account_id, delegate_id, &criteria)
                .await?
                .map(|r| !r.validated && now - r.last_updated_at <= self.settings.blacklist_ttl)
                .unwrap_or(false);
            if !blacklisted {
                return Ok(true);
            }
        }

        Ok(self.connected_whitelisted_delegates(task).await?.is_empty())
    }

    /// Active, assignable delegates that are whitelisted for the task
    pub async fn connected_whitelisted_delegates(&self, task: &DelegateTask) -> Result<Vec<Uuid>> {
        let mut scratch = BatchSelectionLog::disabled(&task.account_id, task.id);
        let mut whitelisted = Vec::new();

        for delegate in self
            .registry
            .list_active_delegates(&task.account_id, &mut scratch)
            .await?
        {
            if !self.matcher.can_assign_delegate(&mut scratch, &delegate, task) {
                continue;
            }
            if self.is_whitelisted(task, delegate.id).await? {
                whitelisted.push(delegate.id);
            }
        }

        Ok(whitelisted)
    }

    /// Upsert each result; the newest result for a key replaces the old one
    pub async fn save_connection_results(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        results: &[ConnectionCheck],
    ) -> Result<()> {
        let now = self.clock.now();
        for check in results {
            let criteria = check.criteria.trim();
            if criteria.is_empty() {
                continue;
            }
            self.store
                .upsert_connection_result(&DelegateConnectionResult {
                    account_id: account_id.to_string(),
                    delegate_id,
                    criteria: criteria.to_string(),
                    validated: check.validated,
                    last_updated_at: now,
                })
                .await?;
            tracing::debug!(%delegate_id, criteria, validated = check.validated, "Saved connection result");
        }
        Ok(())
    }

    /// Extend entries that proved themselves again, once they are older
    /// than `whitelist_refresh`
    pub async fn refresh(&self, task: &DelegateTask, delegate_id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let older_than = now - self.settings.whitelist_refresh;
        for criteria in task.criteria() {
            if self
                .store
                .touch_connection_result(&task.account_id, delegate_id, &criteria, older_than, now)
                .await?
            {
                tracing::debug!(%delegate_id, %criteria, "Refreshed whitelist entry");
            }
        }
        Ok(())
    }

    pub async fn clear_for_delegate(&self, account_id: &str, delegate_id: Uuid) -> Result<u64> {
        self.store
            .delete_connection_results_for_delegate(account_id, delegate_id)
            .await
    }

    pub async fn clear_for_account(&self, account_id: &str) -> Result<u64> {
        self.store.delete_connection_results_for_account(account_id).await
    }
}
