//! Delegate registry
//!
//! Registration, heartbeats and liveness queries over the delegate store.

use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use super::model::{
    validate_scopes, ConnectionHeartbeat, Delegate, DelegateActivity, DelegateConnection,
    DelegateScope, DelegateStatus, NewDelegate,
};
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::selection::audit::BatchSelectionLog;
use crate::store::Store;

pub struct DelegateRegistry {
    store: Store,
    clock: Arc<dyn Clock>,
    max_heartbeat_age: Duration,
}

impl DelegateRegistry {
    pub fn new(store: Store, clock: Arc<dyn Clock>, max_heartbeat_age: Duration) -> Self {
        Self {
            store,
            clock,
            max_heartbeat_age,
        }
    }

    pub fn max_heartbeat_age(&self) -> Duration {
        self.max_heartbeat_age
    }

    /// Register a delegate agent. A live registration from the same host is
    /// refreshed in place and keeps its id and status.
    pub async fn register(&self, account_id: &str, request: NewDelegate) -> Result<Delegate> {
        if request.host_name.trim().is_empty() {
            return Err(AppError::InvalidRequest("Delegate host name is required".to_string()));
        }
        validate_scopes(&request.include_scopes)?;
        validate_scopes(&request.exclude_scopes)?;

        let now = self.clock.now();
        let delegate = match self
            .store
            .find_delegate_by_host(account_id, &request.host_name)
            .await?
        {
            Some(existing) => {
                let refreshed = Delegate {
                    id: existing.id,
                    status: existing.status,
                    created_at: existing.created_at,
                    ..Delegate::new(account_id, request, now)
                };
                tracing::info!(delegate_id = %refreshed.id, host = %refreshed.host_name, "Delegate re-registered");
                refreshed
            }
            None => {
                let delegate = Delegate::new(account_id, request, now);
                tracing::info!(delegate_id = %delegate.id, host = %delegate.host_name, "Delegate registered");
                delegate
            }
        };

        self.store.save_delegate(&delegate).await?;
        Ok(delegate)
    }

    pub async fn get(&self, account_id: &str, delegate_id: Uuid) -> Result<Delegate> {
        self.store.get_delegate(account_id, delegate_id).await
    }

    /// Every non-deleted delegate of an account
    pub async fn list(&self, account_id: &str) -> Result<Vec<Delegate>> {
        self.store.list_delegates(account_id).await
    }

    /// Enabled delegates with a fresh heartbeat. Excluded delegates that are
    /// disconnected or waiting for approval are recorded in `batch`.
    pub async fn list_active_delegates(
        &self,
        account_id: &str,
        batch: &mut BatchSelectionLog,
    ) -> Result<Vec<Delegate>> {
        let now = self.clock.now();
        let mut active = Vec::new();
        let mut disconnected = Vec::new();
        let mut waiting = Vec::new();

        for delegate in self.store.list_delegates(account_id).await? {
            match delegate.activity(now, self.max_heartbeat_age) {
                DelegateActivity::Active => active.push(delegate),
                DelegateActivity::Disconnected => disconnected.push(delegate.id),
                DelegateActivity::WaitingForApproval => waiting.push(delegate.id),
                DelegateActivity::Other => {}
            }
        }

        if !disconnected.is_empty() {
            tracing::debug!(account_id, ?disconnected, "Excluding disconnected delegates");
            batch.log_disconnected_delegates(disconnected, now);
        }
        if !waiting.is_empty() {
            tracing::debug!(account_id, ?waiting, "Excluding delegates waiting for approval");
            batch.log_waiting_for_approval_delegates(waiting, now);
        }

        Ok(active)
    }

    /// Ids of the active delegates of an account
    pub async fn list_active(
        &self,
        account_id: &str,
        batch: &mut BatchSelectionLog,
    ) -> Result<Vec<Uuid>> {
        Ok(self
            .list_active_delegates(account_id, batch)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect())
    }

    /// Unknown delegates are not active
    pub async fn is_active(&self, account_id: &str, delegate_id: Uuid) -> Result<bool> {
        match self.store.get_delegate(account_id, delegate_id).await {
            Ok(delegate) => Ok(delegate.is_active(self.clock.now(), self.max_heartbeat_age)),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Update liveness and upsert the connection record by connection id
    pub async fn register_heartbeat(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        heartbeat: ConnectionHeartbeat,
    ) -> Result<DelegateConnection> {
        let now = self.clock.now();
        if !self
            .store
            .touch_delegate_heartbeat(account_id, delegate_id, now)
            .await?
        {
            return Err(AppError::NotFound(format!("Delegate {} not found", delegate_id)));
        }

        let connection = DelegateConnection {
            id: heartbeat.connection_id,
            account_id: account_id.to_string(),
            delegate_id,
            version: heartbeat.version,
            last_heartbeat: now,
        };
        self.store.upsert_delegate_connection(&connection).await?;

        tracing::debug!(%delegate_id, connection_id = %connection.id, "Delegate heartbeat");
        Ok(connection)
    }

    pub async fn connections(
        &self,
        account_id: &str,
        delegate_id: Uuid,
    ) -> Result<Vec<DelegateConnection>> {
        self.store.list_delegate_connections(account_id, delegate_id).await
    }

    pub async fn remove_connection(&self, account_id: &str, connection_id: Uuid) -> Result<()> {
        if !self
            .store
            .delete_delegate_connection(account_id, connection_id)
            .await?
        {
            return Err(AppError::NotFound(format!(
                "Delegate connection {} not found",
                connection_id
            )));
        }
        Ok(())
    }

    pub async fn update_tags(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        tags: Vec<String>,
    ) -> Result<Delegate> {
        if !self
            .store
            .update_delegate_tags(account_id, delegate_id, &tags)
            .await?
        {
            return Err(AppError::NotFound(format!("Delegate {} not found", delegate_id)));
        }
        self.get(account_id, delegate_id).await
    }

    pub async fn update_scopes(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        include_scopes: Vec<Option<DelegateScope>>,
        exclude_scopes: Vec<Option<DelegateScope>>,
    ) -> Result<Delegate> {
        validate_scopes(&include_scopes)?;
        validate_scopes(&exclude_scopes)?;

        if !self
            .store
            .update_delegate_scopes(account_id, delegate_id, &include_scopes, &exclude_scopes)
            .await?
        {
            return Err(AppError::NotFound(format!("Delegate {} not found", delegate_id)));
        }
        self.get(account_id, delegate_id).await
    }

    /// Approve, disable or re-enable a delegate
    pub async fn set_status(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        status: DelegateStatus,
    ) -> Result<Delegate> {
        if !self
            .store
            .set_delegate_status(account_id, delegate_id, status)
            .await?
        {
            return Err(AppError::NotFound(format!("Delegate {} not found", delegate_id)));
        }
        tracing::info!(%delegate_id, status = status.as_str(), "Delegate status changed");
        self.get(account_id, delegate_id).await
    }

    /// Soft delete
    pub async fn delete(&self, account_id: &str, delegate_id: Uuid) -> Result<()> {
        self.set_status(account_id, delegate_id, DelegateStatus::Deleted)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::selection::audit::groups;
    use crate::store::test_support::memory_store;

    async fn registry() -> (DelegateRegistry, FakeClock) {
        let clock = FakeClock::new();
        let registry = DelegateRegistry::new(
            memory_store().await,
            Arc::new(clock.clone()),
            Duration::seconds(315),
        );
        (registry, clock)
    }

    fn new_delegate(host: &str) -> NewDelegate {
        NewDelegate {
            host_name: host.to_string(),
            delegate_name: "primary".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let (registry, _) = registry().await;
        let delegate = registry.register("acct", new_delegate("host-1")).await.unwrap();
        let fetched = registry.get("acct", delegate.id).await.unwrap();
        assert_eq!(fetched.host_name, "host-1");
        assert_eq!(fetched.status, DelegateStatus::Enabled);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_identity() {
        let (registry, _) = registry().await;
        let first = registry.register("acct", new_delegate("host-1")).await.unwrap();
        registry
            .set_status("acct", first.id, DelegateStatus::Disabled)
            .await
            .unwrap();

        let mut again = new_delegate("host-1");
        again.tags = vec!["k8s".to_string()];
        let second = registry.register("acct", again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, DelegateStatus::Disabled);
        assert_eq!(registry.list("acct").await.unwrap().len(), 1);
        assert_eq!(registry.get("acct", first.id).await.unwrap().tags, vec!["k8s".to_string()]);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_scope() {
        let (registry, _) = registry().await;
        let mut request = new_delegate("host-1");
        request.include_scopes = vec![Some(DelegateScope::new("nothing"))];
        let err = registry.register("acct", request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_list_active_excludes_and_logs_stale_delegates() {
        let (registry, clock) = registry().await;
        let stale = registry.register("acct", new_delegate("stale")).await.unwrap();
        clock.advance(Duration::seconds(315) + Duration::milliseconds(1));
        let fresh = registry.register("acct", new_delegate("fresh")).await.unwrap();

        let mut batch = BatchSelectionLog::new("acct", Uuid::new_v4());
        let active = registry.list_active("acct", &mut batch).await.unwrap();

        assert_eq!(active, vec![fresh.id]);
        let disconnected: Vec<_> = batch
            .entries()
            .iter()
            .filter(|e| e.group_id == groups::DISCONNECTED)
            .collect();
        assert_eq!(disconnected.len(), 1);
        assert_eq!(disconnected[0].delegate_ids.len(), 1);
        assert!(disconnected[0].delegate_ids.contains(&stale.id));
    }

    #[tokio::test]
    async fn test_waiting_for_approval_is_logged() {
        let (registry, _) = registry().await;
        let mut request = new_delegate("pending");
        request.status = Some(DelegateStatus::WaitingForApproval);
        let pending = registry.register("acct", request).await.unwrap();

        let mut batch = BatchSelectionLog::new("acct", Uuid::new_v4());
        assert!(registry.list_active("acct", &mut batch).await.unwrap().is_empty());
        assert_eq!(batch.entries()[0].group_id, groups::WAITING_ON_APPROVAL);
        assert!(batch.entries()[0].delegate_ids.contains(&pending.id));
    }

    #[tokio::test]
    async fn test_heartbeat_revives_delegate() {
        let (registry, clock) = registry().await;
        let delegate = registry.register("acct", new_delegate("host-1")).await.unwrap();
        clock.advance(Duration::minutes(10));
        assert!(!registry.is_active("acct", delegate.id).await.unwrap());

        let connection_id = Uuid::new_v4();
        for _ in 0..3 {
            registry
                .register_heartbeat(
                    "acct",
                    delegate.id,
                    ConnectionHeartbeat {
                        connection_id,
                        version: "1.0".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        assert!(registry.is_active("acct", delegate.id).await.unwrap());
        assert_eq!(registry.connections("acct", delegate.id).await.unwrap().len(), 1);

        registry.remove_connection("acct", connection_id).await.unwrap();
        assert!(registry.connections("acct", delegate.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_delegate() {
        let (registry, _) = registry().await;
        let err = registry
            .register_heartbeat(
                "acct",
                Uuid::new_v4(),
                ConnectionHeartbeat {
                    connection_id: Uuid::new_v4(),
                    version: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!registry.is_active("acct", Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_and_updates() {
        let (registry, _) = registry().await;
        let delegate = registry.register("acct", new_delegate("host-1")).await.unwrap();

        let updated = registry
            .update_tags("acct", delegate.id, vec!["gpu".to_string()])
            .await
            .unwrap();
        assert_eq!(updated.tags, vec!["gpu".to_string()]);

        let err = registry
            .update_scopes("acct", delegate.id, vec![Some(DelegateScope::new("x"))], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(ref m) if m == "Delegate scope cannot be empty"));

        registry.delete("acct", delegate.id).await.unwrap();
        assert_eq!(
            registry.get("acct", delegate.id).await.unwrap().status,
            DelegateStatus::Deleted
        );
        assert!(registry.list("acct").await.unwrap().is_empty());
    }
}
