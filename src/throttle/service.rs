//! Resource constraint throttle
//!
//! A FIFO-fair counting semaphore per (constraint, unit). Every acquire,
//! release and promotion pass for one unit is serialized by an in-process
//! lock and runs inside a single store transaction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::model::{
    ConstraintStrategy, ConstraintUsage, ConsumerRequest, ConsumerState, ResourceConstraint,
    ResourceConstraintInstance, ThrottleEvent,
};
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::store::{ConstraintTx, Store};

type UnitKey = (Uuid, String);

pub struct ResourceConstraintThrottle {
    store: Store,
    clock: Arc<dyn Clock>,
    unit_locks: Mutex<HashMap<UnitKey, Arc<tokio::sync::Mutex<()>>>>,
    event_tx: broadcast::Sender<ThrottleEvent>,
}

impl ResourceConstraintThrottle {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            store,
            clock,
            unit_locks: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to promotion events
    pub fn subscribe(&self) -> broadcast::Receiver<ThrottleEvent> {
        self.event_tx.subscribe()
    }

    fn unit_lock(&self, constraint_id: Uuid, resource_unit: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.unit_locks
            .lock()
            .entry((constraint_id, resource_unit.to_string()))
            .or_default()
            .clone()
    }

    /// Drop the unit's lock once no caller holds it. The next caller for the
    /// unit starts a fresh one.
    fn forget_idle_unit(&self, constraint_id: Uuid, resource_unit: &str) {
        let mut locks = self.unit_locks.lock();
        let key = (constraint_id, resource_unit.to_string());
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }

    fn validate_capacity(capacity: u32) -> Result<()> {
        if capacity < 1 {
            return Err(AppError::InvalidRequest(
                "Resource constraint capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn new_constraint(&self, account_id: &str, name: &str, capacity: u32) -> ResourceConstraint {
        ResourceConstraint {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            capacity,
            strategy: ConstraintStrategy::Fifo,
            created_at: self.clock.now(),
        }
    }

    // Constraints

    /// Get or create. Losing a creation race returns the winner's record.
    pub async fn ensure_constraint(
        &self,
        account_id: &str,
        name: &str,
        capacity: u32,
    ) -> Result<ResourceConstraint> {
        Self::validate_capacity(capacity)?;

        if let Some(existing) = self.store.find_constraint_by_name(account_id, name).await? {
            return Ok(existing);
        }

        let constraint = self.new_constraint(account_id, name, capacity);
        match self.store.insert_constraint(&constraint).await {
            Ok(()) => {
                tracing::info!(constraint_id = %constraint.id, %name, capacity, "Created resource constraint");
                Ok(constraint)
            }
            Err(e) if e.is_duplicate_key() => {
                tracing::warn!(%name, "Resource constraint created concurrently, reusing it");
                self.store
                    .find_constraint_by_name(account_id, name)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Resource constraint {} not found", name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Strict create; a taken name is an error
    pub async fn create_constraint(
        &self,
        account_id: &str,
        name: &str,
        capacity: u32,
    ) -> Result<ResourceConstraint> {
        Self::validate_capacity(capacity)?;

        let constraint = self.new_constraint(account_id, name, capacity);
        match self.store.insert_constraint(&constraint).await {
            Ok(()) => Ok(constraint),
            Err(e) if e.is_duplicate_key() => Err(AppError::InvalidRequest(
                "The resource constraint name cannot be reused.".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, constraint_id: Uuid) -> Result<ResourceConstraint> {
        self.store.get_constraint(constraint_id).await
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<ResourceConstraint>> {
        self.store.list_constraints(account_id).await
    }

    pub async fn delete(&self, constraint_id: Uuid) -> Result<()> {
        if !self.store.delete_constraint(constraint_id).await? {
            return Err(AppError::NotFound(format!(
                "Resource constraint {} not found",
                constraint_id
            )));
        }
        self.unit_locks.lock().retain(|(id, _), _| *id != constraint_id);
        Ok(())
    }

    /// Change a constraint's capacity. Growing it promotes blocked consumers
    /// that now fit; shrinking it never demotes active ones.
    pub async fn update_capacity(
        &self,
        constraint_id: Uuid,
        capacity: u32,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        Self::validate_capacity(capacity)?;
        if !self
            .store
            .update_constraint_capacity(constraint_id, capacity)
            .await?
        {
            return Err(AppError::NotFound(format!(
                "Resource constraint {} not found",
                constraint_id
            )));
        }
        tracing::info!(%constraint_id, capacity, "Resource constraint capacity changed");

        let mut promoted = Vec::new();
        for (_, unit) in self.store.list_blocked_units(Some(constraint_id)).await? {
            promoted.extend(self.promote_blocked(constraint_id, &unit).await?);
        }
        Ok(promoted)
    }

    /// Promotion pass over every unit with blocked consumers. A unit that
    /// fails is logged and skipped.
    pub async fn promote_all_blocked(&self) -> Result<usize> {
        let mut promoted = 0;
        for (constraint_id, unit) in self.store.list_blocked_units(None).await? {
            match self.promote_blocked(constraint_id, &unit).await {
                Ok(instances) => promoted += instances.len(),
                Err(e) => tracing::error!(
                    %constraint_id,
                    resource_unit = %unit,
                    "Failed to promote blocked consumers: {}",
                    e
                ),
            }
        }
        Ok(promoted)
    }

    // Permits

    /// Claim permits. Returns `Blocked` instead of failing when the unit is full
    /// or other consumers are already queued.
    pub async fn acquire(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerState> {
        let constraint = self.store.get_constraint(constraint_id).await?;
        if request.permits < 1 {
            return Err(AppError::InvalidRequest("Permits must be at least 1".to_string()));
        }
        if request.permits > constraint.capacity {
            return Err(AppError::InvalidRequest(format!(
                "Requested {} permits but {} has capacity {}",
                request.permits, constraint.name, constraint.capacity
            )));
        }

        let lock = self.unit_lock(constraint_id, resource_unit);
        let result = {
            let _guard = lock.lock().await;
            self.acquire_locked(&constraint, resource_unit, request).await
        };
        drop(lock);
        self.forget_idle_unit(constraint_id, resource_unit);
        result
    }

    async fn acquire_locked(
        &self,
        constraint: &ResourceConstraint,
        resource_unit: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerState> {
        let constraint_id = constraint.id;
        let mut tx = self.store.begin_constraint_tx().await?;

        if let Some(existing) = tx
            .find_instance(constraint_id, resource_unit, &request.consumer_id)
            .await?
        {
            tracing::warn!(
                %constraint_id,
                resource_unit,
                consumer_id = %request.consumer_id,
                "Consumer already registered, returning existing state"
            );
            return Ok(existing.state);
        }

        let active = tx.active_permits(constraint_id, resource_unit).await?;
        let queued = tx.blocked_count(constraint_id, resource_unit).await?;
        let now = self.clock.now();
        let state = if queued == 0 && active + request.permits <= constraint.capacity {
            ConsumerState::Active
        } else {
            ConsumerState::Blocked
        };

        let instance = ResourceConstraintInstance {
            id: Uuid::new_v4(),
            constraint_id,
            resource_unit: resource_unit.to_string(),
            consumer_id: request.consumer_id,
            release_entity_type: request.release_entity_type,
            release_entity_id: request.release_entity_id,
            permits: request.permits,
            state,
            ordinal: tx.next_ordinal(constraint_id, resource_unit).await?,
            acquired_at: (state == ConsumerState::Active).then_some(now),
            created_at: now,
        };
        tx.insert_instance(&instance).await?;
        tx.commit().await?;

        tracing::debug!(
            %constraint_id,
            resource_unit,
            consumer_id = %instance.consumer_id,
            permits = instance.permits,
            state = state.as_str(),
            "Registered resource consumer"
        );

        Ok(state)
    }

    /// Release a consumer's claim and promote blocked consumers that now fit
    pub async fn release(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
        consumer_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let constraint = self.store.get_constraint(constraint_id).await?;

        let lock = self.unit_lock(constraint_id, resource_unit);
        let result = {
            let _guard = lock.lock().await;
            self.release_locked(&constraint, resource_unit, consumer_id).await
        };
        drop(lock);
        self.forget_idle_unit(constraint_id, resource_unit);

        let promoted = result?;
        tracing::info!(%constraint_id, resource_unit, consumer_id, "Released resource consumer");
        self.publish_unblocked(&promoted);
        Ok(promoted)
    }

    async fn release_locked(
        &self,
        constraint: &ResourceConstraint,
        resource_unit: &str,
        consumer_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let mut tx = self.store.begin_constraint_tx().await?;
        if !tx.delete_instance(constraint.id, resource_unit, consumer_id).await? {
            return Err(AppError::NotFound(format!(
                "Consumer {} holds nothing on {}/{}",
                consumer_id, constraint.name, resource_unit
            )));
        }
        let promoted = self.promote(&mut tx, constraint, resource_unit).await?;
        tx.commit().await?;
        Ok(promoted)
    }

    /// Run a promotion pass without releasing anything
    pub async fn promote_blocked(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let constraint = self.store.get_constraint(constraint_id).await?;

        let lock = self.unit_lock(constraint_id, resource_unit);
        let result = {
            let _guard = lock.lock().await;
            self.promote_locked(&constraint, resource_unit).await
        };
        drop(lock);
        self.forget_idle_unit(constraint_id, resource_unit);

        let promoted = result?;
        self.publish_unblocked(&promoted);
        Ok(promoted)
    }

    async fn promote_locked(
        &self,
        constraint: &ResourceConstraint,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let mut tx = self.store.begin_constraint_tx().await?;
        let promoted = self.promote(&mut tx, constraint, resource_unit).await?;
        tx.commit().await?;
        Ok(promoted)
    }

    /// Strict arrival order: the first blocked consumer that does not fit
    /// stops the pass, even if a later, smaller one would.
    async fn promote(
        &self,
        tx: &mut ConstraintTx,
        constraint: &ResourceConstraint,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let mut active = tx.active_permits(constraint.id, resource_unit).await?;
        let now = self.clock.now();
        let mut promoted = Vec::new();

        for mut instance in tx.blocked_instances(constraint.id, resource_unit).await? {
            if active + instance.permits > constraint.capacity {
                break;
            }
            if !tx.activate_instance(instance.id, now).await? {
                continue;
            }
            active += instance.permits;
            instance.state = ConsumerState::Active;
            instance.acquired_at = Some(now);
            tracing::info!(
                constraint_id = %constraint.id,
                resource_unit,
                consumer_id = %instance.consumer_id,
                "Unblocked resource consumer"
            );
            promoted.push(instance);
        }

        Ok(promoted)
    }

    fn publish_unblocked(&self, promoted: &[ResourceConstraintInstance]) {
        for instance in promoted {
            let _ = self.event_tx.send(ThrottleEvent::ConsumerUnblocked {
                constraint_id: instance.constraint_id,
                resource_unit: instance.resource_unit.clone(),
                consumer_id: instance.consumer_id.clone(),
                release_entity_type: instance.release_entity_type.clone(),
                release_entity_id: instance.release_entity_id.clone(),
            });
        }
    }

    /// Release every claim owned by a finished entity
    pub async fn finish_entity(&self, entity_type: &str, entity_id: &str) -> Result<usize> {
        let instances = self
            .store
            .list_instances_for_entity(entity_type, entity_id)
            .await?;
        let mut released = 0;

        for instance in instances {
            match self
                .release(instance.constraint_id, &instance.resource_unit, &instance.consumer_id)
                .await
            {
                Ok(_) => released += 1,
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(released)
    }

    pub async fn list_instances(
        &self,
        entity_type: &str,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        self.store.list_instances(entity_type, resource_unit).await
    }

    /// Active holders per constraint of an account
    pub async fn usage(&self, account_id: &str) -> Result<Vec<ConstraintUsage>> {
        let mut usage = Vec::new();
        for constraint in self.store.list_constraints(account_id).await? {
            let active = self.store.list_active_instances(constraint.id).await?;
            usage.push(ConstraintUsage { constraint, active });
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::test_support::memory_store;

    async fn throttle() -> ResourceConstraintThrottle {
        ResourceConstraintThrottle::new(memory_store().await, Arc::new(SystemClock))
    }

    fn consumer(id: &str, permits: u32) -> ConsumerRequest {
        ConsumerRequest::new(id, permits).released_by("workflow_execution", format!("wf-{}", id))
    }

    #[tokio::test]
    async fn test_ensure_constraint_is_idempotent() {
        let throttle = throttle().await;
        let first = throttle.ensure_constraint("acct", "deploys", 2).await.unwrap();
        let second = throttle.ensure_constraint("acct", "deploys", 5).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.capacity, 2);
    }

    #[tokio::test]
    async fn test_ensure_rejects_zero_capacity() {
        let throttle = throttle().await;
        let err = throttle.ensure_constraint("acct", "deploys", 0).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_create_constraint_rejects_reuse() {
        let throttle = throttle().await;
        throttle.create_constraint("acct", "deploys", 1).await.unwrap();
        let err = throttle.create_constraint("acct", "deploys", 1).await.unwrap_err();
        match err {
            AppError::InvalidRequest(msg) => {
                assert_eq!(msg, "The resource constraint name cannot be reused.")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fifo_promotion() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        assert_eq!(throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap(), ConsumerState::Active);
        assert_eq!(throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap(), ConsumerState::Blocked);

        let promoted = throttle.release(c.id, "env", "a").await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].consumer_id, "b");

        assert_eq!(throttle.acquire(c.id, "env", consumer("c", 1)).await.unwrap(), ConsumerState::Blocked);
    }

    #[tokio::test]
    async fn test_new_arrival_does_not_overtake_queue() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 3).await.unwrap();

        assert_eq!(throttle.acquire(c.id, "env", consumer("a", 2)).await.unwrap(), ConsumerState::Active);
        assert_eq!(throttle.acquire(c.id, "env", consumer("big", 2)).await.unwrap(), ConsumerState::Blocked);
        // One permit is free, but "big" is queued first
        assert_eq!(throttle.acquire(c.id, "env", consumer("small", 1)).await.unwrap(), ConsumerState::Blocked);
    }

    #[tokio::test]
    async fn test_promotion_stops_at_first_that_does_not_fit() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 3).await.unwrap();

        throttle.acquire(c.id, "env", consumer("a", 2)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("big", 3)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("small", 1)).await.unwrap();

        // Frees 2 of 3; "big" needs 3 and blocks "small"
        let promoted = throttle.release(c.id, "env", "a").await.unwrap();
        assert!(promoted.is_empty());

        let promoted = throttle.release(c.id, "env", "b").await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].consumer_id, "big");

        let promoted = throttle.release(c.id, "env", "big").await.unwrap();
        assert_eq!(promoted[0].consumer_id, "small");
    }

    #[tokio::test]
    async fn test_units_are_independent() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        assert_eq!(throttle.acquire(c.id, "env-1", consumer("a", 1)).await.unwrap(), ConsumerState::Active);
        assert_eq!(throttle.acquire(c.id, "env-2", consumer("b", 1)).await.unwrap(), ConsumerState::Active);
    }

    #[tokio::test]
    async fn test_repeat_acquire_returns_existing_state() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap();
        assert_eq!(throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap(), ConsumerState::Blocked);
        assert_eq!(throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap(), ConsumerState::Active);
        assert_eq!(throttle.list_instances("workflow_execution", "env").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_permits_above_capacity_are_rejected() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 2).await.unwrap();
        let err = throttle.acquire(c.id, "env", consumer("a", 3)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_release_unknown_consumer_is_not_found() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();
        let err = throttle.release(c.id, "env", "ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unblock_event_published() {
        let throttle = throttle().await;
        let mut events = throttle.subscribe();
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap();
        throttle.release(c.id, "env", "a").await.unwrap();

        match events.try_recv().unwrap() {
            ThrottleEvent::ConsumerUnblocked { consumer_id, release_entity_id, .. } => {
                assert_eq!(consumer_id, "b");
                assert_eq!(release_entity_id, "wf-b");
            }
        }
    }

    #[tokio::test]
    async fn test_finish_entity_releases_and_promotes() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap();

        assert_eq!(throttle.finish_entity("workflow_execution", "wf-a").await.unwrap(), 1);
        let instances = throttle.list_instances("workflow_execution", "env").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, ConsumerState::Active);
    }

    #[tokio::test]
    async fn test_unit_locks_are_dropped_when_idle() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        for i in 0..50 {
            let unit = format!("env-{}", i);
            throttle.acquire(c.id, &unit, consumer("a", 1)).await.unwrap();
            throttle.acquire(c.id, &unit, consumer("b", 1)).await.unwrap();
            throttle.release(c.id, &unit, "a").await.unwrap();
            throttle.promote_blocked(c.id, &unit).await.unwrap();
            throttle.release(c.id, &unit, "b").await.unwrap();
        }
        assert!(throttle.release(c.id, "env-0", "ghost").await.is_err());

        assert!(throttle.unit_locks.lock().is_empty());
        assert!(throttle.usage("acct").await.unwrap()[0].active.is_empty());
    }

    #[tokio::test]
    async fn test_update_capacity_promotes_in_order() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("b", 1)).await.unwrap();
        throttle.acquire(c.id, "env", consumer("c", 1)).await.unwrap();
        throttle.acquire(c.id, "other", consumer("d", 1)).await.unwrap();
        throttle.acquire(c.id, "other", consumer("e", 1)).await.unwrap();

        let promoted = throttle.update_capacity(c.id, 2).await.unwrap();
        let ids: Vec<_> = promoted.iter().map(|i| i.consumer_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "e"]);
        assert_eq!(throttle.get(c.id).await.unwrap().capacity, 2);

        // Shrinking keeps current holders active
        assert!(throttle.update_capacity(c.id, 1).await.unwrap().is_empty());
        assert_eq!(throttle.usage("acct").await.unwrap()[0].active.len(), 4);

        assert!(matches!(
            throttle.update_capacity(c.id, 0).await,
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            throttle.update_capacity(Uuid::new_v4(), 3).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_all_blocked_sweeps_every_unit() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 1).await.unwrap();

        throttle.acquire(c.id, "env-1", consumer("a", 1)).await.unwrap();
        throttle.acquire(c.id, "env-1", consumer("b", 1)).await.unwrap();
        throttle.acquire(c.id, "env-2", consumer("c", 1)).await.unwrap();
        throttle.acquire(c.id, "env-2", consumer("d", 1)).await.unwrap();
        assert_eq!(throttle.promote_all_blocked().await.unwrap(), 0);

        // Capacity raised out of band, as another instance would
        throttle.store.update_constraint_capacity(c.id, 2).await.unwrap();
        assert_eq!(throttle.promote_all_blocked().await.unwrap(), 2);
        assert!(throttle.store.list_blocked_units(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_and_delete() {
        let throttle = throttle().await;
        let c = throttle.ensure_constraint("acct", "deploys", 2).await.unwrap();
        throttle.acquire(c.id, "env", consumer("a", 1)).await.unwrap();

        let usage = throttle.usage("acct").await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].active.len(), 1);

        throttle.delete(c.id).await.unwrap();
        assert!(throttle.list("acct").await.unwrap().is_empty());
        assert!(matches!(throttle.delete(c.id).await, Err(AppError::NotFound(_))));
    }
}
