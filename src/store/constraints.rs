//! Resource constraint persistence
//!
//! Reads and writes that make up one acquire, release or promotion pass go
//! through a [`ConstraintTx`] so they commit together.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use super::{from_millis, parse_uuid, to_millis, Store};
use crate::error::{AppError, Result};
use crate::throttle::model::{ConsumerState, ResourceConstraint, ResourceConstraintInstance};

const INSTANCE_COLUMNS: &str = "id, constraint_id, resource_unit, consumer_id, release_entity_type, \
     release_entity_id, permits, state, ordinal, acquired_at, created_at";

impl Store {
    /// Insert a constraint; a taken (account, name) surfaces as a duplicate-key error
    pub async fn insert_constraint(&self, constraint: &ResourceConstraint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_constraints (id, account_id, name, capacity, strategy, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(constraint.id.to_string())
        .bind(&constraint.account_id)
        .bind(&constraint.name)
        .bind(constraint.capacity as i64)
        .bind(constraint.strategy.as_str())
        .bind(to_millis(constraint.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_constraint(&self, id: Uuid) -> Result<ResourceConstraint> {
        let row = sqlx::query_as::<_, ConstraintRow>(
            r#"
            SELECT id, account_id, name, capacity, strategy, created_at
            FROM resource_constraints WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resource constraint {} not found", id)))?;

        row.try_into()
    }

    pub async fn find_constraint_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<ResourceConstraint>> {
        let row = sqlx::query_as::<_, ConstraintRow>(
            r#"
            SELECT id, account_id, name, capacity, strategy, created_at
            FROM resource_constraints WHERE account_id = ? AND name = ?
            "#,
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ResourceConstraint::try_from).transpose()
    }

    pub async fn list_constraints(&self, account_id: &str) -> Result<Vec<ResourceConstraint>> {
        let rows = sqlx::query_as::<_, ConstraintRow>(
            r#"
            SELECT id, account_id, name, capacity, strategy, created_at
            FROM resource_constraints WHERE account_id = ?
            ORDER BY name ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Delete a constraint together with all of its instances
    pub async fn delete_constraint(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM resource_constraint_instances WHERE constraint_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM resource_constraints WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_constraint_capacity(&self, id: Uuid, capacity: u32) -> Result<bool> {
        let result = sqlx::query("UPDATE resource_constraints SET capacity = ? WHERE id = ?")
            .bind(capacity as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// (constraint, unit) pairs that have at least one blocked instance,
    /// optionally restricted to one constraint
    pub async fn list_blocked_units(&self, constraint_id: Option<Uuid>) -> Result<Vec<(Uuid, String)>> {
        let constraint_id = constraint_id.map(|id| id.to_string());
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT constraint_id, resource_unit FROM resource_constraint_instances
            WHERE state = 'blocked' AND (? IS NULL OR constraint_id = ?)
            ORDER BY constraint_id ASC, resource_unit ASC
            "#,
        )
        .bind(constraint_id.clone())
        .bind(constraint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, unit)| Ok((parse_uuid(&id)?, unit)))
            .collect()
    }

    /// Instances released by a given entity type within one unit, in arrival order
    pub async fn list_instances(
        &self,
        release_entity_type: &str,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM resource_constraint_instances \
             WHERE release_entity_type = ? AND resource_unit = ? \
             ORDER BY constraint_id ASC, ordinal ASC",
            INSTANCE_COLUMNS
        ))
        .bind(release_entity_type)
        .bind(resource_unit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Instances owned by one entity
    pub async fn list_instances_for_entity(
        &self,
        release_entity_type: &str,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM resource_constraint_instances \
             WHERE release_entity_type = ? AND release_entity_id = ? \
             ORDER BY ordinal ASC",
            INSTANCE_COLUMNS
        ))
        .bind(release_entity_type)
        .bind(release_entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Active instances of a constraint ordered by unit and arrival
    pub async fn list_active_instances(
        &self,
        constraint_id: Uuid,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM resource_constraint_instances \
             WHERE constraint_id = ? AND state = 'active' \
             ORDER BY resource_unit ASC, ordinal ASC",
            INSTANCE_COLUMNS
        ))
        .bind(constraint_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn begin_constraint_tx(&self) -> Result<ConstraintTx> {
        Ok(ConstraintTx {
            tx: self.pool.begin().await?,
        })
    }
}

/// One atomic pass over the instances of a (constraint, unit) pair
pub struct ConstraintTx {
    tx: Transaction<'static, Sqlite>,
}

impl ConstraintTx {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn find_instance(
        &mut self,
        constraint_id: Uuid,
        resource_unit: &str,
        consumer_id: &str,
    ) -> Result<Option<ResourceConstraintInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM resource_constraint_instances \
             WHERE constraint_id = ? AND resource_unit = ? AND consumer_id = ?",
            INSTANCE_COLUMNS
        ))
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .bind(consumer_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(ResourceConstraintInstance::try_from).transpose()
    }

    /// Sum of permits held by active instances
    pub async fn active_permits(&mut self, constraint_id: Uuid, resource_unit: &str) -> Result<u32> {
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(permits), 0) FROM resource_constraint_instances
            WHERE constraint_id = ? AND resource_unit = ? AND state = 'active'
            "#,
        )
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .fetch_one(&mut *self.tx)
        .await?;

        u32::try_from(sum).map_err(|e| AppError::Internal(format!("Invalid permit sum: {}", e)))
    }

    pub async fn blocked_count(&mut self, constraint_id: Uuid, resource_unit: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM resource_constraint_instances
            WHERE constraint_id = ? AND resource_unit = ? AND state = 'blocked'
            "#,
        )
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count)
    }

    pub async fn next_ordinal(&mut self, constraint_id: Uuid, resource_unit: &str) -> Result<i64> {
        let (max,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(ordinal), 0) FROM resource_constraint_instances
            WHERE constraint_id = ? AND resource_unit = ?
            "#,
        )
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(max + 1)
    }

    pub async fn insert_instance(&mut self, instance: &ResourceConstraintInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_constraint_instances (id, constraint_id, resource_unit, consumer_id,
                release_entity_type, release_entity_id, permits, state, ordinal, acquired_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.constraint_id.to_string())
        .bind(&instance.resource_unit)
        .bind(&instance.consumer_id)
        .bind(&instance.release_entity_type)
        .bind(&instance.release_entity_id)
        .bind(instance.permits as i64)
        .bind(instance.state.as_str())
        .bind(instance.ordinal)
        .bind(instance.acquired_at.map(to_millis))
        .bind(to_millis(instance.created_at))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    pub async fn delete_instance(
        &mut self,
        constraint_id: Uuid,
        resource_unit: &str,
        consumer_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_constraint_instances
            WHERE constraint_id = ? AND resource_unit = ? AND consumer_id = ?
            "#,
        )
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .bind(consumer_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Blocked instances in arrival order
    pub async fn blocked_instances(
        &mut self,
        constraint_id: Uuid,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM resource_constraint_instances \
             WHERE constraint_id = ? AND resource_unit = ? AND state = 'blocked' \
             ORDER BY ordinal ASC",
            INSTANCE_COLUMNS
        ))
        .bind(constraint_id.to_string())
        .bind(resource_unit)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Blocked to active; false if the instance is gone or already active
    pub async fn activate_instance(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_constraint_instances SET state = 'active', acquired_at = ?
            WHERE id = ? AND state = 'blocked'
            "#,
        )
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct ConstraintRow {
    id: String,
    account_id: String,
    name: String,
    capacity: i64,
    strategy: String,
    created_at: i64,
}

impl TryFrom<ConstraintRow> for ResourceConstraint {
    type Error = AppError;

    fn try_from(row: ConstraintRow) -> Result<Self> {
        Ok(ResourceConstraint {
            id: parse_uuid(&row.id)?,
            account_id: row.account_id,
            name: row.name,
            capacity: u32::try_from(row.capacity)
                .map_err(|e| AppError::Internal(format!("Invalid capacity: {}", e)))?,
            strategy: row
                .strategy
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid strategy: {}", e)))?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    constraint_id: String,
    resource_unit: String,
    consumer_id: String,
    release_entity_type: String,
    release_entity_id: String,
    permits: i64,
    state: String,
    ordinal: i64,
    acquired_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<InstanceRow> for ResourceConstraintInstance {
    type Error = AppError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let state: ConsumerState = row
            .state
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid state: {}", e)))?;

        Ok(ResourceConstraintInstance {
            id: parse_uuid(&row.id)?,
            constraint_id: parse_uuid(&row.constraint_id)?,
            resource_unit: row.resource_unit,
            consumer_id: row.consumer_id,
            release_entity_type: row.release_entity_type,
            release_entity_id: row.release_entity_id,
            permits: u32::try_from(row.permits)
                .map_err(|e| AppError::Internal(format!("Invalid permits: {}", e)))?,
            state,
            ordinal: row.ordinal,
            acquired_at: row.acquired_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
        })
    }
}
