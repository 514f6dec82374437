//! Delegate task persistence
//!
//! Assignment, completion and requeue are compare-and-swap updates; callers
//! learn whether they won the transition from the returned flag.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{from_json, from_millis, parse_uuid, to_json, to_millis, Store};
use crate::error::{AppError, Result};
use crate::task::model::{DelegateTask, DelegateTaskResponse, TaskStatus};

const TASK_COLUMNS: &str = "id, account_id, setup_abstractions, tags, capabilities, data, \
     status, broadcast_count, last_broadcast_at, delegate_id, pre_assigned_delegate_id, \
     validating_delegate_ids, validation_complete_delegate_ids, validation_started_at, \
     already_tried_delegates, response, error_reason, created_at, expires_at";

impl Store {
    pub async fn insert_task(&self, task: &DelegateTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegate_tasks (id, account_id, setup_abstractions, tags, capabilities, data,
                is_async, status, broadcast_count, last_broadcast_at, delegate_id,
                pre_assigned_delegate_id, validating_delegate_ids, validation_complete_delegate_ids,
                validation_started_at, already_tried_delegates, response, error_reason,
                created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.account_id)
        .bind(to_json(&task.setup_abstractions)?)
        .bind(to_json(&task.tags)?)
        .bind(to_json(&task.capabilities)?)
        .bind(to_json(&task.data)?)
        .bind(task.data.is_async)
        .bind(task.status.as_str())
        .bind(task.broadcast_count as i64)
        .bind(task.last_broadcast_at.map(to_millis))
        .bind(task.delegate_id.map(|id| id.to_string()))
        .bind(task.pre_assigned_delegate_id.map(|id| id.to_string()))
        .bind(to_json(&task.validating_delegate_ids)?)
        .bind(to_json(&task.validation_complete_delegate_ids)?)
        .bind(task.validation_started_at.map(to_millis))
        .bind(to_json(&task.already_tried_delegates)?)
        .bind(task.response.as_ref().map(to_json).transpose()?)
        .bind(&task.error_reason)
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_task(&self, account_id: &str, id: Uuid) -> Result<DelegateTask> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE account_id = ? AND id = ?",
            TASK_COLUMNS
        ))
        .bind(account_id)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", id)))?;

        row.try_into()
    }

    /// Look a task up by id alone
    pub async fn find_task(&self, id: Uuid) -> Result<Option<DelegateTask>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(DelegateTask::try_from)
        .transpose()
    }

    /// Queued tasks of an account, oldest first
    pub async fn list_queued_tasks(&self, account_id: &str) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE account_id = ? AND status = 'queued' \
             ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Acquired tasks across all accounts
    pub async fn list_acquired_tasks(&self) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE status = 'acquired' ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Queued, unexpired, broadcastable tasks whose last round is older than `interval`
    pub async fn list_tasks_due_for_broadcast(
        &self,
        now: DateTime<Utc>,
        interval: Duration,
        max_rounds: u32,
    ) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks \
             WHERE status = 'queued' AND pre_assigned_delegate_id IS NULL \
               AND broadcast_count < ? AND expires_at > ? \
               AND (last_broadcast_at IS NULL OR last_broadcast_at <= ?) \
             ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(max_rounds as i64)
        .bind(to_millis(now))
        .bind(to_millis(now - interval))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Unfinished tasks whose deadline has passed, as (account, task id)
    pub async fn list_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<(String, Uuid)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT account_id, id FROM delegate_tasks
            WHERE status IN ('queued', 'acquired') AND expires_at <= ?
            ORDER BY expires_at ASC
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(account_id, id)| Ok((account_id, parse_uuid(&id)?)))
            .collect()
    }

    pub async fn record_task_broadcast(
        &self,
        account_id: &str,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET broadcast_count = broadcast_count + 1, last_broadcast_at = ?
            WHERE account_id = ? AND id = ? AND status = 'queued'
            "#,
        )
        .bind(to_millis(at))
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Hand a queued, unassigned task to a delegate; false when someone else won
    pub async fn assign_task(&self, account_id: &str, id: Uuid, delegate_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET delegate_id = ?, status = 'acquired'
            WHERE account_id = ? AND id = ? AND status = 'queued' AND delegate_id IS NULL
              AND (pre_assigned_delegate_id IS NULL OR pre_assigned_delegate_id = ?)
            "#,
        )
        .bind(delegate_id.to_string())
        .bind(account_id)
        .bind(id.to_string())
        .bind(delegate_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that a delegate started validating connectivity for a queued task
    pub async fn start_task_validation(
        &self,
        account_id: &str,
        id: Uuid,
        delegate_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET validating_delegate_ids = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(validating_delegate_ids) WHERE value = ?1)
                    THEN validating_delegate_ids
                    ELSE json_insert(validating_delegate_ids, '$[#]', ?1)
                END,
                validation_started_at = COALESCE(validation_started_at, ?2)
            WHERE account_id = ?3 AND id = ?4 AND status = 'queued'
            "#,
        )
        .bind(delegate_id.to_string())
        .bind(to_millis(at))
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn complete_task_validation(
        &self,
        account_id: &str,
        id: Uuid,
        delegate_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET validation_complete_delegate_ids = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(validation_complete_delegate_ids) WHERE value = ?1)
                    THEN validation_complete_delegate_ids
                    ELSE json_insert(validation_complete_delegate_ids, '$[#]', ?1)
                END
            WHERE account_id = ?2 AND id = ?3
            "#,
        )
        .bind(delegate_id.to_string())
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move an unfinished task to a terminal status; false if it already finished
    pub async fn finish_task(
        &self,
        account_id: &str,
        id: Uuid,
        status: TaskStatus,
        response: Option<&DelegateTaskResponse>,
        error_reason: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(AppError::Internal(format!(
                "Cannot finish task with non-terminal status {}",
                status.as_str()
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = ?, response = ?, error_reason = ?
            WHERE account_id = ? AND id = ? AND status IN ('queued', 'acquired')
            "#,
        )
        .bind(status.as_str())
        .bind(response.map(to_json).transpose()?)
        .bind(error_reason)
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Take a task back from its assignee and queue it for another round
    pub async fn requeue_task(&self, account_id: &str, id: Uuid, from_delegate: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = 'queued',
                delegate_id = NULL,
                broadcast_count = 0,
                last_broadcast_at = NULL,
                validating_delegate_ids = '[]',
                validation_complete_delegate_ids = '[]',
                validation_started_at = NULL,
                already_tried_delegates = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(already_tried_delegates) WHERE value = ?1)
                    THEN already_tried_delegates
                    ELSE json_insert(already_tried_delegates, '$[#]', ?1)
                END
            WHERE account_id = ?2 AND id = ?3 AND status = 'acquired' AND delegate_id = ?1
            "#,
        )
        .bind(from_delegate.to_string())
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    account_id: String,
    setup_abstractions: String,
    tags: String,
    capabilities: String,
    data: String,
    status: String,
    broadcast_count: i64,
    last_broadcast_at: Option<i64>,
    delegate_id: Option<String>,
    pre_assigned_delegate_id: Option<String>,
    validating_delegate_ids: String,
    validation_complete_delegate_ids: String,
    validation_started_at: Option<i64>,
    already_tried_delegates: String,
    response: Option<String>,
    error_reason: Option<String>,
    created_at: i64,
    expires_at: i64,
}

fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

impl TryFrom<TaskRow> for DelegateTask {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(DelegateTask {
            id: parse_uuid(&row.id)?,
            account_id: row.account_id,
            setup_abstractions: from_json(&row.setup_abstractions)?,
            tags: from_json(&row.tags)?,
            capabilities: from_json(&row.capabilities)?,
            data: from_json(&row.data)?,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            broadcast_count: u32::try_from(row.broadcast_count)
                .map_err(|e| AppError::Internal(format!("Invalid broadcast count: {}", e)))?,
            last_broadcast_at: row.last_broadcast_at.map(from_millis).transpose()?,
            delegate_id: parse_optional_uuid(row.delegate_id)?,
            pre_assigned_delegate_id: parse_optional_uuid(row.pre_assigned_delegate_id)?,
            validating_delegate_ids: from_json(&row.validating_delegate_ids)?,
            validation_complete_delegate_ids: from_json(&row.validation_complete_delegate_ids)?,
            validation_started_at: row.validation_started_at.map(from_millis).transpose()?,
            already_tried_delegates: from_json(&row.already_tried_delegates)?,
            response: row.response.as_deref().map(from_json).transpose()?,
            error_reason: row.error_reason,
            created_at: from_millis(row.created_at)?,
            expires_at: from_millis(row.expires_at)?,
        })
    }
}
