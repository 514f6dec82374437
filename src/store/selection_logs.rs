//! Selection audit log persistence

use uuid::Uuid;

use super::{from_json, from_millis, parse_uuid, to_json, to_millis, Store};
use crate::error::{AppError, Result};
use crate::selection::audit::{SelectionLogEntry, SelectionLogRecord};

impl Store {
    /// Write every entry of one batch in a single transaction
    pub async fn insert_selection_logs(
        &self,
        account_id: &str,
        task_id: Uuid,
        entries: &[SelectionLogEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO delegate_selection_logs (id, account_id, task_id, delegate_ids, group_id,
                    conclusion, message, event_timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(account_id)
            .bind(task_id.to_string())
            .bind(to_json(&entry.delegate_ids)?)
            .bind(&entry.group_id)
            .bind(entry.conclusion.as_str())
            .bind(&entry.message)
            .bind(to_millis(entry.event_timestamp))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Entries for a task in the order they were recorded
    pub async fn list_selection_logs(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Vec<SelectionLogRecord>> {
        let rows = sqlx::query_as::<_, SelectionLogRow>(
            r#"
            SELECT id, account_id, task_id, delegate_ids, group_id, conclusion, message, event_timestamp
            FROM delegate_selection_logs
            WHERE account_id = ? AND task_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(account_id)
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct SelectionLogRow {
    id: String,
    account_id: String,
    task_id: String,
    delegate_ids: String,
    group_id: String,
    conclusion: String,
    message: String,
    event_timestamp: i64,
}

impl TryFrom<SelectionLogRow> for SelectionLogRecord {
    type Error = AppError;

    fn try_from(row: SelectionLogRow) -> Result<Self> {
        Ok(SelectionLogRecord {
            id: parse_uuid(&row.id)?,
            account_id: row.account_id,
            task_id: parse_uuid(&row.task_id)?,
            entry: SelectionLogEntry {
                delegate_ids: from_json(&row.delegate_ids)?,
                group_id: row.group_id,
                conclusion: row
                    .conclusion
                    .parse()
                    .map_err(|e| AppError::Internal(format!("Invalid conclusion: {}", e)))?,
                message: row.message,
                event_timestamp: from_millis(row.event_timestamp)?,
            },
        })
    }
}
