//! Connection result (whitelist) persistence

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{from_millis, parse_uuid, to_millis, Store};
use crate::error::{AppError, Result};
use crate::task::model::DelegateConnectionResult;

impl Store {
    /// Last write wins for the same (account, delegate, criteria)
    pub async fn upsert_connection_result(&self, result: &DelegateConnectionResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegate_connection_results (account_id, delegate_id, criteria, validated, last_updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, delegate_id, criteria) DO UPDATE SET
                validated = excluded.validated,
                last_updated_at = excluded.last_updated_at
            "#,
        )
        .bind(&result.account_id)
        .bind(result.delegate_id.to_string())
        .bind(&result.criteria)
        .bind(result.validated)
        .bind(to_millis(result.last_updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_connection_result(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        criteria: &str,
    ) -> Result<Option<DelegateConnectionResult>> {
        let row = sqlx::query_as::<_, ConnectionResultRow>(
            r#"
            SELECT account_id, delegate_id, criteria, validated, last_updated_at
            FROM delegate_connection_results
            WHERE account_id = ? AND delegate_id = ? AND criteria = ?
            "#,
        )
        .bind(account_id)
        .bind(delegate_id.to_string())
        .bind(criteria)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DelegateConnectionResult::try_from).transpose()
    }

    /// Every delegate's result for one criteria string
    pub async fn list_connection_results(
        &self,
        account_id: &str,
        criteria: &str,
    ) -> Result<Vec<DelegateConnectionResult>> {
        let rows = sqlx::query_as::<_, ConnectionResultRow>(
            r#"
            SELECT account_id, delegate_id, criteria, validated, last_updated_at
            FROM delegate_connection_results
            WHERE account_id = ? AND criteria = ?
            "#,
        )
        .bind(account_id)
        .bind(criteria)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Bump the timestamp of a validated entry last updated before `older_than`
    pub async fn touch_connection_result(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        criteria: &str,
        older_than: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_connection_results SET last_updated_at = ?
            WHERE account_id = ? AND delegate_id = ? AND criteria = ?
              AND validated = 1 AND last_updated_at < ?
            "#,
        )
        .bind(to_millis(at))
        .bind(account_id)
        .bind(delegate_id.to_string())
        .bind(criteria)
        .bind(to_millis(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_connection_results_for_delegate(
        &self,
        account_id: &str,
        delegate_id: Uuid,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM delegate_connection_results WHERE account_id = ? AND delegate_id = ?",
        )
        .bind(account_id)
        .bind(delegate_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_connection_results_for_account(&self, account_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delegate_connection_results WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionResultRow {
    account_id: String,
    delegate_id: String,
    criteria: String,
    validated: bool,
    last_updated_at: i64,
}

impl TryFrom<ConnectionResultRow> for DelegateConnectionResult {
    type Error = AppError;

    fn try_from(row: ConnectionResultRow) -> Result<Self> {
        Ok(DelegateConnectionResult {
            account_id: row.account_id,
            delegate_id: parse_uuid(&row.delegate_id)?,
            criteria: row.criteria,
            validated: row.validated,
            last_updated_at: from_millis(row.last_updated_at)?,
        })
    }
}
