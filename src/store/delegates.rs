//! Delegate and delegate connection persistence

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{from_json, from_millis, parse_uuid, to_json, to_millis, Store};
use crate::delegate::model::{Delegate, DelegateConnection, DelegateScope, DelegateStatus};
use crate::error::{AppError, Result};

const DELEGATE_COLUMNS: &str = "id, account_id, host_name, delegate_name, status, last_heartbeat, \
     tags, declared_selectors, include_scopes, exclude_scopes, profile_id, version, created_at";

impl Store {
    /// Insert a delegate, or overwrite every field of an existing one
    pub async fn save_delegate(&self, delegate: &Delegate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegates (id, account_id, host_name, delegate_name, status, last_heartbeat,
                tags, declared_selectors, include_scopes, exclude_scopes, profile_id, version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                host_name = excluded.host_name,
                delegate_name = excluded.delegate_name,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                tags = excluded.tags,
                declared_selectors = excluded.declared_selectors,
                include_scopes = excluded.include_scopes,
                exclude_scopes = excluded.exclude_scopes,
                profile_id = excluded.profile_id,
                version = excluded.version
            "#,
        )
        .bind(delegate.id.to_string())
        .bind(&delegate.account_id)
        .bind(&delegate.host_name)
        .bind(&delegate.delegate_name)
        .bind(delegate.status.as_str())
        .bind(to_millis(delegate.last_heartbeat))
        .bind(to_json(&delegate.tags)?)
        .bind(to_json(&delegate.declared_selectors)?)
        .bind(to_json(&delegate.include_scopes)?)
        .bind(to_json(&delegate.exclude_scopes)?)
        .bind(&delegate.profile_id)
        .bind(&delegate.version)
        .bind(to_millis(delegate.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_delegate(&self, account_id: &str, id: Uuid) -> Result<Delegate> {
        let row = sqlx::query_as::<_, DelegateRow>(&format!(
            "SELECT {} FROM delegates WHERE account_id = ? AND id = ?",
            DELEGATE_COLUMNS
        ))
        .bind(account_id)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Delegate {} not found", id)))?;

        row.try_into()
    }

    /// Non-deleted delegate registered from the given host
    pub async fn find_delegate_by_host(
        &self,
        account_id: &str,
        host_name: &str,
    ) -> Result<Option<Delegate>> {
        let row = sqlx::query_as::<_, DelegateRow>(&format!(
            "SELECT {} FROM delegates WHERE account_id = ? AND host_name = ? AND status != 'deleted' \
             ORDER BY created_at ASC LIMIT 1",
            DELEGATE_COLUMNS
        ))
        .bind(account_id)
        .bind(host_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Delegate::try_from).transpose()
    }

    /// All non-deleted delegates of an account, oldest first
    pub async fn list_delegates(&self, account_id: &str) -> Result<Vec<Delegate>> {
        let rows = sqlx::query_as::<_, DelegateRow>(&format!(
            "SELECT {} FROM delegates WHERE account_id = ? AND status != 'deleted' \
             ORDER BY created_at ASC",
            DELEGATE_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Returns false when the delegate does not exist
    pub async fn touch_delegate_heartbeat(
        &self,
        account_id: &str,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegates SET last_heartbeat = MAX(last_heartbeat, ?)
            WHERE account_id = ? AND id = ?
            "#,
        )
        .bind(to_millis(at))
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_delegate_tags(
        &self,
        account_id: &str,
        id: Uuid,
        tags: &[String],
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE delegates SET tags = ? WHERE account_id = ? AND id = ?")
            .bind(to_json(tags)?)
            .bind(account_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_delegate_scopes(
        &self,
        account_id: &str,
        id: Uuid,
        include_scopes: &[Option<DelegateScope>],
        exclude_scopes: &[Option<DelegateScope>],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegates SET include_scopes = ?, exclude_scopes = ?
            WHERE account_id = ? AND id = ?
            "#,
        )
        .bind(to_json(include_scopes)?)
        .bind(to_json(exclude_scopes)?)
        .bind(account_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_delegate_status(
        &self,
        account_id: &str,
        id: Uuid,
        status: DelegateStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE delegates SET status = ? WHERE account_id = ? AND id = ?")
            .bind(status.as_str())
            .bind(account_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // Connection records

    /// Insert or update in place by connection id
    pub async fn upsert_delegate_connection(&self, connection: &DelegateConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegate_connections (id, account_id, delegate_id, version, last_heartbeat)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(connection.id.to_string())
        .bind(&connection.account_id)
        .bind(connection.delegate_id.to_string())
        .bind(&connection.version)
        .bind(to_millis(connection.last_heartbeat))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_delegate_connections(
        &self,
        account_id: &str,
        delegate_id: Uuid,
    ) -> Result<Vec<DelegateConnection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT id, account_id, delegate_id, version, last_heartbeat
            FROM delegate_connections
            WHERE account_id = ? AND delegate_id = ?
            ORDER BY last_heartbeat DESC
            "#,
        )
        .bind(account_id)
        .bind(delegate_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn delete_delegate_connection(
        &self,
        account_id: &str,
        connection_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM delegate_connections WHERE account_id = ? AND id = ?")
            .bind(account_id)
            .bind(connection_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct DelegateRow {
    id: String,
    account_id: String,
    host_name: String,
    delegate_name: String,
    status: String,
    last_heartbeat: i64,
    tags: String,
    declared_selectors: String,
    include_scopes: String,
    exclude_scopes: String,
    profile_id: Option<String>,
    version: String,
    created_at: i64,
}

impl TryFrom<DelegateRow> for Delegate {
    type Error = AppError;

    fn try_from(row: DelegateRow) -> Result<Self> {
        Ok(Delegate {
            id: parse_uuid(&row.id)?,
            account_id: row.account_id,
            host_name: row.host_name,
            delegate_name: row.delegate_name,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            last_heartbeat: from_millis(row.last_heartbeat)?,
            tags: from_json(&row.tags)?,
            declared_selectors: from_json(&row.declared_selectors)?,
            include_scopes: from_json(&row.include_scopes)?,
            exclude_scopes: from_json(&row.exclude_scopes)?,
            profile_id: row.profile_id,
            version: row.version,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: String,
    account_id: String,
    delegate_id: String,
    version: String,
    last_heartbeat: i64,
}

impl TryFrom<ConnectionRow> for DelegateConnection {
    type Error = AppError;

    fn try_from(row: ConnectionRow) -> Result<Self> {
        Ok(DelegateConnection {
            id: parse_uuid(&row.id)?,
            account_id: row.account_id,
            delegate_id: parse_uuid(&row.delegate_id)?,
            version: row.version,
            last_heartbeat: from_millis(row.last_heartbeat)?,
        })
    }
}
