//! SQLite Offline Request Store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::DbPool;
use crate::application::ports::{OfflineRequest, OfflineStoreError, OfflineStorePort, RequestKind};

fn db_err(e: sqlx::Error) -> OfflineStoreError {
    OfflineStoreError::DatabaseError(e.to_string())
}

/// SQLite 离线请求存储
pub struct SqliteOfflineStore {
    pool: DbPool,
}

impl SqliteOfflineStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct OfflineRow {
    id: String,
    kind: String,
    request: String,
    enqueued_at: String,
    callback_id: String,
}

impl TryFrom<OfflineRow> for OfflineRequest {
    type Error = OfflineStoreError;

    fn try_from(row: OfflineRow) -> Result<Self, Self::Error> {
        Ok(OfflineRequest {
            id: row.id,
            kind: RequestKind::from_str(&row.kind).unwrap_or(RequestKind::Other),
            request: serde_json::from_str(&row.request)
                .map_err(|e| OfflineStoreError::SerializationError(e.to_string()))?,
            enqueued_at: DateTime::parse_from_rfc3339(&row.enqueued_at)
                .map_err(|e| OfflineStoreError::SerializationError(e.to_string()))?
                .with_timezone(&Utc),
            callback_id: row.callback_id,
        })
    }
}

#[async_trait]
impl OfflineStorePort for SqliteOfflineStore {
    async fn load_all(&self) -> Result<Vec<OfflineRequest>, OfflineStoreError> {
        let rows: Vec<OfflineRow> = sqlx::query_as(
            "SELECT id, kind, request, enqueued_at, callback_id FROM offline_requests ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(OfflineRequest::try_from).collect()
    }

    async fn append(&self, request: &OfflineRequest) -> Result<(), OfflineStoreError> {
        let body = serde_json::to_string(&request.request)
            .map_err(|e| OfflineStoreError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO offline_requests (id, kind, request, enqueued_at, callback_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(request.kind.as_str())
        .bind(body)
        .bind(request.enqueued_at.to_rfc3339())
        .bind(&request.callback_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), OfflineStoreError> {
        sqlx::query("DELETE FROM offline_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), OfflineStoreError> {
        sqlx::query("DELETE FROM offline_requests")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
