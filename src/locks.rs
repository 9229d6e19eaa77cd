use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::time::now_utc;

/// A pessimistic record lock: holder identity plus the event key of the
/// originating browser tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub username: String,
    pub acquired: String,
    pub node_id: String,
    pub event_key: String,
}

/// Acquire a lock on an object. Returns true iff the object was unlocked; a
/// second acquire under the same event key is a no-op success.
pub async fn lock(
    conn: &mut SqliteConnection,
    node_id: &str,
    id: &str,
    username: &str,
    event_key: &str,
) -> AppResult<bool> {
    if id.is_empty() || event_key.is_empty() {
        return Err(AppError::validation("Lock requires an id and an event key"));
    }
    if let Some(existing) = find(conn, id).await? {
        return Ok(existing.event_key == event_key);
    }
    sqlx::query(
        "INSERT INTO _lock (object_id, username, acquired, node_id, event_key) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(username)
    .bind(now_utc())
    .bind(node_id)
    .bind(event_key)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    debug!(target = "plume", event = "lock_acquired", object = %id, user = %username);
    Ok(true)
}

pub async fn find(conn: &mut SqliteConnection, id: &str) -> AppResult<Option<Lock>> {
    let row = sqlx::query(
        "SELECT username, acquired, node_id, event_key FROM _lock WHERE object_id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(row.map(|r| Lock {
        username: r.get("username"),
        acquired: r.get("acquired"),
        node_id: r.get("node_id"),
        event_key: r.get("event_key"),
    }))
}

/// Release criteria. At least one field must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnlockCriteria {
    pub id: Option<String>,
    pub username: Option<String>,
    pub event_key: Option<String>,
    pub node_id: Option<String>,
}

pub async fn unlock(conn: &mut SqliteConnection, criteria: &UnlockCriteria) -> AppResult<u64> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if let Some(id) = &criteria.id {
        clauses.push("object_id = ?");
        params.push(id.clone());
    }
    if let Some(username) = &criteria.username {
        clauses.push("username = ?");
        params.push(username.clone());
    }
    if let Some(event_key) = &criteria.event_key {
        clauses.push("event_key = ?");
        params.push(event_key.clone());
    }
    if let Some(node_id) = &criteria.node_id {
        clauses.push("node_id = ?");
        params.push(node_id.clone());
    }
    if clauses.is_empty() {
        return Err(AppError::validation("Unlock requires at least one criterion"));
    }
    let sql = format!("DELETE FROM _lock WHERE {}", clauses.join(" AND "));
    let mut query = sqlx::query(&sql);
    for param in &params {
        query = query.bind(param.clone());
    }
    let result = query.execute(&mut *conn).await.map_err(AppError::from)?;
    debug!(
        target = "plume",
        event = "lock_released",
        released = result.rows_affected()
    );
    Ok(result.rows_affected())
}
