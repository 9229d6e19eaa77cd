use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::id::new_uuid_v7;

/// Workbook metadata: name-keyed launch and layout configuration consumed by
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Workbook {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_config: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

impl Default for Workbook {
    fn default() -> Self {
        Workbook {
            name: String::new(),
            description: String::new(),
            module: None,
            launch_config: None,
            default_config: None,
            etag: String::new(),
        }
    }
}

fn workbook_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Workbook> {
    let launch: Option<String> = row.get("launch_config");
    let default: Option<String> = row.get("default_config");
    Ok(Workbook {
        name: row.get("name"),
        description: row.get("description"),
        module: row.get("module"),
        launch_config: launch
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(AppError::from)?,
        default_config: default
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(AppError::from)?,
        etag: row.get("etag"),
    })
}

pub async fn get_workbooks(conn: &mut SqliteConnection) -> AppResult<Vec<Workbook>> {
    let rows = sqlx::query("SELECT * FROM _workbook ORDER BY name")
        .fetch_all(&mut *conn)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(workbook_from_row).collect()
}

pub async fn get_workbook(
    conn: &mut SqliteConnection,
    name: &str,
) -> AppResult<Option<Workbook>> {
    let row = sqlx::query("SELECT * FROM _workbook WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(workbook_from_row).transpose()
}

pub async fn save_workbook(
    conn: &mut SqliteConnection,
    workbook: &Workbook,
) -> AppResult<Workbook> {
    if workbook.name.is_empty() {
        return Err(AppError::validation("Workbook requires a name"));
    }
    let etag = new_uuid_v7();
    sqlx::query(
        "INSERT INTO _workbook (name, description, module, launch_config, default_config, etag) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (name) DO UPDATE SET description = excluded.description, \
         module = excluded.module, launch_config = excluded.launch_config, \
         default_config = excluded.default_config, etag = excluded.etag",
    )
    .bind(&workbook.name)
    .bind(&workbook.description)
    .bind(&workbook.module)
    .bind(workbook.launch_config.as_ref().map(|v| v.to_string()))
    .bind(workbook.default_config.as_ref().map(|v| v.to_string()))
    .bind(&etag)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    info!(target = "plume", event = "workbook_saved", name = %workbook.name);
    let mut saved = workbook.clone();
    saved.etag = etag;
    Ok(saved)
}

pub async fn delete_workbook(conn: &mut SqliteConnection, name: &str) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM _workbook WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found(format!("Workbook not found: {name}")));
    }
    info!(target = "plume", event = "workbook_deleted", name = %name);
    Ok(())
}

/// Installed modules as `(name, version)` rows.
pub async fn get_modules(conn: &mut SqliteConnection) -> AppResult<Value> {
    let rows = sqlx::query("SELECT name, version FROM _module ORDER BY name")
        .fetch_all(&mut *conn)
        .await
        .map_err(AppError::from)?;
    let modules: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "name": row.get::<String, _>("name"),
                "version": row.get::<String, _>("version"),
            })
        })
        .collect();
    Ok(Value::Array(modules))
}
