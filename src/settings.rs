use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::id::new_uuid_v7;

/// A named settings blob with its optimistic-lock token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub name: String,
    pub etag: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<Value>,
}

pub async fn get_settings(
    conn: &mut SqliteConnection,
    name: &str,
) -> AppResult<Option<Settings>> {
    let row = sqlx::query("SELECT name, etag, data, definition FROM _settings WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    let Some(row) = row else {
        return Ok(None);
    };
    let data: String = row.get("data");
    let definition: Option<String> = row.get("definition");
    Ok(Some(Settings {
        name: row.get("name"),
        etag: row.get("etag"),
        data: serde_json::from_str(&data).map_err(AppError::from)?,
        definition: definition
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(AppError::from)?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSettings {
    pub name: String,
    pub data: Value,
    /// Expected etag of the stored row; a mismatch means someone else saved
    /// first.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub definition: Option<Value>,
}

pub async fn save_settings(
    conn: &mut SqliteConnection,
    save: &SaveSettings,
) -> AppResult<Settings> {
    if save.name.is_empty() {
        return Err(AppError::validation("Settings require a name"));
    }
    let existing = get_settings(conn, &save.name).await?;
    if let (Some(existing), Some(expected)) = (&existing, &save.etag) {
        if existing.etag != *expected {
            return Err(AppError::conflict(format!(
                "Settings {} have changed since they were read",
                save.name
            )));
        }
    }

    let etag = new_uuid_v7();
    let data = save.data.to_string();
    let definition = save
        .definition
        .as_ref()
        .map(|d| d.to_string())
        .or_else(|| {
            existing
                .as_ref()
                .and_then(|e| e.definition.as_ref().map(|d| d.to_string()))
        });
    sqlx::query(
        "INSERT INTO _settings (name, etag, data, definition) VALUES (?, ?, ?, ?) \
         ON CONFLICT (name) DO UPDATE SET etag = excluded.etag, data = excluded.data, \
         definition = excluded.definition",
    )
    .bind(&save.name)
    .bind(&etag)
    .bind(&data)
    .bind(&definition)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;

    info!(target = "plume", event = "settings_saved", name = %save.name);
    Ok(Settings {
        name: save.name.clone(),
        etag,
        data: save.data.clone(),
        definition: save.definition.clone().or_else(|| {
            existing.and_then(|e| e.definition)
        }),
    })
}

/// Schema of every settings blob that declares one.
pub async fn settings_definition(conn: &mut SqliteConnection) -> AppResult<Value> {
    let rows = sqlx::query(
        "SELECT name, definition FROM _settings WHERE definition IS NOT NULL ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(AppError::from)?;
    let mut definitions = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("name");
        let definition: String = row.get("definition");
        let definition: Value = serde_json::from_str(&definition).map_err(AppError::from)?;
        definitions.push(json!({ "name": name, "definition": definition }));
    }
    Ok(Value::Array(definitions))
}
