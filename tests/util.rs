use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;

use plume_lib::{migrate, Engine, Feather};

/// In-memory engine bootstrapped by the real migrations. A single connection
/// keeps the database alive for the pool's lifetime.
pub async fn test_engine() -> Result<Arc<Engine>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    migrate::apply_migrations(&pool).await?;
    let engine = Arc::new(Engine::new(pool)?);
    {
        let mut conn = engine.pool.acquire().await?;
        engine.catalog.ensure_core(&mut *conn).await?;
    }
    Ok(engine)
}

pub async fn save_feather(engine: &Engine, spec: Value) -> Result<()> {
    let feather: Feather = serde_json::from_value(spec)?;
    let mut tx = engine.pool.begin().await?;
    engine.catalog.save_feather(&mut *tx, feather).await?;
    tx.commit().await?;
    Ok(())
}

/// A plain Contact shape used across suites.
pub async fn save_contact_feather(engine: &Engine) -> Result<()> {
    save_feather(
        engine,
        serde_json::json!({
            "name": "Contact",
            "plural": "Contacts",
            "properties": {
                "firstName": {"type": "string"},
                "lastName": {"type": "string", "isNaturalKey": true},
                "age": {"type": "integer"},
                "nickname": {"type": "string", "default": null}
            }
        }),
    )
    .await
}

/// Extract the value an RFC 6902 patch assigns to a top-level path.
pub fn patch_value<'a>(patch: &'a Value, path: &str) -> Option<&'a Value> {
    patch.as_array().and_then(|ops| {
        ops.iter()
            .find(|op| op.get("path").and_then(|p| p.as_str()) == Some(path))
            .and_then(|op| op.get("value"))
    })
}
