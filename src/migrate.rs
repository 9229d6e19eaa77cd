use anyhow::bail;
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashSet;
use std::time::Instant;

use crate::time::now_utc;
use tracing::{error, info};

/// Base system schema. Feather tables are synthesized at runtime by the
/// catalog; everything here is fixed plumbing.
const BASE_SCHEMA: &[(&str, &str)] = &[(
    "0001_base",
    r#"
    CREATE TABLE object (
        _pk INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        feather TEXT NOT NULL
    );

    CREATE TABLE _feather (
        _pk INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        etag TEXT NOT NULL,
        spec TEXT NOT NULL,
        is_system INTEGER NOT NULL DEFAULT 0,
        created TEXT NOT NULL,
        updated TEXT NOT NULL
    );

    CREATE TABLE _auth (
        object_pk INTEGER NOT NULL,
        role TEXT NOT NULL,
        can_create INTEGER NOT NULL DEFAULT 0,
        can_read INTEGER NOT NULL DEFAULT 0,
        can_update INTEGER NOT NULL DEFAULT 0,
        can_delete INTEGER NOT NULL DEFAULT 0,
        is_member_auth INTEGER NOT NULL DEFAULT 0,
        is_inherited INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (object_pk, role, is_member_auth)
    );
    CREATE INDEX idx_auth_role ON _auth(role);

    CREATE TABLE _subscription (
        node_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        subscription_id TEXT NOT NULL,
        target TEXT NOT NULL,
        PRIMARY KEY (node_id, session_id, subscription_id, target)
    );
    CREATE INDEX idx_subscription_target ON _subscription(target);
    CREATE INDEX idx_subscription_session ON _subscription(session_id);

    CREATE TABLE _lock (
        object_id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        acquired TEXT NOT NULL,
        node_id TEXT NOT NULL,
        event_key TEXT NOT NULL
    );

    CREATE TABLE _settings (
        name TEXT PRIMARY KEY,
        etag TEXT NOT NULL,
        data TEXT NOT NULL,
        definition TEXT
    );

    CREATE TABLE _sequence (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE role (
        name TEXT PRIMARY KEY,
        created TEXT NOT NULL
    );

    CREATE TABLE role_member (
        role TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (role, member)
    );

    CREATE TABLE user_account (
        name TEXT PRIMARY KEY,
        is_super INTEGER NOT NULL DEFAULT 0,
        created TEXT NOT NULL
    );

    CREATE TABLE log (
        object_id TEXT NOT NULL,
        action TEXT NOT NULL,
        created TEXT NOT NULL,
        created_by TEXT NOT NULL,
        updated TEXT NOT NULL,
        updated_by TEXT NOT NULL,
        change TEXT NOT NULL
    );
    CREATE INDEX idx_log_object ON log(object_id);

    CREATE TABLE _module (
        name TEXT PRIMARY KEY,
        version TEXT NOT NULL DEFAULT '',
        script TEXT
    );

    CREATE TABLE _workbook (
        name TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT '',
        module TEXT,
        launch_config TEXT,
        default_config TEXT,
        etag TEXT NOT NULL
    );
    "#,
)];

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for c in sql.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute("PRAGMA foreign_keys=ON").await?;
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let applied: HashSet<String> = rows
        .into_iter()
        .filter_map(|r| r.try_get("version").ok())
        .collect();

    for (version, raw_sql) in BASE_SCHEMA {
        if applied.contains(*version) {
            info!(target = "plume", event = "migration_skip", version = %version);
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&mut *tx).await?;
        let start = Instant::now();
        info!(target = "plume", event = "migration_begin", version = %version);
        for stmt in split_statements(raw_sql) {
            info!(target = "plume", event = "migration_stmt", sql = %preview(&stmt));
            if let Err(e) = sqlx::query(stmt.as_str()).execute(&mut *tx).await {
                error!(target = "plume", event = "migration_stmt_error", version = %version, error = %e);
                return Err(e.into());
            }
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now_utc())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(target = "plume", event = "migration_end", version = %version, elapsed = ?start.elapsed());
    }

    let fk_rows = sqlx::query("PRAGMA foreign_key_check;")
        .fetch_all(pool)
        .await?;
    if !fk_rows.is_empty() {
        bail!("foreign key violations after base schema");
    }

    seed(pool).await?;
    Ok(())
}

/// Idempotent seeds the auth layer depends on: the implicit `everyone` role
/// and a bootstrap super user.
async fn seed(pool: &SqlitePool) -> anyhow::Result<()> {
    let now = now_utc();
    sqlx::query("INSERT INTO role (name, created) VALUES ('everyone', ?) ON CONFLICT (name) DO NOTHING")
        .bind(&now)
        .execute(pool)
        .await?;
    sqlx::query(
        "INSERT INTO user_account (name, is_super, created) VALUES ('admin', 1, ?) \
         ON CONFLICT (name) DO NOTHING",
    )
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}
