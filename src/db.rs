use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;

// Boxed future whose lifetime is tied to the borrowed Transaction.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub async fn with_tx<'p, T, F>(pool: &'p SqlitePool, f: F) -> Result<T>
where
    T: Send + 'static,
    // The Transaction's own lifetime is tied to the pool borrow ('p), while each
    // call gets its own shorter borrow lifetime ('a) of that transaction.
    F: for<'a> FnOnce(&'a mut Transaction<'p, Sqlite>) -> TxFuture<'a, T>,
{
    let mut tx = pool.begin().await?;

    let res = f(&mut tx).await;

    match res {
        Ok(out) => {
            tx.commit().await?;
            Ok(out)
        }
        Err(err) => {
            // Drop would roll back, but do it explicitly for clarity.
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

pub async fn open_pool(db_path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    target = "plume",
                    error = %e,
                    event = "db_dir_create_failed",
                    path = %parent.display()
                );
                e
            })?;
        }
    }
    tracing::info!(target = "plume", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::from_str(&db_path.to_string_lossy())?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// In-memory pool for tests and ephemeral runs. A single connection keeps the
/// database alive for the pool's lifetime.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "plume",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target = "plume",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}
