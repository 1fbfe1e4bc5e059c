//! Postgres pool construction and schema migrations.
//!
//! Migrations are plain `.sql` files applied in file-name order. Each applied
//! file is recorded in `schema_migrations`, so a file runs at most once per
//! database.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, info};

/// Directory the binary reads migrations from, relative to its working directory.
pub const MIGRATIONS_DIR: &str = "migrations";

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Connection settings for the configured database.
pub fn postgres_config(cfg: &AppConfig) -> PgConfig {
    let mut pg = PgConfig::new();
    pg.host(&cfg.db_host)
        .port(cfg.db_port)
        .user(&cfg.db_user)
        .password(&cfg.db_password)
        .dbname(&cfg.db_name)
        .application_name("storefront-backend");
    pg
}

/// Builds the connection pool without touching the database.
pub fn create_pool(cfg: &AppConfig) -> Result<Pool> {
    let mgr = Manager::from_config(
        postgres_config(cfg),
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr)
        .max_size(cfg.db_pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")
}

/// Creates the pool and brings the schema up to date.
///
/// # Errors
/// Returns an error if no connection can be made or a migration fails.
pub async fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let pool = create_pool(cfg)?;
    let client = pool
        .get()
        .await
        .context("Failed to get DB connection for migrations")?;
    run_migrations(&client, MIGRATIONS_DIR).await?;
    info!(host = %cfg.db_host, db = %cfg.db_name, pool_size = cfg.db_pool_size, "Database pool ready");
    Ok(pool)
}

/// Round-trips a trivial query through the pool.
pub async fn check_connection(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("Failed to get DB connection")?;
    client.simple_query("SELECT 1").await.context("Database ping failed")?;
    debug!("Database connection healthy");
    Ok(())
}

/// `.sql` files of `dir` not yet in `applied`, in file-name order.
fn pending<'a>(files: &'a [PathBuf], applied: &HashSet<String>) -> Vec<(&'a Path, String)> {
    let mut out: Vec<(&Path, String)> = files
        .iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
        .filter_map(|p| {
            let name = p.file_name()?.to_string_lossy().into_owned();
            (!applied.contains(&name)).then_some((p.as_path(), name))
        })
        .collect();
    out.sort_by(|a, b| a.1.cmp(&b.1));
    out
}

/// Applies every migration in `migrations_dir` that this database has not seen.
///
/// Each file runs in its own transaction together with its tracking row.
///
/// # Errors
/// Returns an error if the directory cannot be read or a file fails to apply.
pub async fn run_migrations(client: &Client, migrations_dir: &str) -> Result<()> {
    let start = Instant::now();
    client
        .batch_execute(TRACKING_TABLE)
        .await
        .context("Failed to create schema_migrations table")?;
    let applied: HashSet<String> = client
        .query("SELECT name FROM schema_migrations", &[])
        .await
        .context("Failed to read applied migrations")?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let mut entries = fs::read_dir(migrations_dir)
        .await
        .with_context(|| format!("Failed to read migrations directory {migrations_dir}"))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }

    let todo = pending(&files, &applied);
    for (path, name) in &todo {
        info!(migration = %name, "Applying migration");
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read migration file {name}"))?;
        let script = format!(
            "BEGIN;\n{content}\nINSERT INTO schema_migrations (name) VALUES ('{}');\nCOMMIT;",
            name.replace('\'', "''")
        );
        if let Err(e) = client.batch_execute(&script).await {
            // Leave the session usable for the caller.
            let _ = client.batch_execute("ROLLBACK").await;
            return Err(e).with_context(|| format!("Failed to execute migration {name}"));
        }
    }
    info!(applied = todo.len(), elapsed = ?start.elapsed(), "Migrations complete");
    Ok(())
}
