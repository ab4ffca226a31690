//! Test database utilities for SQLite + SQLx.
//!
//! Features:
//! - Per-test database file in a fresh temporary directory, named using the
//!   test name.
//! - Automatic migrations.
//! - Automatic cleanup on success.
//! - Keep the file on failure or when `TEST_KEEP_DB` is set.

use std::path::Path;
use std::time::Duration;
use std::{future::Future, pin::Pin};

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Create a fresh SQLite database, run `f` with a connection pool to it, then
/// clean up afterward.
///
/// - The file lives in a new temporary directory and is named after `test_name`.
/// - Migrations are applied to the new database.
/// - On success and if `TEST_KEEP_DB` is **not** set, the directory is removed.
/// - On error or if `TEST_KEEP_DB` **is** set, the file is kept (and its path
///   is logged).
///
/// The pool matches what `lockstep::SqliteStore::connect` builds: WAL
/// journaling, a busy timeout and a single connection. Use
/// [`connect_additional`] for a second, independent pool on the same file.
pub async fn with_test_db<F, T>(test_name: &str, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a SqlitePool) -> Pin<Box<dyn Future<Output = Result<T>> + 'a>>,
{
    let dir = tempfile::Builder::new().prefix("lockstep-test-").tempdir()?;
    let db_path = dir.path().join(make_db_file_name(test_name));

    let pool = connect_file(&db_path).await?;

    // Path is relative to CARGO_MANIFEST_DIR.
    sqlx::migrate!("../lockstep/migrations").run(&pool).await?;

    let result = f(&pool).await;

    pool.close().await;

    let keep = std::env::var("TEST_KEEP_DB").is_ok();
    if result.is_ok() && !keep {
        if let Err(e) = dir.close() {
            eprintln!("[with_test_db] Failed to remove '{}': {}", db_path.display(), e);
        }
    } else {
        let _ = dir.keep();
        eprintln!(
            "[with_test_db] Keeping database '{}' (error or TEST_KEEP_DB set)",
            db_path.display()
        );
    }

    result
}

/// Open another pool on the database behind `pool`.
///
/// Simulates a second process sharing the same store.
pub async fn connect_additional(pool: &SqlitePool) -> Result<SqlitePool> {
    let options = (*pool.connect_options()).clone();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn connect_file(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Build a file name from a test name.
///
/// - lowercases
/// - replaces non-ascii-alphanumeric with '_'
/// - truncates to keep paths short
fn make_db_file_name(test_name: &str) -> String {
    let mut safe: String = test_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    safe = safe.trim_matches('_').to_owned();
    safe.truncate(64);

    if safe.is_empty() {
        safe.push_str("test");
    }
    format!("{safe}.db")
}

/// Macro to define a DB-backed async test.
///
/// Usage:
///
/// ```ignore
/// use test_utils::db_test;
///
/// db_test!(enqueue_lands_in_queued_table, |pool| {
///     // `pool` is &SqlitePool
///     sqlx::query("SELECT 1").execute(pool).await?;
///     Ok(())
/// });
/// ```
///
/// This expands to:
/// - `#[tokio::test(flavor = "multi_thread")]`
/// - a call to `with_test_db(stringify!(test_name), |pool| async move { ... })`
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            use $crate::db::with_test_db;

            let test_name = stringify!($name);

            with_test_db(test_name, |$pool| {
                let fut = async move { $body };
                Box::pin(fut)
            })
            .await
        }
    };
}
