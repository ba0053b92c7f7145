//! Test helpers for building in-memory stores.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::DbResult;
use crate::store;

/// Create an in-memory database with the full schema for testing.
pub async fn create_test_pool() -> DbResult<SqlitePool> {
    init_sqlite_vec()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await?;

    store::run_migrations(&pool).await?;
    Ok(pool)
}

fn init_sqlite_vec() -> DbResult<()> {
    use libsqlite3_sys::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};
    use sqlite_vec::sqlite3_vec_init;

    unsafe {
        type SqliteVecInitFn =
            unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), SqliteVecInitFn>(
            sqlite3_vec_init as *const (),
        )));
    }
    Ok(())
}
