//! In-memory database fixtures shared by this crate's tests and, behind the
//! `testing` feature, by downstream test suites.

use crate::model::User;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

/// One-connection in-memory pool with the authoritative schema applied.
/// A single connection is required: each in-memory SQLite connection is its
/// own database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::MIGRATOR.run(&pool).await.unwrap();
    pool
}

pub async fn create_user(pool: &SqlitePool, username: &str) -> User {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        created_at: now,
        updated_at: now,
    };
    sqlx::query(r"INSERT INTO user (id, username, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(user.id)
        .bind(user.username.clone())
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(pool)
        .await
        .unwrap();
    user
}
