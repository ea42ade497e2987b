//! Persistent record of what still needs to be pushed. One row per dirty
//! entity; every local write enqueues idempotently. Rows move
//! `pending -> in_flight -> (synced | failed)`; failed rows re-pend on the
//! next retry tick unless quarantined by a validation failure, in which case
//! only a fresh local edit revives them.

use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use kioku::{Error, model::EntityKind};
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

#[derive(Clone, Debug, FromRow)]
pub struct QueueEntry {
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub local_updated_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub quarantined: bool,
}

/// Marks a row dirty. Re-enqueueing an already-dirty row refreshes its
/// timestamp and clears any failure state, which is also how a quarantined
/// row gets another chance after a local edit.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    sqlx::query(
        r"INSERT INTO sync_queue (entity_type, entity_id, local_updated_at, status)
          VALUES (?, ?, ?, 'pending')
          ON CONFLICT (entity_type, entity_id) DO UPDATE SET
              local_updated_at = excluded.local_updated_at,
              status = 'pending',
              quarantined = 0,
              last_error = NULL",
    )
    .bind(kind)
    .bind(entity_id)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

pub async fn get_pending_changes(conn: &mut SqliteConnection) -> Result<Vec<QueueEntry>, Error> {
    sqlx::query_as(
        r"SELECT * FROM sync_queue WHERE status = 'pending' ORDER BY local_updated_at ASC",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })
}

pub async fn mark_in_flight(
    conn: &mut SqliteConnection,
    entries: &[QueueEntry],
) -> Result<(), Error> {
    for entry in entries {
        sqlx::query(
            r"UPDATE sync_queue SET status = 'in_flight'
              WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(entry.entity_type)
        .bind(entry.entity_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    }
    Ok(())
}

/// Clears a row after the server acknowledged it. Rows re-dirtied while the
/// push was in flight stay pending.
pub async fn mark_synced(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
) -> Result<(), Error> {
    sqlx::query(
        r"UPDATE sync_queue
          SET status = 'synced', last_error = NULL, attempt_count = 0
          WHERE entity_type = ? AND entity_id = ? AND status = 'in_flight'",
    )
    .bind(kind)
    .bind(entity_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

pub async fn mark_failed(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
    error: &str,
    quarantine: bool,
) -> Result<(), Error> {
    sqlx::query(
        r"UPDATE sync_queue
          SET status = 'failed', last_error = ?, attempt_count = attempt_count + 1,
              quarantined = quarantined OR ?
          WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(error)
    .bind(quarantine)
    .bind(kind)
    .bind(entity_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Retry tick: failed rows become pending again, quarantined ones stay put.
pub async fn repend_failed(conn: &mut SqliteConnection) -> Result<u64, Error> {
    let result = sqlx::query(
        r"UPDATE sync_queue SET status = 'pending'
          WHERE status = 'failed' AND quarantined = 0",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(result.rows_affected())
}

pub async fn pending_count(conn: &mut SqliteConnection) -> Result<i64, Error> {
    let (count,): (i64,) =
        sqlx::query_as(r"SELECT COUNT(*) FROM sync_queue WHERE status != 'synced'")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::Sqlx { source: e })?;
    Ok(count)
}

pub async fn has_pending(conn: &mut SqliteConnection) -> Result<bool, Error> {
    Ok(pending_count(conn).await? > 0)
}

pub async fn last_error(conn: &mut SqliteConnection) -> Result<Option<String>, Error> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        r"SELECT last_error FROM sync_queue
          WHERE last_error IS NOT NULL
          ORDER BY local_updated_at DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(row.and_then(|(e,)| e))
}

impl LocalStore {
    pub async fn pending_count(&self) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;
        pending_count(&mut conn).await
    }

    pub async fn has_pending(&self) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;
        has_pending(&mut conn).await
    }
}
