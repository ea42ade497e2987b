//! Row-level helpers shared by the authoritative store and the client
//! replica. Both schemas declare the same entity tables and the same
//! `crdt_document` table, so this is the one place that knows the SQL.

use crate::{
    Error,
    crdt::CrdtDocument,
    model::{SyncEntity, SyncVersion},
};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn fetch_by_id<T: SyncEntity>(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<T>, Error> {
    let sql = format!("SELECT * FROM {} WHERE id = ?", T::KIND.table());
    let row = sqlx::query_as::<_, T>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    Ok(row)
}

pub async fn replace_row<T: SyncEntity>(conn: &mut SqliteConnection, row: &T) -> Result<(), Error> {
    row.bind_replace(sqlx::query(T::replace_sql()))
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Rows of one user newer than `since`, ordered by sync version so pulls page
/// deterministically.
pub async fn rows_since<T: SyncEntity>(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    since: SyncVersion,
    limit: i64,
) -> Result<Vec<T>, Error> {
    let sql = format!(
        "SELECT * FROM {} WHERE user_id = ? AND sync_version > ? ORDER BY sync_version ASC LIMIT ?",
        T::KIND.table()
    );
    let rows = sqlx::query_as::<_, T>(&sql)
        .bind(user_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    Ok(rows)
}

pub async fn load_document(
    conn: &mut SqliteConnection,
    document_id: &str,
) -> Result<Option<CrdtDocument>, Error> {
    let binary: Option<(Vec<u8>,)> =
        sqlx::query_as(r"SELECT binary FROM crdt_document WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Error::Sqlx { source: e })?;
    binary
        .map(|(bytes,)| CrdtDocument::from_bytes(&bytes))
        .transpose()
}

pub async fn save_document(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    document: &CrdtDocument,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    sqlx::query(
        r"INSERT OR REPLACE INTO crdt_document
          (document_id, user_id, entity_type, entity_id, binary, updated_at)
          VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(document.document_id())
    .bind(user_id)
    .bind(document.entity_type)
    .bind(document.entity_id)
    .bind(document.to_bytes())
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}
