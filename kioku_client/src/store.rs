//! Durable local replica. Holds the same entity tables as the server plus
//! the sync queue and cursor; user-facing queries filter soft-deleted rows,
//! sync internals see everything.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use kioku::{
    Error,
    config::SyncTuning,
    crdt::CrdtDocument,
    db,
    model::{Card, Deck, NEW_CARD_STATE, Note, NoteFieldType, NoteFieldValue, SyncEntity, SyncVersion},
};
use sqlx::{Sqlite, SqlitePool, Transaction, sqlite::SqlitePoolOptions};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug)]
pub struct LocalStore {
    pool: SqlitePool,
    user_id: Uuid,
    replica_id: String,
    tuning: SyncTuning,
}

impl LocalStore {
    /// Opens (and migrates) the replica at `database_url`. The replica id is
    /// minted on first open and stable afterwards.
    pub async fn open(database_url: &str, user_id: Uuid, tuning: SyncTuning) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| Error::Sqlx { source: e })?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| Error::Sqlx { source: sqlx::Error::Migrate(Box::new(e)) })?;

        sqlx::query(
            r"INSERT INTO sync_state (id, replica_id, last_sync_version)
              VALUES (1, ?, 0)
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .execute(&pool)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        let (replica_id,): (String,) =
            sqlx::query_as(r"SELECT replica_id FROM sync_state WHERE id = 1")
                .fetch_one(&pool)
                .await
                .map_err(|e| Error::Sqlx { source: e })?;

        Ok(Self {
            pool,
            user_id,
            replica_id,
            tuning,
        })
    }

    pub async fn open_in_memory(user_id: Uuid, tuning: SyncTuning) -> Result<Self, Error> {
        Self::open("sqlite::memory:", user_id, tuning).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, Error> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn get<T: SyncEntity>(&self, id: Uuid) -> Result<Option<T>, Error> {
        let mut conn = self.acquire().await?;
        db::fetch_by_id(&mut conn, id).await
    }

    pub async fn put<T: SyncEntity>(&self, row: &T) -> Result<(), Error> {
        let mut conn = self.acquire().await?;
        db::replace_row(&mut conn, row).await
    }

    pub async fn load_document(&self, document_id: &str) -> Result<Option<CrdtDocument>, Error> {
        let mut conn = self.acquire().await?;
        db::load_document(&mut conn, document_id).await
    }

    pub async fn save_document(
        &self,
        document: &CrdtDocument,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;
        db::save_document(&mut conn, self.user_id, document, at).await
    }

    /// Non-deleted decks, by name.
    pub async fn find_decks(&self) -> Result<Vec<Deck>, Error> {
        sqlx::query_as(r"SELECT * FROM deck WHERE deleted_at IS NULL ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_deck_by_name(&self, name: &str) -> Result<Option<Deck>, Error> {
        sqlx::query_as(r"SELECT * FROM deck WHERE name = ? AND deleted_at IS NULL")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_cards_by_deck(&self, deck_id: Uuid) -> Result<Vec<Card>, Error> {
        sqlx::query_as(
            r"SELECT * FROM card WHERE deck_id = ? AND deleted_at IS NULL ORDER BY due ASC, id ASC",
        )
        .bind(deck_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_cards_by_note(&self, note_id: Uuid) -> Result<Vec<Card>, Error> {
        sqlx::query_as(r"SELECT * FROM card WHERE note_id = ? AND deleted_at IS NULL")
            .bind(note_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_notes_by_note_type(&self, note_type_id: Uuid) -> Result<Vec<Note>, Error> {
        sqlx::query_as(r"SELECT * FROM note WHERE note_type_id = ? AND deleted_at IS NULL")
            .bind(note_type_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_field_types(&self, note_type_id: Uuid) -> Result<Vec<NoteFieldType>, Error> {
        sqlx::query_as(
            r"SELECT * FROM note_field_type
              WHERE note_type_id = ? AND deleted_at IS NULL ORDER BY ord ASC",
        )
        .bind(note_type_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Sqlx { source: e })
    }

    pub async fn find_field_values(&self, note_id: Uuid) -> Result<Vec<NoteFieldValue>, Error> {
        sqlx::query_as(r"SELECT * FROM note_field_value WHERE note_id = ? AND deleted_at IS NULL")
            .bind(note_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }

    /// The study queue: every non-new card due by `before`, plus at most
    /// `new_cards_per_day` new cards, sorted by due date then id.
    pub async fn find_due(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Card>, Error> {
        let due: Vec<Card> = sqlx::query_as(
            r"SELECT * FROM card
              WHERE deleted_at IS NULL AND state != ? AND due <= ?
              ORDER BY due ASC, id ASC
              LIMIT ?",
        )
        .bind(NEW_CARD_STATE)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        let fresh: Vec<Card> = sqlx::query_as(
            r"SELECT * FROM card
              WHERE deleted_at IS NULL AND state = ?
              ORDER BY due ASC, id ASC
              LIMIT ?",
        )
        .bind(NEW_CARD_STATE)
        .bind(self.tuning.new_cards_per_day)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        Ok(due
            .into_iter()
            .chain(fresh)
            .sorted_by_key(|card| (card.due, card.id))
            .take(limit as usize)
            .collect())
    }

    pub async fn last_sync_version(&self) -> Result<SyncVersion, Error> {
        let (version,): (SyncVersion,) =
            sqlx::query_as(r"SELECT last_sync_version FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Sqlx { source: e })?;
        Ok(version)
    }

    pub async fn set_last_sync_version(
        &self,
        version: SyncVersion,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(r"UPDATE sync_state SET last_sync_version = ?, last_sync_at = ? WHERE id = 1")
            .bind(version)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Sqlx { source: e })?;
        Ok(())
    }

    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let (at,): (Option<DateTime<Utc>>,) =
            sqlx::query_as(r"SELECT last_sync_at FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Sqlx { source: e })?;
        Ok(at)
    }

    pub(crate) async fn acquire(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Sqlite>, Error> {
        self.pool
            .acquire()
            .await
            .map_err(|e| Error::Sqlx { source: e })
    }
}
