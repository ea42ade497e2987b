//! Entity types shared by both replicas. These must match the migration files
//! of the server store and the client replica; the column types follow
//! <https://docs.rs/sqlx/latest/sqlx/sqlite/types/index.html>.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sqlx::{FromRow, Sqlite, sqlite::SqliteArguments, sqlite::SqliteRow};
use uuid::Uuid;

pub type StateId = u32;
pub type RatingId = u32;
/// Per-user monotonic counter assigned by the server. Never reused.
pub type SyncVersion = i64;

pub const NEW_CARD_STATE: StateId = 0;
/// Upper bound on any scheduled interval, in days.
pub const MAX_SCHEDULED_DAYS: i64 = 36_500;

pub type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Every syncable entity type, in no particular order. Use [`PUSH_ORDER`]
/// when ordering matters.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    sqlx::Type,
    strum::Display,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Deck,
    NoteType,
    NoteFieldType,
    Note,
    NoteFieldValue,
    Card,
    ReviewLog,
}

/// Parent-first application order: within one push, a compliant client never
/// references a not-yet-pushed parent, and the server applies rows in this
/// order so foreign keys resolve. Decks are independent and go first.
pub const PUSH_ORDER: [EntityKind; 7] = [
    EntityKind::Deck,
    EntityKind::NoteType,
    EntityKind::NoteFieldType,
    EntityKind::Note,
    EntityKind::NoteFieldValue,
    EntityKind::Card,
    EntityKind::ReviewLog,
];

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Deck => "deck",
            EntityKind::NoteType => "note_type",
            EntityKind::NoteFieldType => "note_field_type",
            EntityKind::Note => "note",
            EntityKind::NoteFieldValue => "note_field_value",
            EntityKind::Card => "card",
            EntityKind::ReviewLog => "review_log",
        }
    }
}

/// Row-level access shared by the authoritative store and the client replica.
/// The JSON representation doubles as the wire snapshot, so the serde names
/// are the wire names.
pub trait SyncEntity:
    Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + Unpin
    + for<'r> FromRow<'r, SqliteRow>
{
    const KIND: EntityKind;

    fn id(&self) -> Uuid;
    fn user_id(&self) -> Uuid;
    fn updated_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn sync_version(&self) -> SyncVersion;
    fn set_sync_version(&mut self, version: SyncVersion);

    /// Full-row upsert statement; bound by [`SyncEntity::bind_replace`] in
    /// declaration order.
    fn replace_sql() -> &'static str;
    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

macro_rules! impl_sync_entity_accessors {
    ($updated_at:ident) => {
        fn id(&self) -> Uuid {
            self.id
        }
        fn user_id(&self) -> Uuid {
            self.user_id
        }
        fn updated_at(&self) -> DateTime<Utc> {
            self.$updated_at
        }
        fn sync_version(&self) -> SyncVersion {
            self.sync_version
        }
        fn set_sync_version(&mut self, version: SyncVersion) {
            self.sync_version = version;
        }
    };
}

#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deck {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for Deck {
    const KIND: EntityKind = EntityKind::Deck;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO deck
          (id, user_id, name, created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.name.clone())
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

/// Template schema for notes: `{{FieldName}}` placeholders in the templates
/// are substituted from the note's field values. A reversible note type
/// always yields exactly two cards per note, a plain one exactly one.
#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteType {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub front_template: String,
    pub back_template: String,
    pub is_reversible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for NoteType {
    const KIND: EntityKind = EntityKind::NoteType;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO note_type
          (id, user_id, name, front_template, back_template, is_reversible,
           created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.name.clone())
            .bind(self.front_template.clone())
            .bind(self.back_template.clone())
            .bind(self.is_reversible)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFieldType {
    pub id: Uuid,
    pub user_id: Uuid,
    pub note_type_id: Uuid,
    pub name: String,
    /// 0-based position within the note type. `(note_type_id, ord)` and
    /// `(note_type_id, name)` are both unique.
    pub ord: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for NoteFieldType {
    const KIND: EntityKind = EntityKind::NoteFieldType;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO note_field_type
          (id, user_id, note_type_id, name, ord, created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.note_type_id)
            .bind(self.name.clone())
            .bind(self.ord)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    pub user_id: Uuid,
    pub deck_id: Uuid,
    pub note_type_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for Note {
    const KIND: EntityKind = EntityKind::Note;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO note
          (id, user_id, deck_id, note_type_id, created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.deck_id)
            .bind(self.note_type_id)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFieldValue {
    pub id: Uuid,
    pub user_id: Uuid,
    pub note_id: Uuid,
    pub note_field_type_id: Uuid,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for NoteFieldValue {
    const KIND: EntityKind = EntityKind::NoteFieldValue;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO note_field_value
          (id, user_id, note_id, note_field_type_id, value, created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.note_id)
            .bind(self.note_field_type_id)
            .bind(self.value.clone())
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

/// One scheduling instance materialized from a note. `front` and `back` are
/// derived from the note type's templates at generation time and preserved
/// afterwards so cards render offline without their note.
#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub note_id: Uuid,
    pub deck_id: Uuid,
    pub front: String,
    pub back: String,
    /// `(note_id, is_reversed)` is unique.
    pub is_reversed: bool,
    pub state: StateId,
    pub due: DateTime<Utc>,
    pub stability: f64,
    pub difficulty: f64,
    pub elapsed_days: i64,
    pub scheduled_days: i64,
    pub reps: i64,
    pub lapses: i64,
    pub last_review: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for Card {
    const KIND: EntityKind = EntityKind::Card;

    impl_sync_entity_accessors!(updated_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO card
          (id, user_id, note_id, deck_id, front, back, is_reversed, state, due,
           stability, difficulty, elapsed_days, scheduled_days, reps, lapses,
           last_review, created_at, updated_at, deleted_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.note_id)
            .bind(self.deck_id)
            .bind(self.front.clone())
            .bind(self.back.clone())
            .bind(self.is_reversed)
            .bind(self.state)
            .bind(self.due)
            .bind(self.stability)
            .bind(self.difficulty)
            .bind(self.elapsed_days)
            .bind(self.scheduled_days)
            .bind(self.reps)
            .bind(self.lapses)
            .bind(self.last_review)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.deleted_at)
            .bind(self.sync_version)
    }
}

/// Append-only record of one review. Immutable after creation; replicas merge
/// review logs by id union rather than by field.
#[derive(Clone, Debug, Deserialize, FromRow, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_id: Uuid,
    pub rating: RatingId,
    /// Card state before this review.
    pub previous_state: StateId,
    pub elapsed_days: i64,
    pub scheduled_days: i64,
    /// Stability and difficulty after this review, recorded so the server can
    /// re-run the scheduler and compare.
    pub stability: f64,
    pub difficulty: f64,
    pub reviewed_at: DateTime<Utc>,
    /// How long the review took.
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
    pub sync_version: SyncVersion,
}

impl SyncEntity for ReviewLog {
    const KIND: EntityKind = EntityKind::ReviewLog;

    impl_sync_entity_accessors!(created_at);

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn replace_sql() -> &'static str {
        r"INSERT OR REPLACE INTO review_log
          (id, user_id, card_id, rating, previous_state, elapsed_days, scheduled_days,
           stability, difficulty, reviewed_at, duration_ms, created_at, sync_version)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    fn bind_replace<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.user_id)
            .bind(self.card_id)
            .bind(self.rating)
            .bind(self.previous_state)
            .bind(self.elapsed_days)
            .bind(self.scheduled_days)
            .bind(self.stability)
            .bind(self.difficulty)
            .bind(self.reviewed_at)
            .bind(self.duration_ms)
            .bind(self.created_at)
            .bind(self.sync_version)
    }
}

impl Card {
    /// A freshly generated card: new state, due immediately.
    pub fn new(
        user_id: Uuid,
        note_id: Uuid,
        deck_id: Uuid,
        front: String,
        back: String,
        is_reversed: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            note_id,
            deck_id,
            front,
            back,
            is_reversed,
            state: NEW_CARD_STATE,
            due: created_at,
            stability: 0.0,
            difficulty: 0.0,
            elapsed_days: 0,
            scheduled_days: 0,
            reps: 0,
            lapses: 0,
            last_review: None,
            created_at,
            updated_at: created_at,
            deleted_at: None,
            sync_version: 0,
        }
    }
}
