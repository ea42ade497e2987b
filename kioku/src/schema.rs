//! Request/response types of the sync and review surface. Instants serialize
//! as RFC 3339 UTC; field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

pub mod sync {
    use crate::model::{
        Card, Deck, EntityKind, Note, NoteFieldType, NoteFieldValue, NoteType, ReviewLog,
        SyncVersion,
    };
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// One entity's CRDT document, base64-encoded.
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CrdtChange {
        pub document_id: String,
        pub entity_type: EntityKind,
        pub entity_id: Uuid,
        pub binary: String,
    }

    /// Batched client changes: row snapshots plus CRDT binaries. Arrays are
    /// ordered parent-first by a compliant client, but the server tolerates
    /// any order within one batch.
    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct PushRequest {
        pub decks: Vec<Deck>,
        pub note_types: Vec<NoteType>,
        pub note_field_types: Vec<NoteFieldType>,
        pub notes: Vec<Note>,
        pub note_field_values: Vec<NoteFieldValue>,
        pub cards: Vec<Card>,
        pub review_logs: Vec<ReviewLog>,
        pub crdt_changes: Vec<CrdtChange>,
    }

    impl PushRequest {
        pub fn is_empty(&self) -> bool {
            self.row_count() == 0
        }

        pub fn row_count(&self) -> usize {
            self.decks.len()
                + self.note_types.len()
                + self.note_field_types.len()
                + self.notes.len()
                + self.note_field_values.len()
                + self.cards.len()
                + self.review_logs.len()
        }
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct VersionAssignment {
        pub id: Uuid,
        pub sync_version: SyncVersion,
    }

    /// Ids whose rows the server kept over the client's (legacy no-binary
    /// path); the client re-reads them on its next pull.
    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct EntityConflicts {
        pub decks: Vec<Uuid>,
        pub note_types: Vec<Uuid>,
        pub note_field_types: Vec<Uuid>,
        pub notes: Vec<Uuid>,
        pub note_field_values: Vec<Uuid>,
        pub cards: Vec<Uuid>,
        pub review_logs: Vec<Uuid>,
    }

    impl EntityConflicts {
        pub fn of(&self, kind: EntityKind) -> &Vec<Uuid> {
            match kind {
                EntityKind::Deck => &self.decks,
                EntityKind::NoteType => &self.note_types,
                EntityKind::NoteFieldType => &self.note_field_types,
                EntityKind::Note => &self.notes,
                EntityKind::NoteFieldValue => &self.note_field_values,
                EntityKind::Card => &self.cards,
                EntityKind::ReviewLog => &self.review_logs,
            }
        }

        pub fn of_mut(&mut self, kind: EntityKind) -> &mut Vec<Uuid> {
            match kind {
                EntityKind::Deck => &mut self.decks,
                EntityKind::NoteType => &mut self.note_types,
                EntityKind::NoteFieldType => &mut self.note_field_types,
                EntityKind::Note => &mut self.notes,
                EntityKind::NoteFieldValue => &mut self.note_field_values,
                EntityKind::Card => &mut self.cards,
                EntityKind::ReviewLog => &mut self.review_logs,
            }
        }

        pub fn is_empty(&self) -> bool {
            crate::model::PUSH_ORDER.iter().all(|k| self.of(*k).is_empty())
        }

        pub fn len(&self) -> usize {
            crate::model::PUSH_ORDER.iter().map(|k| self.of(*k).len()).sum()
        }
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct PushResponse {
        pub decks: Vec<VersionAssignment>,
        pub note_types: Vec<VersionAssignment>,
        pub note_field_types: Vec<VersionAssignment>,
        pub notes: Vec<VersionAssignment>,
        pub note_field_values: Vec<VersionAssignment>,
        pub cards: Vec<VersionAssignment>,
        pub review_logs: Vec<VersionAssignment>,
        pub conflicts: EntityConflicts,
    }

    impl PushResponse {
        pub fn of(&self, kind: EntityKind) -> &Vec<VersionAssignment> {
            match kind {
                EntityKind::Deck => &self.decks,
                EntityKind::NoteType => &self.note_types,
                EntityKind::NoteFieldType => &self.note_field_types,
                EntityKind::Note => &self.notes,
                EntityKind::NoteFieldValue => &self.note_field_values,
                EntityKind::Card => &self.cards,
                EntityKind::ReviewLog => &self.review_logs,
            }
        }

        pub fn of_mut(&mut self, kind: EntityKind) -> &mut Vec<VersionAssignment> {
            match kind {
                EntityKind::Deck => &mut self.decks,
                EntityKind::NoteType => &mut self.note_types,
                EntityKind::NoteFieldType => &mut self.note_field_types,
                EntityKind::Note => &mut self.notes,
                EntityKind::NoteFieldValue => &mut self.note_field_values,
                EntityKind::Card => &mut self.cards,
                EntityKind::ReviewLog => &mut self.review_logs,
            }
        }

        pub fn assigned_count(&self) -> usize {
            crate::model::PUSH_ORDER.iter().map(|k| self.of(*k).len()).sum()
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PullQuery {
        pub last_sync_version: SyncVersion,
    }

    /// Rows newer than the client's cursor, grouped by entity type, plus the
    /// server's current counter value.
    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct PullResponse {
        pub current_sync_version: SyncVersion,
        pub decks: Vec<Deck>,
        pub note_types: Vec<NoteType>,
        pub note_field_types: Vec<NoteFieldType>,
        pub notes: Vec<Note>,
        pub note_field_values: Vec<NoteFieldValue>,
        pub cards: Vec<Card>,
        pub review_logs: Vec<ReviewLog>,
        pub crdt_changes: Vec<CrdtChange>,
    }

    impl PullResponse {
        pub fn row_count(&self) -> usize {
            self.decks.len()
                + self.note_types.len()
                + self.note_field_types.len()
                + self.notes.len()
                + self.note_field_values.len()
                + self.cards.len()
                + self.review_logs.len()
        }
    }
}

pub mod review {
    use crate::model::RatingId;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RatingSubmission {
        pub rating: RatingId,
        /// Defaults to the server clock when omitted.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reviewed_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub duration_ms: Option<i64>,
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: String) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        }
    }
}
