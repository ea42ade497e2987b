pub mod api;
pub mod config;
pub mod crdt;
pub mod db;
pub mod generator;
pub mod model;
pub mod scheduler;
pub mod schema;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use miette::Diagnostic;
use model::{RatingId, StateId};
use thiserror::Error;

/// Embedded migrations for the authoritative store.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Sqlx Error: {source}")]
    Sqlx { source: sqlx::Error },
    #[error("Io Error: {description}, {source}")]
    Io {
        description: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Library(#[from] LibraryError),
}

// Note that `LibraryError` is `Clone` while `Error` is not.
#[derive(Clone, Debug, Diagnostic, Error)]
pub enum LibraryError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Deck(#[from] DeckErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    NoteType(#[from] NoteTypeErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Note(#[from] NoteErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Card(#[from] CardErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncErrorKind),
    #[error("{0}")]
    InvalidConfig(String),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum SchedulerErrorKind {
    #[error("Invalid state. Received `{0}`.")]
    InvalidState(StateId),
    #[error("Invalid rating. Received `{0}`.")]
    InvalidRating(RatingId),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum DeckErrorKind {
    #[error("No deck with id `{0}` was found.")]
    NotFound(uuid::Uuid),
    #[error("A deck named `{0}` already exists.")]
    DuplicateName(String),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum NoteTypeErrorKind {
    #[error("No note type with id `{0}` was found.")]
    NotFound(uuid::Uuid),
    #[error("Note type `{0}` still has notes and cannot be deleted.")]
    HasNotes(uuid::Uuid),
    #[error("Field `{name}` is declared more than once.")]
    DuplicateField { name: String },
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum NoteErrorKind {
    #[error("No note with id `{0}` was found.")]
    NotFound(uuid::Uuid),
    #[error("No value provided for field `{name}`.")]
    MissingFieldValue { name: String },
    #[error("Field `{name}` does not belong to the note's type.")]
    UnknownField { name: String },
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum CardErrorKind {
    #[error("No card with id `{0}` was found.")]
    NotFound(uuid::Uuid),
    #[error("Card `{card_id}` does not belong to deck `{deck_id}`.")]
    DeckMismatch {
        card_id: uuid::Uuid,
        deck_id: uuid::Uuid,
    },
}

/// Failure classes of the sync pipeline. The pipeline itself never bubbles
/// these out of a sync run; they end up recorded on queue rows and in the
/// status read model.
#[derive(Clone, Debug, Diagnostic, Error)]
pub enum SyncErrorKind {
    #[error("Transport failure: {0}")]
    Transient(String),
    #[error("Authentication rejected; sync paused until credentials refresh.")]
    Unauthorized,
    #[error("Server rejected the batch: {0}")]
    Validation(String),
    #[error("Row references a missing parent: {0}")]
    MissingParent(String),
    #[error("Rows are owned by another user.")]
    OwnershipViolation,
    #[error("Malformed sync document: {0}")]
    BadDocument(String),
}
