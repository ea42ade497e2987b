//! Local mutations. Every operation here writes the replica, maintains the
//! row's CRDT document, and marks the row dirty in the sync queue, all inside
//! one transaction. The UI layer only ever calls these; it never touches the
//! tables directly.

use crate::{queue, store::LocalStore};
use chrono::{DateTime, Utc};
use kioku::{
    CardErrorKind, DeckErrorKind, Error, LibraryError, NoteErrorKind, NoteTypeErrorKind, db,
    crdt::{CrdtDocument, Stamp, document_id, entity_to_value, tracked_fields},
    generator,
    model::{
        Card, Deck, EntityKind, Note, NoteFieldType, NoteFieldValue, NoteType, ReviewLog,
        SyncEntity,
    },
    scheduler::Fsrs,
};
use sqlx::SqliteConnection;
use uuid::Uuid;

async fn upsert_document<T: SyncEntity>(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    entity: &T,
    changed: &[&str],
    stamp: &Stamp,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    let doc_id = document_id(T::KIND, entity.id());
    let mut document = match db::load_document(conn, &doc_id).await? {
        Some(document) => document,
        None => CrdtDocument::new(T::KIND, entity.id()),
    };
    document.set_fields(&entity_to_value(entity)?, changed, stamp);
    if let Some(deleted_at) = entity.deleted_at() {
        document.set_tombstone(deleted_at, stamp);
    }
    db::save_document(conn, user_id, &document, at).await
}

/// Writes a row, refreshes its document and enqueues it, as one local write.
async fn write_row<T: SyncEntity>(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    entity: &T,
    changed: &[&str],
    stamp: &Stamp,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    db::replace_row(conn, entity).await?;
    upsert_document(conn, user_id, entity, changed, stamp, at).await?;
    queue::enqueue(conn, T::KIND, entity.id(), at).await
}

pub async fn create_deck(store: &LocalStore, name: &str, at: DateTime<Utc>) -> Result<Deck, Error> {
    if store.find_deck_by_name(name).await?.is_some() {
        return Err(Error::Library(LibraryError::Deck(
            DeckErrorKind::DuplicateName(name.to_string()),
        )));
    }
    let deck = Deck {
        id: Uuid::new_v4(),
        user_id: store.user_id(),
        name: name.to_string(),
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &deck, tracked_fields(EntityKind::Deck), &stamp, at).await?;
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(deck)
}

pub async fn rename_deck(
    store: &LocalStore,
    deck_id: Uuid,
    name: &str,
    at: DateTime<Utc>,
) -> Result<Deck, Error> {
    let mut deck = store
        .get::<Deck>(deck_id)
        .await?
        .filter(|deck| deck.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Deck(DeckErrorKind::NotFound(
            deck_id,
        ))))?;
    if let Some(existing) = store.find_deck_by_name(name).await? {
        if existing.id != deck_id {
            return Err(Error::Library(LibraryError::Deck(
                DeckErrorKind::DuplicateName(name.to_string()),
            )));
        }
    }
    deck.name = name.to_string();
    deck.updated_at = at;
    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &deck, &["name", "updatedAt"], &stamp, at).await?;
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(deck)
}

pub async fn delete_deck(store: &LocalStore, deck_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
    let mut deck = store
        .get::<Deck>(deck_id)
        .await?
        .filter(|deck| deck.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Deck(DeckErrorKind::NotFound(
            deck_id,
        ))))?;
    deck.deleted_at = Some(at);
    deck.updated_at = at;
    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &deck, &["updatedAt"], &stamp, at).await?;
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

pub async fn create_note_type(
    store: &LocalStore,
    name: &str,
    front_template: &str,
    back_template: &str,
    is_reversible: bool,
    field_names: &[&str],
    at: DateTime<Utc>,
) -> Result<(NoteType, Vec<NoteFieldType>), Error> {
    let mut seen = std::collections::HashSet::new();
    for field_name in field_names {
        if !seen.insert(*field_name) {
            return Err(Error::Library(LibraryError::NoteType(
                NoteTypeErrorKind::DuplicateField {
                    name: (*field_name).to_string(),
                },
            )));
        }
    }
    let note_type = NoteType {
        id: Uuid::new_v4(),
        user_id: store.user_id(),
        name: name.to_string(),
        front_template: front_template.to_string(),
        back_template: back_template.to_string(),
        is_reversible,
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let field_types: Vec<NoteFieldType> = field_names
        .iter()
        .enumerate()
        .map(|(i, field_name)| NoteFieldType {
            id: Uuid::new_v4(),
            user_id: store.user_id(),
            note_type_id: note_type.id,
            name: (*field_name).to_string(),
            ord: i as i64,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            sync_version: 0,
        })
        .collect();

    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(
        &mut tx,
        store.user_id(),
        &note_type,
        tracked_fields(EntityKind::NoteType),
        &stamp,
        at,
    )
    .await?;
    for field_type in &field_types {
        write_row(
            &mut tx,
            store.user_id(),
            field_type,
            tracked_fields(EntityKind::NoteFieldType),
            &stamp,
            at,
        )
        .await?;
    }
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok((note_type, field_types))
}

pub async fn delete_note_type(
    store: &LocalStore,
    note_type_id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    let mut note_type = store
        .get::<NoteType>(note_type_id)
        .await?
        .filter(|note_type| note_type.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::NoteType(
            NoteTypeErrorKind::NotFound(note_type_id),
        )))?;
    if !store.find_notes_by_note_type(note_type_id).await?.is_empty() {
        return Err(Error::Library(LibraryError::NoteType(
            NoteTypeErrorKind::HasNotes(note_type_id),
        )));
    }
    note_type.deleted_at = Some(at);
    note_type.updated_at = at;
    let field_types = store.find_field_types(note_type_id).await?;
    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &note_type, &["updatedAt"], &stamp, at).await?;
    for field_type in field_types {
        let mut deleted = field_type;
        deleted.deleted_at = Some(at);
        deleted.updated_at = at;
        write_row(&mut tx, store.user_id(), &deleted, &["updatedAt"], &stamp, at).await?;
    }
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Creates a note with its field values and generated cards in one shot.
/// `values` pairs field names with their content.
pub async fn create_note(
    store: &LocalStore,
    deck_id: Uuid,
    note_type_id: Uuid,
    values: &[(&str, &str)],
    at: DateTime<Utc>,
) -> Result<(Note, Vec<NoteFieldValue>, Vec<Card>), Error> {
    store
        .get::<Deck>(deck_id)
        .await?
        .filter(|deck| deck.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Deck(DeckErrorKind::NotFound(
            deck_id,
        ))))?;
    let note_type = store
        .get::<NoteType>(note_type_id)
        .await?
        .filter(|note_type| note_type.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::NoteType(
            NoteTypeErrorKind::NotFound(note_type_id),
        )))?;
    let field_types = store.find_field_types(note_type_id).await?;

    let note = Note {
        id: Uuid::new_v4(),
        user_id: store.user_id(),
        deck_id,
        note_type_id,
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let mut field_values = Vec::new();
    for (name, value) in values {
        let field_type = field_types
            .iter()
            .find(|field_type| field_type.name == *name)
            .ok_or_else(|| {
                Error::Library(LibraryError::Note(NoteErrorKind::UnknownField {
                    name: (*name).to_string(),
                }))
            })?;
        field_values.push(NoteFieldValue {
            id: Uuid::new_v4(),
            user_id: store.user_id(),
            note_id: note.id,
            note_field_type_id: field_type.id,
            value: (*value).to_string(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
            sync_version: 0,
        });
    }
    let cards = generator::generate_cards(&note, &note_type, &field_types, &field_values, at)?;

    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &note, tracked_fields(EntityKind::Note), &stamp, at)
        .await?;
    for value in &field_values {
        write_row(
            &mut tx,
            store.user_id(),
            value,
            tracked_fields(EntityKind::NoteFieldValue),
            &stamp,
            at,
        )
        .await?;
    }
    for card in &cards {
        write_row(&mut tx, store.user_id(), card, tracked_fields(EntityKind::Card), &stamp, at)
            .await?;
    }
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok((note, field_values, cards))
}

/// Updates one field value and recomputes the affected cards' faces. Card
/// ids and scheduling state survive; only `front`/`back` change.
pub async fn update_note_field(
    store: &LocalStore,
    note_id: Uuid,
    field_name: &str,
    value: &str,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    let mut note = store
        .get::<Note>(note_id)
        .await?
        .filter(|note| note.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Note(NoteErrorKind::NotFound(
            note_id,
        ))))?;
    let note_type = store
        .get::<NoteType>(note.note_type_id)
        .await?
        .ok_or(Error::Library(LibraryError::NoteType(
            NoteTypeErrorKind::NotFound(note.note_type_id),
        )))?;
    let field_types = store.find_field_types(note.note_type_id).await?;
    let field_type = field_types
        .iter()
        .find(|field_type| field_type.name == field_name)
        .ok_or_else(|| {
            Error::Library(LibraryError::Note(NoteErrorKind::UnknownField {
                name: field_name.to_string(),
            }))
        })?;
    let mut field_values = store.find_field_values(note_id).await?;
    let field_value = field_values
        .iter_mut()
        .find(|field_value| field_value.note_field_type_id == field_type.id)
        .ok_or_else(|| {
            Error::Library(LibraryError::Note(NoteErrorKind::MissingFieldValue {
                name: field_name.to_string(),
            }))
        })?;
    field_value.value = value.to_string();
    field_value.updated_at = at;
    let updated_value = field_value.clone();

    let cards = store.find_cards_by_note(note_id).await?;
    let refreshed = generator::refresh_cards(&cards, &note_type, &field_types, &field_values, at)?;
    note.updated_at = at;

    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(
        &mut tx,
        store.user_id(),
        &updated_value,
        &["value", "updatedAt"],
        &stamp,
        at,
    )
    .await?;
    write_row(&mut tx, store.user_id(), &note, &["updatedAt"], &stamp, at).await?;
    for card in &refreshed {
        write_row(
            &mut tx,
            store.user_id(),
            card,
            &["front", "back", "updatedAt"],
            &stamp,
            at,
        )
        .await?;
    }
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Soft-deletes a note together with its field values and generated cards.
pub async fn delete_note(store: &LocalStore, note_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
    let mut note = store
        .get::<Note>(note_id)
        .await?
        .filter(|note| note.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Note(NoteErrorKind::NotFound(
            note_id,
        ))))?;
    note.deleted_at = Some(at);
    note.updated_at = at;
    let field_values = store.find_field_values(note_id).await?;
    let cards = store.find_cards_by_note(note_id).await?;

    let stamp = Stamp::new(at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(&mut tx, store.user_id(), &note, &["updatedAt"], &stamp, at).await?;
    for value in field_values {
        let mut deleted = value;
        deleted.deleted_at = Some(at);
        deleted.updated_at = at;
        write_row(&mut tx, store.user_id(), &deleted, &["updatedAt"], &stamp, at).await?;
    }
    for card in cards {
        let mut deleted = card;
        deleted.deleted_at = Some(at);
        deleted.updated_at = at;
        write_row(&mut tx, store.user_id(), &deleted, &["updatedAt"], &stamp, at).await?;
    }
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Runs FSRS locally, appends the review log, and queues both rows. The same
/// scheduler code runs server-side, so replicas agree bit for bit.
pub async fn submit_review(
    store: &LocalStore,
    card_id: Uuid,
    rating: u32,
    reviewed_at: DateTime<Utc>,
    duration_ms: i64,
) -> Result<(Card, ReviewLog), Error> {
    let card = store
        .get::<Card>(card_id)
        .await?
        .filter(|card| card.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Card(CardErrorKind::NotFound(
            card_id,
        ))))?;
    let fsrs = Fsrs::default();
    let (new_card, mut review_log) = fsrs.schedule(&card, rating, reviewed_at, duration_ms)?;
    review_log.id = Uuid::new_v4();

    let stamp = Stamp::new(reviewed_at, store.replica_id());
    let mut tx = store.begin().await?;
    write_row(
        &mut tx,
        store.user_id(),
        &new_card,
        tracked_fields(EntityKind::Card),
        &stamp,
        reviewed_at,
    )
    .await?;
    // Review logs have no document; the row itself is the change.
    db::replace_row(&mut tx, &review_log).await?;
    queue::enqueue(&mut tx, EntityKind::ReviewLog, review_log.id, reviewed_at).await?;
    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    Ok((new_card, review_log))
}
