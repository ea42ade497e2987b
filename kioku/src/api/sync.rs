//! Authoritative sync engine: applies pushed batches row by row inside one
//! transaction and serves incremental pulls. Field values converge through
//! CRDT merge; the server only owns `sync_version` assignment.

use super::SERVER_REPLICA_ID;
use crate::{
    Error, LibraryError, SyncErrorKind, db,
    crdt::{CrdtDocument, Stamp, document_id, tracked_fields},
    generator,
    model::{
        Card, Deck, EntityKind, Note, NoteFieldType, NoteFieldValue, NoteType, ReviewLog,
        SyncEntity, SyncVersion,
    },
    scheduler::Fsrs,
    schema::sync::{CrdtChange, PullResponse, PushRequest, PushResponse, VersionAssignment},
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{info, warn};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Bumps and returns the user's version counter. Concurrent pushes from the
/// same user serialize on this row.
pub(crate) async fn next_version(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<SyncVersion, Error> {
    let (version,): (SyncVersion,) = sqlx::query_as(
        r"INSERT INTO sync_counter (user_id, version) VALUES (?, 1)
          ON CONFLICT (user_id) DO UPDATE SET version = version + 1
          RETURNING version",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| Error::Sqlx { source: e })?;
    Ok(version)
}

pub async fn current_version(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<SyncVersion, Error> {
    let version: Option<(SyncVersion,)> =
        sqlx::query_as(r"SELECT version FROM sync_counter WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Error::Sqlx { source: e })?;
    Ok(version.map_or(0, |(v,)| v))
}

fn validate_ownership(body: &PushRequest, user_id: Uuid) -> Result<(), Error> {
    let owned = body.decks.iter().all(|r| r.user_id == user_id)
        && body.note_types.iter().all(|r| r.user_id == user_id)
        && body.note_field_types.iter().all(|r| r.user_id == user_id)
        && body.notes.iter().all(|r| r.user_id == user_id)
        && body.note_field_values.iter().all(|r| r.user_id == user_id)
        && body.cards.iter().all(|r| r.user_id == user_id)
        && body.review_logs.iter().all(|r| r.user_id == user_id);
    if owned {
        Ok(())
    } else {
        Err(Error::Library(LibraryError::Sync(
            SyncErrorKind::OwnershipViolation,
        )))
    }
}

async fn parent_exists(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: Uuid,
    batch_ids: &HashSet<(EntityKind, Uuid)>,
) -> Result<bool, Error> {
    if batch_ids.contains(&(kind, id)) {
        return Ok(true);
    }
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
    let found = sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    Ok(found.is_some())
}

/// Every child row must reference a parent that is either already stored or
/// part of the same batch; otherwise the whole batch is rejected.
async fn validate_parents(conn: &mut SqliteConnection, body: &PushRequest) -> Result<(), Error> {
    let mut batch_ids = HashSet::new();
    batch_ids.extend(body.decks.iter().map(|r| (EntityKind::Deck, r.id)));
    batch_ids.extend(body.note_types.iter().map(|r| (EntityKind::NoteType, r.id)));
    batch_ids.extend(
        body.note_field_types
            .iter()
            .map(|r| (EntityKind::NoteFieldType, r.id)),
    );
    batch_ids.extend(body.notes.iter().map(|r| (EntityKind::Note, r.id)));
    batch_ids.extend(body.cards.iter().map(|r| (EntityKind::Card, r.id)));

    let mut references = Vec::new();
    for row in &body.note_field_types {
        references.push((EntityKind::NoteType, row.note_type_id, row.id));
    }
    for row in &body.notes {
        references.push((EntityKind::Deck, row.deck_id, row.id));
        references.push((EntityKind::NoteType, row.note_type_id, row.id));
    }
    for row in &body.note_field_values {
        references.push((EntityKind::Note, row.note_id, row.id));
        references.push((EntityKind::NoteFieldType, row.note_field_type_id, row.id));
    }
    for row in &body.cards {
        references.push((EntityKind::Note, row.note_id, row.id));
        references.push((EntityKind::Deck, row.deck_id, row.id));
    }
    for row in &body.review_logs {
        references.push((EntityKind::Card, row.card_id, row.id));
    }
    for (parent_kind, parent_id, child_id) in references {
        if !parent_exists(conn, parent_kind, parent_id, &batch_ids).await? {
            return Err(Error::Library(LibraryError::Sync(
                SyncErrorKind::MissingParent(format!(
                    "row {} references missing {} {}",
                    child_id, parent_kind, parent_id
                )),
            )));
        }
    }
    Ok(())
}

fn decode_documents(changes: &[CrdtChange]) -> Result<HashMap<String, CrdtDocument>, Error> {
    let mut documents = HashMap::new();
    for change in changes {
        let document = CrdtDocument::decode_base64(&change.binary)?;
        if document.entity_id != change.entity_id || document.entity_type != change.entity_type {
            return Err(Error::Library(LibraryError::Sync(
                SyncErrorKind::BadDocument(format!(
                    "document {} does not match its envelope",
                    change.document_id
                )),
            )));
        }
        documents.insert(change.document_id.clone(), document);
    }
    Ok(documents)
}

/// Falls back to a synthetic document when a row predates CRDT tracking:
/// every tracked field stamped with the row's own `updated_at`.
fn document_or_snapshot<T: SyncEntity>(
    existing: Option<CrdtDocument>,
    row: &T,
    replica_id: &str,
) -> Result<CrdtDocument, Error> {
    match existing {
        Some(doc) => Ok(doc),
        None => CrdtDocument::from_entity(row, &Stamp::new(row.updated_at(), replica_id)),
    }
}

async fn apply_rows<T: SyncEntity>(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    rows: &[T],
    documents: &HashMap<String, CrdtDocument>,
    response: &mut PushResponse,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    for row in rows {
        let doc_id = document_id(T::KIND, row.id());
        let client_doc = documents.get(&doc_id);
        let server_row: Option<T> = db::fetch_by_id(conn, row.id()).await?;
        match server_row {
            None => {
                let version = next_version(conn, user_id).await?;
                let mut inserted = row.clone();
                inserted.set_sync_version(version);
                db::replace_row(conn, &inserted).await?;
                let document = document_or_snapshot(client_doc.cloned(), row, SERVER_REPLICA_ID)?;
                db::save_document(conn, user_id, &document, now).await?;
                response.of_mut(T::KIND).push(VersionAssignment {
                    id: row.id(),
                    sync_version: version,
                });
            }
            Some(server_row) => {
                if let Some(client_doc) = client_doc {
                    let server_doc = document_or_snapshot(
                        db::load_document(conn, &doc_id).await?,
                        &server_row,
                        SERVER_REPLICA_ID,
                    )?;
                    let merged = server_doc.merge(client_doc);
                    if merged == server_doc {
                        // Re-delivery or stale echo; nothing to write.
                        response.of_mut(T::KIND).push(VersionAssignment {
                            id: row.id(),
                            sync_version: server_row.sync_version(),
                        });
                        continue;
                    }
                    let mut materialized: T = merged.materialize(&server_row)?;
                    let version = next_version(conn, user_id).await?;
                    materialized.set_sync_version(version);
                    db::replace_row(conn, &materialized).await?;
                    db::save_document(conn, user_id, &merged, now).await?;
                    response.of_mut(T::KIND).push(VersionAssignment {
                        id: row.id(),
                        sync_version: version,
                    });
                } else if server_row.updated_at() > row.updated_at() {
                    // Legacy client without a CRDT binary lost the race; the
                    // server row stands and the client re-reads it on pull.
                    response.conflicts.of_mut(T::KIND).push(row.id());
                } else if server_row.updated_at() == row.updated_at() {
                    // Same write re-delivered.
                    response.of_mut(T::KIND).push(VersionAssignment {
                        id: row.id(),
                        sync_version: server_row.sync_version(),
                    });
                } else {
                    let version = next_version(conn, user_id).await?;
                    let mut replaced = row.clone();
                    replaced.set_sync_version(version);
                    db::replace_row(conn, &replaced).await?;
                    let document =
                        CrdtDocument::from_entity(row, &Stamp::new(row.updated_at(), "legacy"))?;
                    db::save_document(conn, user_id, &document, now).await?;
                    response.of_mut(T::KIND).push(VersionAssignment {
                        id: row.id(),
                        sync_version: version,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Review logs are an append-only set: install unknown ids, acknowledge known
/// ones with their existing version.
async fn apply_review_logs(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    rows: &[ReviewLog],
    response: &mut PushResponse,
) -> Result<(), Error> {
    for row in rows {
        let existing: Option<ReviewLog> = db::fetch_by_id(conn, row.id).await?;
        let version = match existing {
            Some(existing) => existing.sync_version,
            None => {
                let version = next_version(conn, user_id).await?;
                let mut inserted = row.clone();
                inserted.sync_version = version;
                db::replace_row(conn, &inserted).await?;
                version
            }
        };
        response
            .of_mut(EntityKind::ReviewLog)
            .push(VersionAssignment {
                id: row.id,
                sync_version: version,
            });
    }
    Ok(())
}

/// Regenerates each pushed note's cards and reconciles them with what the
/// client pushed. The generator output is authoritative for `front`/`back`;
/// omitted cards are installed server-side.
async fn reconcile_generated_cards(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    body: &PushRequest,
    response: &mut PushResponse,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    for note_row in &body.notes {
        let Some(note) = db::fetch_by_id::<Note>(conn, note_row.id).await? else {
            continue;
        };
        if note.deleted_at.is_some() {
            continue;
        }
        let Some(note_type) = db::fetch_by_id::<NoteType>(conn, note.note_type_id).await? else {
            continue;
        };
        let field_types: Vec<NoteFieldType> = sqlx::query_as(
            r"SELECT * FROM note_field_type WHERE note_type_id = ? AND deleted_at IS NULL ORDER BY ord ASC",
        )
        .bind(note.note_type_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        let field_values: Vec<NoteFieldValue> = sqlx::query_as(
            r"SELECT * FROM note_field_value WHERE note_id = ? AND deleted_at IS NULL",
        )
        .bind(note.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        let faces = match generator::render_faces(&note_type, &field_types, &field_values) {
            Ok(faces) => faces,
            Err(e) => {
                warn!(
                    "note {} cannot be regenerated, skipping agreement check: {}",
                    note.id, e
                );
                continue;
            }
        };

        let cards: Vec<Card> =
            sqlx::query_as(r"SELECT * FROM card WHERE note_id = ? AND deleted_at IS NULL")
                .bind(note.id)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| Error::Sqlx { source: e })?;
        for (i, face) in faces.iter().enumerate() {
            let is_reversed = i == 1;
            match cards.iter().find(|c| c.is_reversed == is_reversed) {
                None => {
                    warn!(
                        "note {} arrived without its {} card; generating server-side",
                        note.id,
                        if is_reversed { "reversed" } else { "normal" }
                    );
                    let mut card = Card::new(
                        user_id,
                        note.id,
                        note.deck_id,
                        face.front.clone(),
                        face.back.clone(),
                        is_reversed,
                        now,
                    );
                    card.sync_version = next_version(conn, user_id).await?;
                    db::replace_row(conn, &card).await?;
                    let document =
                        CrdtDocument::from_entity(&card, &Stamp::new(now, SERVER_REPLICA_ID))?;
                    db::save_document(conn, user_id, &document, now).await?;
                    response.of_mut(EntityKind::Card).push(VersionAssignment {
                        id: card.id,
                        sync_version: card.sync_version,
                    });
                }
                Some(card) if card.front != face.front || card.back != face.back => {
                    warn!(
                        "note {}: card {} disagrees with regenerated faces; regeneration wins",
                        note.id, card.id
                    );
                    let mut fixed = card.clone();
                    fixed.front = face.front.clone();
                    fixed.back = face.back.clone();
                    fixed.updated_at = now;
                    fixed.sync_version = next_version(conn, user_id).await?;
                    db::replace_row(conn, &fixed).await?;
                    let doc_id = document_id(EntityKind::Card, fixed.id);
                    let mut document = document_or_snapshot(
                        db::load_document(conn, &doc_id).await?,
                        &fixed,
                        SERVER_REPLICA_ID,
                    )?;
                    document.set_fields(
                        &crate::crdt::entity_to_value(&fixed)?,
                        &["front", "back", "updatedAt"],
                        &Stamp::new(now, SERVER_REPLICA_ID),
                    );
                    db::save_document(conn, user_id, &document, now).await?;
                    response.of_mut(EntityKind::Card).push(VersionAssignment {
                        id: fixed.id,
                        sync_version: fixed.sync_version,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Re-runs the scheduler over each pushed review log, starting from the card
/// state the server held before this batch. Divergence from the client's
/// pushed card state is a scheduler bug: it is logged and the server's
/// computation wins.
async fn reconcile_reviews(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    review_logs: &[ReviewLog],
    cards_before: &HashMap<Uuid, Card>,
    now: DateTime<Utc>,
    response: &mut PushResponse,
) -> Result<(), Error> {
    let fsrs = Fsrs::default();
    let logs_by_card = review_logs
        .iter()
        .map(|log| (log.card_id, log))
        .into_group_map();
    for (card_id, mut logs) in logs_by_card {
        let Some(before) = cards_before.get(&card_id) else {
            // Card is new to the server in this batch; its pushed state
            // already includes these reviews and there is no prior state to
            // replay from.
            continue;
        };
        logs.sort_by_key(|log| log.reviewed_at);
        let mut expected = before.clone();
        let mut ok = true;
        for log in &logs {
            match fsrs.schedule(&expected, log.rating, log.reviewed_at, log.duration_ms) {
                Ok((next, _)) => expected = next,
                Err(e) => {
                    warn!("review log {} cannot be replayed: {}", log.id, e);
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let Some(current) = db::fetch_by_id::<Card>(conn, card_id).await? else {
            continue;
        };
        let diverged = current.state != expected.state
            || current.due != expected.due
            || (current.stability - expected.stability).abs() > 1e-9
            || (current.difficulty - expected.difficulty).abs() > 1e-9
            || current.reps != expected.reps
            || current.lapses != expected.lapses;
        if diverged {
            warn!(
                "card {} diverged from the server's FSRS replay; server state wins",
                card_id
            );
            let mut fixed = expected;
            fixed.updated_at = now;
            fixed.sync_version = next_version(conn, user_id).await?;
            db::replace_row(conn, &fixed).await?;
            let doc_id = document_id(EntityKind::Card, card_id);
            let mut document = document_or_snapshot(
                db::load_document(conn, &doc_id).await?,
                &fixed,
                SERVER_REPLICA_ID,
            )?;
            document.set_fields(
                &crate::crdt::entity_to_value(&fixed)?,
                tracked_fields(EntityKind::Card),
                &Stamp::new(now, SERVER_REPLICA_ID),
            );
            db::save_document(conn, user_id, &document, now).await?;
            response.of_mut(EntityKind::Card).push(VersionAssignment {
                id: card_id,
                sync_version: fixed.sync_version,
            });
        }
    }
    Ok(())
}

/// Applies one pushed batch inside a single transaction and returns the
/// per-row version assignments plus the legacy conflict list.
pub async fn apply_push(
    pool: &SqlitePool,
    user_id: Uuid,
    body: &PushRequest,
    now: DateTime<Utc>,
) -> Result<PushResponse, Error> {
    validate_ownership(body, user_id)?;
    let documents = decode_documents(&body.crdt_changes)?;

    let mut tx = pool.begin().await.map_err(|e| Error::Sqlx { source: e })?;
    validate_parents(&mut tx, body).await?;

    // Card states before the batch, for the FSRS replay below.
    let mut cards_before = HashMap::new();
    for log in &body.review_logs {
        if let Some(card) = db::fetch_by_id::<Card>(&mut tx, log.card_id).await? {
            cards_before.entry(log.card_id).or_insert(card);
        }
    }

    let mut response = PushResponse::default();
    apply_rows(&mut tx, user_id, &body.decks, &documents, &mut response, now).await?;
    apply_rows(&mut tx, user_id, &body.note_types, &documents, &mut response, now).await?;
    apply_rows(&mut tx, user_id, &body.note_field_types, &documents, &mut response, now).await?;
    apply_rows(&mut tx, user_id, &body.notes, &documents, &mut response, now).await?;
    apply_rows(&mut tx, user_id, &body.note_field_values, &documents, &mut response, now).await?;
    apply_rows(&mut tx, user_id, &body.cards, &documents, &mut response, now).await?;
    apply_review_logs(&mut tx, user_id, &body.review_logs, &mut response).await?;

    reconcile_generated_cards(&mut tx, user_id, body, &mut response, now).await?;
    reconcile_reviews(&mut tx, user_id, &body.review_logs, &cards_before, now, &mut response)
        .await?;

    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    info!(
        "applied push for user {}: {} rows, {} conflicts",
        user_id,
        body.row_count(),
        response.conflicts.len()
    );
    Ok(response)
}

async fn attach_documents<T: SyncEntity>(
    conn: &mut SqliteConnection,
    rows: &[T],
    changes: &mut Vec<CrdtChange>,
) -> Result<(), Error> {
    if tracked_fields(T::KIND).is_empty() {
        return Ok(());
    }
    for row in rows {
        let doc_id = document_id(T::KIND, row.id());
        let document =
            document_or_snapshot(db::load_document(conn, &doc_id).await?, row, SERVER_REPLICA_ID)?;
        changes.push(CrdtChange {
            document_id: doc_id,
            entity_type: T::KIND,
            entity_id: row.id(),
            binary: document.encode_base64(),
        });
    }
    Ok(())
}

/// Serves one pull page: all rows with `sync_version > last_sync_version`,
/// at most `page_size` per entity type, plus their documents. Clients re-call
/// until the reported `current_sync_version` stops moving.
pub async fn pull_changes(
    pool: &SqlitePool,
    user_id: Uuid,
    last_sync_version: SyncVersion,
    page_size: i64,
) -> Result<PullResponse, Error> {
    let mut conn = pool.acquire().await.map_err(|e| Error::Sqlx { source: e })?;
    let mut response = PullResponse {
        current_sync_version: current_version(&mut conn, user_id).await?,
        ..PullResponse::default()
    };
    response.decks = db::rows_since::<Deck>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.note_types =
        db::rows_since::<NoteType>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.note_field_types =
        db::rows_since::<NoteFieldType>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.notes = db::rows_since::<Note>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.note_field_values =
        db::rows_since::<NoteFieldValue>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.cards = db::rows_since::<Card>(&mut conn, user_id, last_sync_version, page_size).await?;
    response.review_logs =
        db::rows_since::<ReviewLog>(&mut conn, user_id, last_sync_version, page_size).await?;

    let mut changes = Vec::new();
    attach_documents(&mut conn, &response.decks, &mut changes).await?;
    attach_documents(&mut conn, &response.note_types, &mut changes).await?;
    attach_documents(&mut conn, &response.note_field_types, &mut changes).await?;
    attach_documents(&mut conn, &response.notes, &mut changes).await?;
    attach_documents(&mut conn, &response.note_field_values, &mut changes).await?;
    attach_documents(&mut conn, &response.cards, &mut changes).await?;
    response.crdt_changes = changes;
    Ok(response)
}
