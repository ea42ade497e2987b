//! Push service: drains the queue into one batched payload, hands it to the
//! transport, and settles the queue from the server's answer.

use crate::{queue, store::LocalStore, transport::SyncTransport};
use kioku::{
    Error, LibraryError, SyncErrorKind, db,
    crdt::{document_id, tracked_fields},
    model::{
        Card, Deck, EntityKind, Note, NoteFieldType, NoteFieldValue, NoteType, ReviewLog,
        SyncEntity, SyncVersion,
    },
    schema::sync::{CrdtChange, PushRequest, PushResponse},
};
use log::{debug, info, warn};
use sqlx::SqliteConnection;
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PushOutcome {
    pub pushed: usize,
    pub conflicts: usize,
}

async fn add_row<T: SyncEntity>(
    conn: &mut SqliteConnection,
    entity_id: Uuid,
    rows: &mut Vec<T>,
    changes: &mut Vec<CrdtChange>,
) -> Result<bool, Error> {
    let Some(row) = db::fetch_by_id::<T>(conn, entity_id).await? else {
        return Ok(false);
    };
    if !tracked_fields(T::KIND).is_empty() {
        let doc_id = document_id(T::KIND, entity_id);
        if let Some(document) = db::load_document(conn, &doc_id).await? {
            changes.push(CrdtChange {
                document_id: doc_id,
                entity_type: T::KIND,
                entity_id,
                binary: document.encode_base64(),
            });
        }
    }
    rows.push(row);
    Ok(true)
}

async fn set_row_version(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
    version: SyncVersion,
) -> Result<(), Error> {
    let sql = format!("UPDATE {} SET sync_version = ? WHERE id = ?", kind.table());
    sqlx::query(&sql)
        .bind(version)
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
    Ok(())
}

/// Whether a push failure quarantines the rows (the server will keep
/// rejecting them until they change) or leaves them retryable.
fn is_quarantine(error: &Error) -> bool {
    matches!(
        error,
        Error::Library(LibraryError::Sync(
            SyncErrorKind::Validation(_)
                | SyncErrorKind::MissingParent(_)
                | SyncErrorKind::BadDocument(_)
        ))
    )
}

/// Drains pending changes into one push call. On success every acknowledged
/// row is marked clean and stamped with its assigned version; conflict rows
/// are left for the next pull to repair.
pub async fn push(store: &LocalStore, transport: &dyn SyncTransport) -> Result<PushOutcome, Error> {
    let mut conn = store.acquire().await?;
    let pending = queue::get_pending_changes(&mut conn).await?;
    if pending.is_empty() {
        debug!("push: queue empty, nothing to do");
        return Ok(PushOutcome::default());
    }

    let mut body = PushRequest::default();
    let mut in_flight = Vec::new();
    for entry in pending {
        let found = match entry.entity_type {
            EntityKind::Deck => {
                add_row::<Deck>(&mut conn, entry.entity_id, &mut body.decks, &mut body.crdt_changes)
                    .await?
            }
            EntityKind::NoteType => {
                add_row::<NoteType>(
                    &mut conn,
                    entry.entity_id,
                    &mut body.note_types,
                    &mut body.crdt_changes,
                )
                .await?
            }
            EntityKind::NoteFieldType => {
                add_row::<NoteFieldType>(
                    &mut conn,
                    entry.entity_id,
                    &mut body.note_field_types,
                    &mut body.crdt_changes,
                )
                .await?
            }
            EntityKind::Note => {
                add_row::<Note>(&mut conn, entry.entity_id, &mut body.notes, &mut body.crdt_changes)
                    .await?
            }
            EntityKind::NoteFieldValue => {
                add_row::<NoteFieldValue>(
                    &mut conn,
                    entry.entity_id,
                    &mut body.note_field_values,
                    &mut body.crdt_changes,
                )
                .await?
            }
            EntityKind::Card => {
                add_row::<Card>(&mut conn, entry.entity_id, &mut body.cards, &mut body.crdt_changes)
                    .await?
            }
            EntityKind::ReviewLog => {
                add_row::<ReviewLog>(
                    &mut conn,
                    entry.entity_id,
                    &mut body.review_logs,
                    &mut body.crdt_changes,
                )
                .await?
            }
        };
        if found {
            in_flight.push(entry);
        } else {
            // Nothing to send for this entry and nothing the server could
            // fix; quarantine it so only a fresh local edit revives it.
            warn!(
                "queued {} {} has no row; quarantining the queue entry",
                entry.entity_type, entry.entity_id
            );
            queue::mark_failed(
                &mut conn,
                entry.entity_type,
                entry.entity_id,
                "local row missing",
                true,
            )
            .await?;
        }
    }
    if in_flight.is_empty() {
        return Ok(PushOutcome::default());
    }

    queue::mark_in_flight(&mut conn, &in_flight).await?;
    match transport.push(&body).await {
        Ok(response) => {
            let outcome = settle(&mut conn, &response).await?;
            info!(
                "push: {} rows acknowledged, {} conflicts",
                outcome.pushed, outcome.conflicts
            );
            Ok(outcome)
        }
        Err(error) => {
            let quarantine = is_quarantine(&error);
            let message = format!("{}", error);
            for entry in &in_flight {
                queue::mark_failed(
                    &mut conn,
                    entry.entity_type,
                    entry.entity_id,
                    &message,
                    quarantine,
                )
                .await?;
            }
            Err(error)
        }
    }
}

async fn settle(
    conn: &mut SqliteConnection,
    response: &PushResponse,
) -> Result<PushOutcome, Error> {
    let mut outcome = PushOutcome::default();
    for kind in kioku::model::PUSH_ORDER {
        for assignment in response.of(kind) {
            set_row_version(conn, kind, assignment.id, assignment.sync_version).await?;
            queue::mark_synced(conn, kind, assignment.id).await?;
            outcome.pushed += 1;
        }
        for conflict_id in response.conflicts.of(kind) {
            // The server kept its row; the next pull materializes it here.
            queue::mark_synced(conn, kind, *conflict_id).await?;
            outcome.conflicts += 1;
        }
    }
    Ok(outcome)
}
