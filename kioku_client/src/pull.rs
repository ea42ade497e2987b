//! Pull service: pages rows newer than the local cursor out of the server,
//! merges each into the replica through its CRDT document, and advances the
//! cursor. Pull writes are not local edits, so nothing is enqueued here and
//! unpushed local changes survive the merge.

use crate::store::LocalStore;
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use kioku::{
    Error, db,
    crdt::{CrdtDocument, Stamp, document_id},
    model::{SyncEntity, SyncVersion},
    schema::sync::PullResponse,
};
use log::{debug, info};
use sqlx::SqliteConnection;
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullOutcome {
    pub pulled: usize,
    pub current_sync_version: SyncVersion,
}

async fn apply_rows<T: SyncEntity>(
    conn: &mut SqliteConnection,
    user_id: uuid::Uuid,
    rows: &[T],
    documents: &HashMap<String, CrdtDocument>,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    for row in rows {
        let doc_id = document_id(T::KIND, row.id());
        let remote_doc = documents.get(&doc_id);
        let local_row: Option<T> = db::fetch_by_id(conn, row.id()).await?;
        match (local_row, remote_doc) {
            (Some(local), Some(remote_doc)) => {
                let local_doc = match db::load_document(conn, &doc_id).await? {
                    Some(doc) => doc,
                    None => CrdtDocument::from_entity(
                        &local,
                        &Stamp::new(local.updated_at(), "pre-crdt"),
                    )?,
                };
                let merged = local_doc.merge(remote_doc);
                let mut materialized: T = merged.materialize(&local)?;
                materialized.set_sync_version(row.sync_version());
                db::replace_row(conn, &materialized).await?;
                db::save_document(conn, user_id, &merged, at).await?;
            }
            (Some(local), None) => {
                // Row types without documents (review logs) or a server
                // predating them: the snapshot wins only if we have no newer
                // local knowledge.
                if local.sync_version() < row.sync_version() {
                    db::replace_row(conn, row).await?;
                }
            }
            (None, remote_doc) => {
                db::replace_row(conn, row).await?;
                if let Some(remote_doc) = remote_doc {
                    db::save_document(conn, user_id, remote_doc, at).await?;
                }
            }
        }
    }
    Ok(())
}

/// How far this page safely advanced the cursor: the smallest per-entity-type
/// maximum version. Types whose page was cut short are complete up to
/// `current_sync_version`, but a full page only proves completeness up to its
/// own last row, so the cursor must not jump past the slowest type. Rows
/// between the two get re-sent and re-merge idempotently.
fn page_progress(response: &PullResponse) -> Option<SyncVersion> {
    [
        response.decks.iter().map(|r| r.sync_version).max(),
        response.note_types.iter().map(|r| r.sync_version).max(),
        response.note_field_types.iter().map(|r| r.sync_version).max(),
        response.notes.iter().map(|r| r.sync_version).max(),
        response.note_field_values.iter().map(|r| r.sync_version).max(),
        response.cards.iter().map(|r| r.sync_version).max(),
        response.review_logs.iter().map(|r| r.sync_version).max(),
    ]
    .into_iter()
    .flatten()
    .min()
}

/// Pulls until the server's `current_sync_version` has been reached,
/// applying page after page.
pub async fn pull(store: &LocalStore, transport: &dyn SyncTransport) -> Result<PullOutcome, Error> {
    let mut outcome = PullOutcome {
        pulled: 0,
        current_sync_version: store.last_sync_version().await?,
    };
    loop {
        let response = transport.pull(outcome.current_sync_version).await?;
        let documents: HashMap<String, CrdtDocument> = response
            .crdt_changes
            .iter()
            .map(|change| {
                CrdtDocument::decode_base64(&change.binary)
                    .map(|doc| (change.document_id.clone(), doc))
            })
            .collect::<Result<_, _>>()?;

        let now = Utc::now();
        let mut conn = store.acquire().await?;
        apply_rows(&mut conn, store.user_id(), &response.decks, &documents, now).await?;
        apply_rows(&mut conn, store.user_id(), &response.note_types, &documents, now).await?;
        apply_rows(&mut conn, store.user_id(), &response.note_field_types, &documents, now)
            .await?;
        apply_rows(&mut conn, store.user_id(), &response.notes, &documents, now).await?;
        apply_rows(&mut conn, store.user_id(), &response.note_field_values, &documents, now)
            .await?;
        apply_rows(&mut conn, store.user_id(), &response.cards, &documents, now).await?;
        apply_rows(&mut conn, store.user_id(), &response.review_logs, &documents, now).await?;
        drop(conn);

        outcome.pulled += response.row_count();
        match page_progress(&response) {
            None => {
                outcome.current_sync_version = response.current_sync_version;
                break;
            }
            Some(progress) => {
                outcome.current_sync_version = progress;
                debug!("pull: page advanced cursor to {}", progress);
                if progress >= response.current_sync_version {
                    break;
                }
            }
        }
    }
    store
        .set_last_sync_version(outcome.current_sync_version, Utc::now())
        .await?;
    info!(
        "pull: {} rows applied, cursor now {}",
        outcome.pulled, outcome.current_sync_version
    );
    Ok(outcome)
}
