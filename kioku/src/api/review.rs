//! Server-side review pipeline: the study endpoint runs the same FSRS code
//! as the client, appends the review log and assigns fresh sync versions so
//! other replicas pick the result up on their next pull.

use super::{SERVER_REPLICA_ID, sync::next_version};
use crate::{
    CardErrorKind, Error, LibraryError, SyncErrorKind, db,
    crdt::{CrdtDocument, Stamp, document_id, entity_to_value, tracked_fields},
    model::{Card, EntityKind},
    scheduler::Fsrs,
    schema::review::RatingSubmission,
};
use chrono::{DateTime, Utc};
use log::info;
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn submit_review(
    pool: &SqlitePool,
    user_id: Uuid,
    deck_id: Uuid,
    card_id: Uuid,
    body: RatingSubmission,
    now: DateTime<Utc>,
) -> Result<Card, Error> {
    let reviewed_at = body.reviewed_at.unwrap_or(now);
    let duration_ms = body.duration_ms.unwrap_or(0);

    let mut tx = pool.begin().await.map_err(|e| Error::Sqlx { source: e })?;
    let card = db::fetch_by_id::<Card>(&mut tx, card_id)
        .await?
        .filter(|card| card.deleted_at.is_none())
        .ok_or(Error::Library(LibraryError::Card(CardErrorKind::NotFound(
            card_id,
        ))))?;
    if card.user_id != user_id {
        return Err(Error::Library(LibraryError::Sync(
            SyncErrorKind::OwnershipViolation,
        )));
    }
    if card.deck_id != deck_id {
        return Err(Error::Library(LibraryError::Card(
            CardErrorKind::DeckMismatch { card_id, deck_id },
        )));
    }

    let fsrs = Fsrs::default();
    let (mut new_card, mut review_log) = fsrs.schedule(&card, body.rating, reviewed_at, duration_ms)?;
    review_log.id = Uuid::new_v4();
    new_card.sync_version = next_version(&mut tx, user_id).await?;
    review_log.sync_version = next_version(&mut tx, user_id).await?;

    db::replace_row(&mut tx, &new_card).await?;
    db::replace_row(&mut tx, &review_log).await?;

    let stamp = Stamp::new(reviewed_at, SERVER_REPLICA_ID);
    let doc_id = document_id(EntityKind::Card, card_id);
    let mut document = match db::load_document(&mut tx, &doc_id).await? {
        Some(document) => document,
        None => CrdtDocument::from_entity(&card, &Stamp::new(card.updated_at, SERVER_REPLICA_ID))?,
    };
    document.set_fields(
        &entity_to_value(&new_card)?,
        tracked_fields(EntityKind::Card),
        &stamp,
    );
    db::save_document(&mut tx, user_id, &document, now).await?;

    tx.commit().await.map_err(|e| Error::Sqlx { source: e })?;
    info!(
        "card {} reviewed with rating {}: state {} -> {}, due {}",
        card_id, body.rating, card.state, new_card.state, new_card.due
    );
    Ok(new_card)
}
