//! Read models the UI layer observes. The manager publishes [`SyncSnapshot`]
//! through a `watch` channel and [`SyncEvent`]s through a `broadcast`; the
//! study counts come straight from the replica.

use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use kioku::{Error, model::NEW_CARD_STATE};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Offline,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub pending_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncSnapshot {
    pub fn initial() -> Self {
        Self {
            status: SyncStatus::Idle,
            pending_count: 0,
            last_sync_at: None,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    Online,
    Offline,
    SyncStart,
    SyncComplete { pushed: usize, pulled: usize },
    SyncError { reason: String },
}

/// What the study screen shows next to each deck.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StudyCounts {
    pub due_now: i64,
    pub new_available: i64,
}

impl LocalStore {
    pub async fn study_counts(&self, now: DateTime<Utc>) -> Result<StudyCounts, Error> {
        let (due_now,): (i64,) = sqlx::query_as(
            r"SELECT COUNT(*) FROM card
              WHERE deleted_at IS NULL AND state != ? AND due <= ?",
        )
        .bind(NEW_CARD_STATE)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        let (new_available,): (i64,) = sqlx::query_as(
            r"SELECT COUNT(*) FROM card WHERE deleted_at IS NULL AND state = ?",
        )
        .bind(NEW_CARD_STATE)
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Sqlx { source: e })?;
        Ok(StudyCounts {
            due_now,
            new_available: new_available.min(self.tuning().new_cards_per_day),
        })
    }
}
