use crate::{
    api::{review::submit_review, sync::{apply_push, pull_changes}},
    crdt::{CrdtDocument, Stamp, tracked_fields},
    model::{Deck, EntityKind, Note, NoteFieldType, NoteFieldValue, NoteType, SyncEntity, User},
    scheduler::DEFAULT_WEIGHTS,
    schema::{
        review::RatingSubmission,
        sync::{CrdtChange, PushRequest},
    },
    testing::{create_user, memory_pool},
};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    // Millisecond precision keeps equality stable across store round trips.
    Utc::now().trunc_subsecs(3)
}

fn deck(user: &User, name: &str, at: DateTime<Utc>) -> Deck {
    Deck {
        id: Uuid::new_v4(),
        user_id: user.id,
        name: name.to_string(),
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    }
}

fn basic_note_type(user: &User, reversible: bool, at: DateTime<Utc>) -> (NoteType, Vec<NoteFieldType>) {
    let note_type = NoteType {
        id: Uuid::new_v4(),
        user_id: user.id,
        name: "Basic".to_string(),
        front_template: "{{Front}}".to_string(),
        back_template: "{{Back}}".to_string(),
        is_reversible: reversible,
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let field_types = ["Front", "Back"]
        .iter()
        .enumerate()
        .map(|(i, name)| NoteFieldType {
            id: Uuid::new_v4(),
            user_id: user.id,
            note_type_id: note_type.id,
            name: (*name).to_string(),
            ord: i as i64,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            sync_version: 0,
        })
        .collect();
    (note_type, field_types)
}

fn note_with_values(
    user: &User,
    deck: &Deck,
    note_type: &NoteType,
    field_types: &[NoteFieldType],
    values: &[&str],
    at: DateTime<Utc>,
) -> (Note, Vec<NoteFieldValue>) {
    let note = Note {
        id: Uuid::new_v4(),
        user_id: user.id,
        deck_id: deck.id,
        note_type_id: note_type.id,
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let field_values = field_types
        .iter()
        .zip(values)
        .map(|(field_type, value)| NoteFieldValue {
            id: Uuid::new_v4(),
            user_id: user.id,
            note_id: note.id,
            note_field_type_id: field_type.id,
            value: (*value).to_string(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
            sync_version: 0,
        })
        .collect();
    (note, field_values)
}

fn change_for<T: SyncEntity>(entity: &T, replica_id: &str) -> CrdtChange {
    let document =
        CrdtDocument::from_entity(entity, &Stamp::new(entity.updated_at(), replica_id)).unwrap();
    CrdtChange {
        document_id: document.document_id(),
        entity_type: T::KIND,
        entity_id: entity.id(),
        binary: document.encode_base64(),
    }
}

async fn setup() -> (SqlitePool, User) {
    let pool = memory_pool().await;
    let user = create_user(&pool, "hana").await;
    (pool, user)
}

#[tokio::test]
async fn test_push_assigns_strictly_monotonic_versions() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_a = deck(&user, "Japanese", at);
    let deck_b = deck(&user, "Kanji", at);
    let body = PushRequest {
        decks: vec![deck_a.clone(), deck_b.clone()],
        crdt_changes: vec![change_for(&deck_a, "r1"), change_for(&deck_b, "r1")],
        ..PushRequest::default()
    };
    let response = apply_push(&pool, user.id, &body, at).await.unwrap();
    let versions: Vec<i64> = response.decks.iter().map(|a| a.sync_version).collect();
    assert_eq!(versions, vec![1, 2]);
    assert!(response.conflicts.is_empty());

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.current_sync_version, 2);
    assert_eq!(pulled.decks.len(), 2);
    assert_eq!(pulled.crdt_changes.len(), 2);
}

#[tokio::test]
async fn test_push_is_idempotent() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Japanese", at);
    let body = PushRequest {
        decks: vec![deck_row.clone()],
        crdt_changes: vec![change_for(&deck_row, "r1")],
        ..PushRequest::default()
    };
    let first = apply_push(&pool, user.id, &body, at).await.unwrap();
    let second = apply_push(&pool, user.id, &body, at).await.unwrap();
    assert_eq!(first.decks, second.decks);

    // The counter did not move on the no-op push.
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.current_sync_version, 1);
}

#[tokio::test]
async fn test_concurrent_rename_highest_stamp_wins() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "X", at);
    let seed = PushRequest {
        decks: vec![deck_row.clone()],
        crdt_changes: vec![change_for(&deck_row, "r1")],
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &seed, at).await.unwrap();

    // Replica A renames at t+100ms, replica B at t+101ms.
    let mut renamed_a = deck_row.clone();
    renamed_a.name = "A".to_string();
    renamed_a.updated_at = at + Duration::milliseconds(100);
    let mut renamed_b = deck_row.clone();
    renamed_b.name = "B".to_string();
    renamed_b.updated_at = at + Duration::milliseconds(101);

    let push_a = PushRequest {
        decks: vec![renamed_a.clone()],
        crdt_changes: vec![change_for(&renamed_a, "replica-a")],
        ..PushRequest::default()
    };
    let push_b = PushRequest {
        decks: vec![renamed_b.clone()],
        crdt_changes: vec![change_for(&renamed_b, "replica-b")],
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &push_a, at).await.unwrap();
    apply_push(&pool, user.id, &push_b, at).await.unwrap();

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.decks[0].name, "B");

    // Re-delivering A's older write cannot roll the name back.
    apply_push(&pool, user.id, &push_a, at).await.unwrap();
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.decks[0].name, "B");
}

#[tokio::test]
async fn test_legacy_push_without_binary_conflicts_when_server_is_newer() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Server", at);
    let seed = PushRequest {
        decks: vec![deck_row.clone()],
        crdt_changes: vec![change_for(&deck_row, "r1")],
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &seed, at).await.unwrap();

    let mut stale = deck_row.clone();
    stale.name = "Stale".to_string();
    stale.updated_at = at - Duration::seconds(10);
    let legacy = PushRequest {
        decks: vec![stale.clone()],
        ..PushRequest::default()
    };
    let response = apply_push(&pool, user.id, &legacy, at).await.unwrap();
    assert_eq!(response.conflicts.decks, vec![stale.id]);
    assert!(response.decks.is_empty());

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.decks[0].name, "Server");
}

#[tokio::test]
async fn test_pull_pages_are_bounded_and_resumable() {
    let (pool, user) = setup().await;
    let at = now();
    let decks: Vec<Deck> = (0..5).map(|i| deck(&user, &format!("Deck {}", i), at)).collect();
    let body = PushRequest {
        decks: decks.clone(),
        crdt_changes: decks.iter().map(|d| change_for(d, "r1")).collect(),
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();

    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let page = pull_changes(&pool, user.id, cursor, 2).await.unwrap();
        if page.decks.is_empty() {
            break;
        }
        assert!(page.decks.len() <= 2);
        cursor = page.decks.iter().map(|d| d.sync_version).max().unwrap();
        seen.extend(page.decks);
    }
    assert_eq!(seen.len(), 5);
    // Versions are strictly monotonic and never reused.
    let versions: Vec<i64> = seen.iter().map(|d| d.sync_version).collect();
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_soft_delete_propagates_through_pull() {
    let (pool, user) = setup().await;
    let at = now();
    let (note_type, field_types) = basic_note_type(&user, false, at);
    let body = PushRequest {
        note_types: vec![note_type.clone()],
        note_field_types: field_types.clone(),
        crdt_changes: std::iter::once(change_for(&note_type, "r1"))
            .chain(field_types.iter().map(|f| change_for(f, "r1")))
            .collect(),
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();

    let deleted_at = at + Duration::seconds(5);
    let mut document =
        CrdtDocument::from_entity(&note_type, &Stamp::new(note_type.updated_at, "r1")).unwrap();
    document.set_tombstone(deleted_at, &Stamp::new(deleted_at, "r1"));
    let mut tombstoned = note_type.clone();
    tombstoned.deleted_at = Some(deleted_at);
    tombstoned.updated_at = deleted_at;
    let body = PushRequest {
        note_types: vec![tombstoned],
        crdt_changes: vec![CrdtChange {
            document_id: document.document_id(),
            entity_type: EntityKind::NoteType,
            entity_id: note_type.id,
            binary: document.encode_base64(),
        }],
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    let pulled_note_type = pulled
        .note_types
        .iter()
        .find(|nt| nt.id == note_type.id)
        .unwrap();
    assert_eq!(pulled_note_type.deleted_at, Some(deleted_at));
}

#[tokio::test]
async fn test_server_generates_cards_the_client_omitted() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Japanese", at);
    let (note_type, field_types) = basic_note_type(&user, true, at);
    let (note, field_values) =
        note_with_values(&user, &deck_row, &note_type, &field_types, &["hello", "world"], at);

    let mut changes = vec![change_for(&deck_row, "r1"), change_for(&note_type, "r1")];
    changes.extend(field_types.iter().map(|f| change_for(f, "r1")));
    changes.push(change_for(&note, "r1"));
    changes.extend(field_values.iter().map(|v| change_for(v, "r1")));
    let body = PushRequest {
        decks: vec![deck_row],
        note_types: vec![note_type],
        note_field_types: field_types,
        notes: vec![note.clone()],
        note_field_values: field_values,
        crdt_changes: changes,
        ..PushRequest::default()
    };
    let response = apply_push(&pool, user.id, &body, at).await.unwrap();
    assert_eq!(response.cards.len(), 2);

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.cards.len(), 2);
    let normal = pulled.cards.iter().find(|c| !c.is_reversed).unwrap();
    let reversed = pulled.cards.iter().find(|c| c.is_reversed).unwrap();
    assert_eq!((normal.front.as_str(), normal.back.as_str()), ("hello", "world"));
    assert_eq!((reversed.front.as_str(), reversed.back.as_str()), ("world", "hello"));
    assert_eq!(normal.note_id, note.id);
}

#[tokio::test]
async fn test_submit_review_runs_fsrs_and_appends_log() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Japanese", at);
    let (note_type, field_types) = basic_note_type(&user, false, at);
    let (note, field_values) =
        note_with_values(&user, &deck_row, &note_type, &field_types, &["hello", "world"], at);
    let mut changes = vec![change_for(&deck_row, "r1"), change_for(&note_type, "r1")];
    changes.extend(field_types.iter().map(|f| change_for(f, "r1")));
    changes.push(change_for(&note, "r1"));
    changes.extend(field_values.iter().map(|v| change_for(v, "r1")));
    let body = PushRequest {
        decks: vec![deck_row.clone()],
        note_types: vec![note_type],
        note_field_types: field_types,
        notes: vec![note],
        note_field_values: field_values,
        crdt_changes: changes,
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    let card = pulled.cards[0].clone();

    let reviewed_at = at + Duration::minutes(1);
    let updated = submit_review(
        &pool,
        user.id,
        deck_row.id,
        card.id,
        RatingSubmission {
            rating: 3,
            reviewed_at: Some(reviewed_at),
            duration_ms: Some(4_200),
        },
        reviewed_at,
    )
    .await
    .unwrap();
    assert_eq!(updated.state, 2);
    assert_eq!(updated.stability, DEFAULT_WEIGHTS[2]);
    assert_eq!(updated.difficulty, DEFAULT_WEIGHTS[4]);
    assert_eq!(updated.reps, 1);
    assert_eq!(updated.lapses, 0);
    assert_eq!(updated.due, reviewed_at + Duration::days(updated.scheduled_days));
    assert!(updated.sync_version > card.sync_version);

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert_eq!(pulled.review_logs.len(), 1);
    assert_eq!(pulled.review_logs[0].card_id, card.id);
    assert_eq!(pulled.review_logs[0].rating, 3);
    assert_eq!(pulled.review_logs[0].previous_state, 0);
}

#[tokio::test]
async fn test_review_for_wrong_deck_is_rejected() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Japanese", at);
    let (note_type, field_types) = basic_note_type(&user, false, at);
    let (note, field_values) =
        note_with_values(&user, &deck_row, &note_type, &field_types, &["a", "b"], at);
    let mut changes = vec![change_for(&deck_row, "r1"), change_for(&note_type, "r1")];
    changes.extend(field_types.iter().map(|f| change_for(f, "r1")));
    changes.push(change_for(&note, "r1"));
    changes.extend(field_values.iter().map(|v| change_for(v, "r1")));
    let body = PushRequest {
        decks: vec![deck_row],
        note_types: vec![note_type],
        note_field_types: field_types,
        notes: vec![note],
        note_field_values: field_values,
        crdt_changes: changes,
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    let card = pulled.cards[0].clone();

    let result = submit_review(
        &pool,
        user.id,
        Uuid::new_v4(),
        card.id,
        RatingSubmission {
            rating: 3,
            reviewed_at: None,
            duration_ms: None,
        },
        at,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_fsrs_divergence_is_corrected_server_side() {
    let (pool, user) = setup().await;
    let at = now();
    let deck_row = deck(&user, "Japanese", at);
    let (note_type, field_types) = basic_note_type(&user, false, at);
    let (note, field_values) =
        note_with_values(&user, &deck_row, &note_type, &field_types, &["a", "b"], at);
    let mut changes = vec![change_for(&deck_row, "r1"), change_for(&note_type, "r1")];
    changes.extend(field_types.iter().map(|f| change_for(f, "r1")));
    changes.push(change_for(&note, "r1"));
    changes.extend(field_values.iter().map(|v| change_for(v, "r1")));
    let body = PushRequest {
        decks: vec![deck_row],
        note_types: vec![note_type],
        note_field_types: field_types,
        notes: vec![note],
        note_field_values: field_values,
        crdt_changes: changes,
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, at).await.unwrap();
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    let card = pulled.cards[0].clone();

    // A buggy client claims absurd scheduling results for a Good review.
    let reviewed_at = at + Duration::minutes(2);
    let fsrs = crate::scheduler::Fsrs::default();
    let (good_card, mut log) = fsrs.schedule(&card, 3, reviewed_at, 1_000).unwrap();
    log.id = Uuid::new_v4();
    let mut tampered = good_card.clone();
    tampered.stability = 9_999.0;
    tampered.due = reviewed_at + Duration::days(9_999);
    tampered.updated_at = reviewed_at;
    let mut document =
        CrdtDocument::decode_base64(&pulled.crdt_changes.iter().find(|c| c.entity_id == card.id).unwrap().binary)
            .unwrap();
    document.set_fields(
        &crate::crdt::entity_to_value(&tampered).unwrap(),
        tracked_fields(EntityKind::Card),
        &Stamp::new(reviewed_at, "buggy-client"),
    );
    let body = PushRequest {
        cards: vec![tampered],
        review_logs: vec![log],
        crdt_changes: vec![CrdtChange {
            document_id: document.document_id(),
            entity_type: EntityKind::Card,
            entity_id: card.id,
            binary: document.encode_base64(),
        }],
        ..PushRequest::default()
    };
    apply_push(&pool, user.id, &body, reviewed_at).await.unwrap();

    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    let corrected = pulled.cards.iter().find(|c| c.id == card.id).unwrap();
    assert_eq!(corrected.stability, good_card.stability);
    assert_eq!(corrected.due, good_card.due);
    assert_eq!(corrected.state, good_card.state);
}

#[tokio::test]
async fn test_foreign_rows_reject_the_whole_batch() {
    let (pool, user) = setup().await;
    let stranger = create_user(&pool, "mallory").await;
    let at = now();
    let mine = deck(&user, "Mine", at);
    let theirs = deck(&stranger, "Theirs", at);
    let body = PushRequest {
        decks: vec![mine.clone(), theirs],
        ..PushRequest::default()
    };
    assert!(apply_push(&pool, user.id, &body, at).await.is_err());

    // Nothing from the batch landed.
    let pulled = pull_changes(&pool, user.id, 0, 1000).await.unwrap();
    assert!(pulled.decks.is_empty());
}

#[tokio::test]
async fn test_missing_parent_rejects_the_whole_batch() {
    let (pool, user) = setup().await;
    let at = now();
    let (note_type, field_types) = basic_note_type(&user, false, at);
    let orphan_value = NoteFieldValue {
        id: Uuid::new_v4(),
        user_id: user.id,
        note_id: Uuid::new_v4(), // never pushed
        note_field_type_id: field_types[0].id,
        value: "orphan".to_string(),
        created_at: at,
        updated_at: at,
        deleted_at: None,
        sync_version: 0,
    };
    let body = PushRequest {
        note_types: vec![note_type],
        note_field_types: field_types,
        note_field_values: vec![orphan_value],
        ..PushRequest::default()
    };
    assert!(apply_push(&pool, user.id, &body, at).await.is_err());
}
