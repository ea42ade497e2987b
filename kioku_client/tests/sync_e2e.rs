//! End-to-end sync scenarios: two client replicas against the real server
//! engine, with the HTTP layer replaced by an in-process transport.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use kioku::{
    Error,
    api::sync::{apply_push, pull_changes},
    config::SyncTuning,
    model::{Card, Deck, NoteType},
    schema::sync::{PullResponse, PushRequest, PushResponse},
    testing::{create_user, memory_pool},
};
use kioku_client::{
    manager::{SyncContext, SyncManager},
    ops,
    store::LocalStore,
    transport::SyncTransport,
};
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use uuid::Uuid;

/// The server engine mounted directly behind the transport trait.
struct ServerTransport {
    pool: SqlitePool,
    user_id: Uuid,
    page_size: i64,
    push_calls: AtomicUsize,
}

impl ServerTransport {
    fn new(pool: SqlitePool, user_id: Uuid) -> Self {
        Self {
            pool,
            user_id,
            page_size: 1000,
            push_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SyncTransport for ServerTransport {
    async fn push(&self, body: &PushRequest) -> Result<PushResponse, Error> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        apply_push(&self.pool, self.user_id, body, Utc::now()).await
    }

    async fn pull(&self, last_sync_version: i64) -> Result<PullResponse, Error> {
        pull_changes(&self.pool, self.user_id, last_sync_version, self.page_size).await
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

struct Client {
    store: LocalStore,
    manager: SyncManager,
    transport: Arc<ServerTransport>,
}

async fn client(pool: &SqlitePool, user_id: Uuid) -> Client {
    let tuning = SyncTuning::default();
    let store = LocalStore::open_in_memory(user_id, tuning.clone())
        .await
        .unwrap();
    let transport = Arc::new(ServerTransport::new(pool.clone(), user_id));
    let manager = SyncManager::new(SyncContext {
        store: store.clone(),
        transport: transport.clone(),
        tuning,
    });
    Client {
        store,
        manager,
        transport,
    }
}

async fn setup() -> (SqlitePool, Client, Client) {
    let pool = memory_pool().await;
    let user = create_user(&pool, "hana").await;
    let a = client(&pool, user.id).await;
    let b = client(&pool, user.id).await;
    (pool, a, b)
}

#[tokio::test]
async fn test_fresh_deck_reaches_a_second_client() {
    let (_pool, a, b) = setup().await;
    let t0 = now();
    let deck = ops::create_deck(&a.store, "Japanese", t0).await.unwrap();
    assert_eq!(a.store.pending_count().await.unwrap(), 1);

    let outcome = a.manager.sync().await.unwrap();
    assert_eq!(outcome.pushed, 1);
    assert_eq!(a.store.pending_count().await.unwrap(), 0);
    let local: Deck = a.store.get(deck.id).await.unwrap().unwrap();
    assert_eq!(local.sync_version, 1);

    b.manager.sync().await.unwrap();
    let replicated: Deck = b.store.get(deck.id).await.unwrap().unwrap();
    assert_eq!(replicated.name, "Japanese");
    assert_eq!(replicated.sync_version, 1);
}

#[tokio::test]
async fn test_concurrent_rename_converges_on_the_later_writer() {
    let (_pool, a, b) = setup().await;
    let t0 = now();
    let deck = ops::create_deck(&a.store, "X", t0).await.unwrap();
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    // Independent renames: A at t+100ms, B at t+101ms.
    ops::rename_deck(&a.store, deck.id, "A", t0 + Duration::milliseconds(100))
        .await
        .unwrap();
    ops::rename_deck(&b.store, deck.id, "B", t0 + Duration::milliseconds(101))
        .await
        .unwrap();

    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();
    a.manager.sync().await.unwrap();

    let deck_a: Deck = a.store.get(deck.id).await.unwrap().unwrap();
    let deck_b: Deck = b.store.get(deck.id).await.unwrap().unwrap();
    assert_eq!(deck_a.name, "B");
    assert_eq!(deck_a, deck_b);
}

#[tokio::test]
async fn test_review_state_is_bit_identical_across_replicas() {
    let (_pool, a, b) = setup().await;
    let t0 = now();
    let deck = ops::create_deck(&a.store, "Japanese", t0).await.unwrap();
    let (note_type, _) = ops::create_note_type(
        &a.store,
        "Basic",
        "{{Front}}",
        "{{Back}}",
        false,
        &["Front", "Back"],
        t0,
    )
    .await
    .unwrap();
    let (_, _, cards) = ops::create_note(
        &a.store,
        deck.id,
        note_type.id,
        &[("Front", "hello"), ("Back", "world")],
        t0,
    )
    .await
    .unwrap();
    let (reviewed, _) = ops::submit_review(&a.store, cards[0].id, 3, t0 + Duration::minutes(1), 3_000)
        .await
        .unwrap();
    assert_eq!(reviewed.state, 2);
    assert_eq!(reviewed.reps, 1);

    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    let card_b: Card = b.store.get(cards[0].id).await.unwrap().unwrap();
    assert_eq!(card_b.state, reviewed.state);
    assert_eq!(card_b.stability, reviewed.stability);
    assert_eq!(card_b.difficulty, reviewed.difficulty);
    assert_eq!(card_b.due, reviewed.due);
    assert_eq!(card_b.reps, 1);
}

#[tokio::test]
async fn test_soft_deleted_note_type_blocks_new_notes_on_other_client() {
    let (_pool, a, b) = setup().await;
    let t0 = now();
    let deck = ops::create_deck(&a.store, "Japanese", t0).await.unwrap();
    let (note_type, _) = ops::create_note_type(
        &a.store,
        "Basic",
        "{{Front}}",
        "{{Back}}",
        false,
        &["Front", "Back"],
        t0,
    )
    .await
    .unwrap();
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    ops::delete_note_type(&a.store, note_type.id, t0 + Duration::seconds(1))
        .await
        .unwrap();
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    let replicated: NoteType = b.store.get(note_type.id).await.unwrap().unwrap();
    assert!(replicated.deleted_at.is_some());
    let result = ops::create_note(
        &b.store,
        deck.id,
        note_type.id,
        &[("Front", "a"), ("Back", "b")],
        t0 + Duration::seconds(2),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_offline_burst_drains_in_a_single_push() {
    let (_pool, a, b) = setup().await;
    let t0 = now();

    // A long offline session touching every entity type.
    let deck = ops::create_deck(&a.store, "Japanese", t0).await.unwrap();
    let (note_type, _) = ops::create_note_type(
        &a.store,
        "Basic",
        "{{Front}}",
        "{{Back}}",
        true,
        &["Front", "Back"],
        t0,
    )
    .await
    .unwrap();
    let mut first_card = None;
    for i in 0..10 {
        let front = format!("front {}", i);
        let back = format!("back {}", i);
        let (_, _, cards) = ops::create_note(
            &a.store,
            deck.id,
            note_type.id,
            &[("Front", front.as_str()), ("Back", back.as_str())],
            t0 + Duration::seconds(i),
        )
        .await
        .unwrap();
        first_card.get_or_insert(cards[0].clone());
    }
    ops::submit_review(
        &a.store,
        first_card.unwrap().id,
        3,
        t0 + Duration::minutes(5),
        2_000,
    )
    .await
    .unwrap();
    let pending = a.store.pending_count().await.unwrap();
    // deck + note type + 2 field types + 10 * (note + 2 values + 2 cards) + log
    assert_eq!(pending, 55);

    a.manager.sync().await.unwrap();
    assert_eq!(a.transport.push_calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.store.pending_count().await.unwrap(), 0);

    b.manager.sync().await.unwrap();
    assert_eq!(b.store.find_cards_by_deck(deck.id).await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_two_clients_converge_to_identical_state() {
    let (_pool, a, b) = setup().await;
    let t0 = now();
    let deck = ops::create_deck(&a.store, "Shared", t0).await.unwrap();
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    // Divergent edits on both sides.
    ops::rename_deck(&a.store, deck.id, "Renamed by A", t0 + Duration::seconds(1))
        .await
        .unwrap();
    let (note_type, _) = ops::create_note_type(
        &b.store,
        "Basic",
        "{{Front}}",
        "{{Back}}",
        false,
        &["Front", "Back"],
        t0 + Duration::seconds(2),
    )
    .await
    .unwrap();
    ops::create_note(
        &b.store,
        deck.id,
        note_type.id,
        &[("Front", "a"), ("Back", "b")],
        t0 + Duration::seconds(3),
    )
    .await
    .unwrap();

    // Push+pull cycles until both cursors settle.
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();
    a.manager.sync().await.unwrap();
    b.manager.sync().await.unwrap();

    assert_eq!(
        a.store.last_sync_version().await.unwrap(),
        b.store.last_sync_version().await.unwrap()
    );
    let decks_a = a.store.find_decks().await.unwrap();
    let decks_b = b.store.find_decks().await.unwrap();
    assert_eq!(decks_a, decks_b);
    let cards_a = a.store.find_cards_by_deck(deck.id).await.unwrap();
    let cards_b = b.store.find_cards_by_deck(deck.id).await.unwrap();
    assert_eq!(cards_a, cards_b);
}
