//! Sync manager: the state machine that composes push and pull. It owns the
//! online/offline flag, enforces at-most-one-in-flight by handing concurrent
//! callers the same shared future, retries with exponential backoff, and
//! publishes status and events for the UI.

use crate::{
    pull::{self, PullOutcome},
    push::{self, PushOutcome},
    queue,
    status::{SyncEvent, SyncSnapshot, SyncStatus},
    store::LocalStore,
    transport::SyncTransport,
};
use futures::{FutureExt, future::BoxFuture, future::Shared};
use kioku::{Error, LibraryError, SyncErrorKind, config::SyncTuning};
use log::{info, warn};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Everything the manager needs, passed in explicitly so tests can inject a
/// stub transport and an in-memory store.
pub struct SyncContext {
    pub store: LocalStore,
    pub transport: Arc<dyn SyncTransport>,
    pub tuning: SyncTuning,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncOutcome, Arc<Error>>>>;

/// Exponential retry schedule; grows on failure, resets on success.
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
    deferred_until: Option<Instant>,
    tuning: SyncTuning,
}

impl Backoff {
    pub(crate) fn new(tuning: &SyncTuning) -> Self {
        Self {
            delay: Duration::from_millis(tuning.initial_backoff_ms),
            deferred_until: None,
            tuning: tuning.clone(),
        }
    }

    pub(crate) fn after_failure(&mut self, now: Instant) {
        self.deferred_until = Some(now + self.delay);
        let next = self.delay.as_millis() as u64 * u64::from(self.tuning.backoff_multiplier);
        self.delay = Duration::from_millis(next.min(self.tuning.max_backoff_ms));
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Duration::from_millis(self.tuning.initial_backoff_ms);
        self.deferred_until = None;
    }

    pub(crate) fn deferred(&self, now: Instant) -> bool {
        self.deferred_until.is_some_and(|until| now < until)
    }
}

struct Inner {
    ctx: SyncContext,
    online: AtomicBool,
    auth_paused: AtomicBool,
    status_tx: watch::Sender<SyncSnapshot>,
    events_tx: broadcast::Sender<SyncEvent>,
    in_flight: tokio::sync::Mutex<Option<SharedSync>>,
    backoff: Mutex<Backoff>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(ctx: SyncContext) -> Self {
        let backoff = Backoff::new(&ctx.tuning);
        let (status_tx, _) = watch::channel(SyncSnapshot::initial());
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                ctx,
                online: AtomicBool::new(true),
                auth_paused: AtomicBool::new(false),
                status_tx,
                events_tx,
                in_flight: tokio::sync::Mutex::new(None),
                backoff: Mutex::new(backoff),
            }),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Network state change from the host platform.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online == was_online {
            return;
        }
        if online {
            let _ = self.inner.events_tx.send(SyncEvent::Online);
            let has_pending = self.inner.ctx.store.has_pending().await.unwrap_or(false);
            if has_pending {
                let manager = self.clone();
                tokio::spawn(async move {
                    let _ = manager.sync().await;
                });
            } else {
                self.publish(SyncStatus::Idle, None).await;
            }
        } else {
            let _ = self.inner.events_tx.send(SyncEvent::Offline);
            self.publish(SyncStatus::Offline, None).await;
        }
    }

    /// The external auth collaborator refreshed credentials; failed rows get
    /// retried on the next tick.
    pub fn credentials_refreshed(&self) {
        self.inner.auth_paused.store(false, Ordering::SeqCst);
    }

    /// Runs push then pull. Callers arriving while a sync is in flight are
    /// handed the in-flight future; nothing ever runs twice concurrently.
    pub async fn sync(&self) -> Result<SyncOutcome, Arc<Error>> {
        let shared = {
            let mut guard = self.inner.in_flight.lock().await;
            match guard.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let inner = self.inner.clone();
                    let fut: SharedSync = run_sync(inner).boxed().shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };
        let result = shared.clone().await;
        let mut guard = self.inner.in_flight.lock().await;
        if guard.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
            *guard = None;
        }
        result
    }

    /// Spawns the periodic tick loop. The returned handle lives as long as
    /// the app; aborting it stops background syncs without touching state.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                manager.inner.ctx.tuning.tick_interval_ms,
            ));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.on_tick().await;
            }
        })
    }

    async fn on_tick(&self) {
        if !self.is_online() || self.inner.auth_paused.load(Ordering::SeqCst) {
            return;
        }
        let backoff_deferred = {
            let backoff = self.inner.backoff.lock().unwrap();
            backoff.deferred(Instant::now())
        };
        if backoff_deferred {
            return;
        }
        let _ = self.sync().await;
    }

    async fn publish(&self, status: SyncStatus, last_error: Option<String>) {
        let pending_count = self.inner.ctx.store.pending_count().await.unwrap_or(0);
        let last_sync_at = self.inner.ctx.store.last_sync_at().await.unwrap_or(None);
        let _ = self.inner.status_tx.send(SyncSnapshot {
            status,
            pending_count,
            last_sync_at,
            last_error,
        });
    }
}

async fn run_sync(inner: Arc<Inner>) -> Result<SyncOutcome, Arc<Error>> {
    let manager = SyncManager {
        inner: inner.clone(),
    };
    if !manager.is_online() {
        manager.publish(SyncStatus::Offline, None).await;
        return Err(Arc::new(Error::Library(LibraryError::Sync(
            SyncErrorKind::Transient("offline".to_string()),
        ))));
    }

    let _ = inner.events_tx.send(SyncEvent::SyncStart);
    manager.publish(SyncStatus::Syncing, None).await;

    // Retry tick: give previously failed rows another chance.
    let result = async {
        {
            let mut conn = inner.ctx.store.acquire().await?;
            queue::repend_failed(&mut conn).await?;
        }
        let PushOutcome { pushed, conflicts } =
            push::push(&inner.ctx.store, inner.ctx.transport.as_ref()).await?;
        let PullOutcome { pulled, .. } =
            pull::pull(&inner.ctx.store, inner.ctx.transport.as_ref()).await?;
        Ok::<_, Error>(SyncOutcome {
            pushed,
            pulled,
            conflicts,
        })
    }
    .await;

    match result {
        Ok(outcome) => {
            {
                let mut backoff = inner.backoff.lock().unwrap();
                backoff.reset();
            }
            let _ = inner.events_tx.send(SyncEvent::SyncComplete {
                pushed: outcome.pushed,
                pulled: outcome.pulled,
            });
            manager.publish(SyncStatus::Idle, None).await;
            info!(
                "sync complete: {} pushed, {} pulled, {} conflicts",
                outcome.pushed, outcome.pulled, outcome.conflicts
            );
            Ok(outcome)
        }
        Err(error) => {
            if matches!(
                error,
                Error::Library(LibraryError::Sync(SyncErrorKind::Unauthorized))
            ) {
                // Pause until the auth collaborator refreshes credentials;
                // the queue is retained.
                inner.auth_paused.store(true, Ordering::SeqCst);
            }
            {
                let mut backoff = inner.backoff.lock().unwrap();
                backoff.after_failure(Instant::now());
            }
            let reason = format!("{}", error);
            warn!("sync failed: {}", reason);
            let _ = inner.events_tx.send(SyncEvent::SyncError {
                reason: reason.clone(),
            });
            manager.publish(SyncStatus::Error, Some(reason)).await;
            Err(Arc::new(error))
        }
    }
}
