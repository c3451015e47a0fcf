//! The reconciliation engine: merge authority for one feed's cache.
//!
//! All inbound events funnel through one serialized actor: page fetch
//! results, optimistic mutation effects, mutation confirmations and
//! rollbacks, and live feed events. The actor exclusively owns the paged
//! cache, the pending mutation ledger and the connection state; every cache
//! mutation happens synchronously inside one loop iteration.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, error_span, info, trace, warn, Instrument};

use crate::{
    cache::{Page, PagedCache},
    feed::{ConnectionState, FeedActor, FeedEvent, FeedNotice, ToFeedActor},
    ledger::{MutationKind, PendingLedger, PendingMutation, PendingStatus, Rollback},
    metrics::Metrics,
    record::{timestamp_now, FeedKey, Record, RecordId},
    remote::{Authority, FetchedPage, LiveFeed},
};

/// Capacity of the channel for [`ToEngineActor`] messages.
const ACTOR_CHANNEL_CAP: usize = 64;
/// Capacity for the channels for [`Engine::subscribe`].
const SUBSCRIBE_CHANNEL_CAP: usize = 256;
/// Capacity of the channel carrying feed notices into the engine.
const FEED_NOTICE_CAP: usize = 1024;
/// Default number of records per fetched page.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Error returned from page fetches.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The fetch failed. The cache is unchanged and the call may be retried.
    #[error("page fetch failed: {0}")]
    Failed(anyhow::Error),
    /// A newer fetch for the same slot superseded this one.
    #[error("superseded by a newer fetch")]
    Superseded,
    /// The engine was shut down.
    #[error("engine shut down")]
    Shutdown,
}

/// Error returned from optimistic applies, before any remote call is made.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyError {
    /// A mutation for the same target id is already in flight.
    #[error("a mutation for this target is already in flight")]
    InFlight,
    /// The target record is not cached.
    #[error("record not found")]
    NotFound,
    /// The engine was shut down.
    #[error("engine shut down")]
    Shutdown,
}

/// Events informing subscribers about cache and connection changes.
///
/// Emitted synchronously after each reconciliation step; presentation layers
/// can render the payload without any dedupe or ordering logic of their own.
#[derive(Debug, Clone, strum::Display)]
pub enum LiveEvent {
    /// The cache changed. The payload is the new snapshot, ascending by
    /// `created_at`.
    Records(Vec<Record>),
    /// The connection state changed.
    Connection(ConnectionState),
}

/// Options for spawning an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of records requested per page fetch.
    pub page_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Messages to the engine actor.
#[derive(derive_more::Debug, strum::Display)]
enum ToEngineActor {
    FetchFirst {
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), FetchError>>,
    },
    FetchOlder {
        #[debug("reply")]
        reply: oneshot::Sender<Result<bool, FetchError>>,
    },
    ApplyCreate {
        record: Record,
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), ApplyError>>,
    },
    ApplyEdit {
        id: RecordId,
        content: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), ApplyError>>,
    },
    ApplyDelete {
        id: RecordId,
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), ApplyError>>,
    },
    ConfirmCreate {
        tentative: RecordId,
        record: Record,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    ConfirmUpdate {
        id: RecordId,
        record: Record,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    ConfirmDelete {
        id: RecordId,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    Rollback {
        target: RecordId,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        #[debug("sender")]
        sender: flume::Sender<LiveEvent>,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    Records {
        #[debug("reply")]
        reply: oneshot::Sender<Vec<Record>>,
    },
    GetConnection {
        #[debug("reply")]
        reply: oneshot::Sender<ConnectionState>,
    },
    Pending {
        #[debug("reply")]
        reply: oneshot::Sender<Vec<PendingStatus>>,
    },
    HasOlder {
        #[debug("reply")]
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the reconciliation engine for one feed key.
///
/// The handle is cheaply cloneable; methods send messages into the actor
/// task. Dropping the last handle aborts the actor; prefer awaiting
/// [`Engine::shutdown`], which tears down the live subscription before
/// returning, so that a new engine for another feed key can be opened without
/// cross-feed event leakage.
#[derive(derive_more::Debug, Clone)]
pub struct Engine {
    /// The feed this engine reconciles.
    pub feed: FeedKey,
    to_actor: mpsc::Sender<ToEngineActor>,
    metrics: Arc<Metrics>,
    #[debug("AbortOnDropHandle")]
    _actor_handle: Arc<AbortOnDropHandle<()>>,
}

impl Engine {
    /// Spawn a reconciliation engine and its feed adapter for one feed key.
    pub fn spawn<A, L>(feed: FeedKey, authority: Arc<A>, live: Arc<L>, opts: EngineOptions) -> Self
    where
        A: Authority,
        L: LiveFeed,
    {
        let metrics = Arc::new(Metrics::default());
        let (to_actor, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let (notices_tx, notices_rx) = flume::bounded(FEED_NOTICE_CAP);
        let (to_feed, feed_inbox) = mpsc::channel(4);

        let feed_actor = FeedActor::new(feed, live, feed_inbox, notices_tx);
        let feed_handle = AbortOnDropHandle::new(tokio::task::spawn(
            async move {
                if let Err(err) = feed_actor.run().await {
                    error!("feed actor failed: {err:?}");
                }
            }
            .instrument(error_span!("feed", feed = %feed.fmt_short())),
        ));

        let actor = EngineActor {
            feed,
            authority,
            inbox,
            notices: notices_rx,
            to_feed,
            _feed_handle: feed_handle,
            cache: PagedCache::new(),
            ledger: PendingLedger::default(),
            state: CacheState::Empty,
            connection: ConnectionState::Connected,
            page_limit: opts.page_limit,
            subscribers: Subscribers::default(),
            fetch_tasks: JoinSet::new(),
            next_fetch_id: 0,
            pending_first: None,
            pending_older: None,
            metrics: metrics.clone(),
        };
        let actor_handle = AbortOnDropHandle::new(tokio::task::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!("engine actor failed: {err:?}");
                }
            }
            .instrument(error_span!("engine", feed = %feed.fmt_short())),
        ));

        Self {
            feed,
            to_actor,
            metrics,
            _actor_handle: Arc::new(actor_handle),
        }
    }

    /// Fetches the first page and replaces the cache's newest page with it.
    pub async fn load(&self) -> Result<(), FetchError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToEngineActor::FetchFirst { reply })
            .await
            .map_err(|_| FetchError::Shutdown)?;
        rx.await.map_err(|_| FetchError::Shutdown)?
    }

    /// Fetches the next older page and appends it to the cache.
    ///
    /// Returns `Ok(false)` without fetching when no older page exists. A
    /// newer call supersedes an outstanding one, which then resolves to
    /// [`FetchError::Superseded`].
    pub async fn fetch_older(&self) -> Result<bool, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToEngineActor::FetchOlder { reply })
            .await
            .map_err(|_| FetchError::Shutdown)?;
        rx.await.map_err(|_| FetchError::Shutdown)?
    }

    /// Whether an older page can be fetched.
    pub async fn has_older(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::HasOlder { reply }).await?;
        Ok(rx.await?)
    }

    /// A read-only snapshot of the cached records, ascending by `created_at`.
    pub async fn records(&self) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::Records { reply }).await?;
        Ok(rx.await?)
    }

    /// The current connection state.
    pub async fn connection(&self) -> Result<ConnectionState> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::GetConnection { reply }).await?;
        Ok(rx.await?)
    }

    /// Statuses of in-flight mutations, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::Pending { reply }).await?;
        Ok(rx.await?)
    }

    /// Subscribes to cache and connection changes.
    pub async fn subscribe(&self) -> Result<flume::Receiver<LiveEvent>> {
        let (sender, receiver) = flume::bounded(SUBSCRIBE_CHANNEL_CAP);
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::Subscribe { sender, reply }).await?;
        rx.await?;
        Ok(receiver)
    }

    /// Engine metrics.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Shuts the engine down.
    ///
    /// The live subscription is fully cancelled before this returns.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::Shutdown { reply }).await?;
        rx.await?;
        Ok(())
    }

    pub(crate) async fn apply_create(&self, record: Record) -> Result<(), ApplyError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToEngineActor::ApplyCreate { record, reply })
            .await
            .map_err(|_| ApplyError::Shutdown)?;
        rx.await.map_err(|_| ApplyError::Shutdown)?
    }

    pub(crate) async fn apply_edit(&self, id: RecordId, content: String) -> Result<(), ApplyError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToEngineActor::ApplyEdit { id, content, reply })
            .await
            .map_err(|_| ApplyError::Shutdown)?;
        rx.await.map_err(|_| ApplyError::Shutdown)?
    }

    pub(crate) async fn apply_delete(&self, id: RecordId) -> Result<(), ApplyError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToEngineActor::ApplyDelete { id, reply })
            .await
            .map_err(|_| ApplyError::Shutdown)?;
        rx.await.map_err(|_| ApplyError::Shutdown)?
    }

    pub(crate) async fn confirm_create(&self, tentative: RecordId, record: Record) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::ConfirmCreate {
            tentative,
            record,
            reply,
        })
        .await?;
        Ok(rx.await?)
    }

    pub(crate) async fn confirm_update(&self, id: RecordId, record: Record) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::ConfirmUpdate { id, record, reply })
            .await?;
        Ok(rx.await?)
    }

    pub(crate) async fn confirm_delete(&self, id: RecordId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::ConfirmDelete { id, reply }).await?;
        Ok(rx.await?)
    }

    pub(crate) async fn rollback(&self, target: RecordId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToEngineActor::Rollback { target, reply }).await?;
        Ok(rx.await?)
    }

    async fn send(&self, msg: ToEngineActor) -> Result<()> {
        self.to_actor
            .send(msg)
            .await
            .context("sending to engine actor failed")?;
        Ok(())
    }
}

/// Cache lifecycle for the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum CacheState {
    Empty,
    Loaded,
    Resyncing,
}

type FetchRes = Result<FetchedPage>;

#[derive(Debug)]
struct FetchDone {
    id: u64,
    slot: FetchSlot,
    res: FetchRes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchSlot {
    First,
    Older,
}

#[derive(derive_more::Debug)]
struct PendingFirst {
    id: u64,
    #[debug("reply")]
    reply: Option<oneshot::Sender<Result<(), FetchError>>>,
    resync: bool,
}

#[derive(derive_more::Debug)]
struct PendingOlder {
    id: u64,
    #[debug("reply")]
    reply: oneshot::Sender<Result<bool, FetchError>>,
}

struct EngineActor<A> {
    feed: FeedKey,
    authority: Arc<A>,
    /// Receiver for actor messages.
    inbox: mpsc::Receiver<ToEngineActor>,
    /// Normalized events and connection transitions from the feed actor.
    notices: flume::Receiver<FeedNotice>,
    to_feed: mpsc::Sender<ToFeedActor>,
    _feed_handle: AbortOnDropHandle<()>,

    cache: PagedCache,
    ledger: PendingLedger,
    state: CacheState,
    connection: ConnectionState,
    page_limit: usize,

    /// Subscribers to cache and connection changes.
    subscribers: Subscribers,

    /// Running page fetches.
    fetch_tasks: JoinSet<FetchDone>,
    next_fetch_id: u64,
    pending_first: Option<PendingFirst>,
    pending_older: Option<PendingOlder>,

    metrics: Arc<Metrics>,
}

impl<A: Authority> EngineActor<A> {
    async fn run(mut self) -> Result<()> {
        let shutdown_reply = self.run_inner().await;
        if let Err(err) = self.shutdown().await {
            error!(?err, "error during shutdown");
        }
        match shutdown_reply {
            Ok(reply) => {
                reply.send(()).ok();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_inner(&mut self) -> Result<oneshot::Sender<()>> {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick wait");
            self.metrics.actor_tick_main.inc();
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("to_actor closed")?;
                    trace!(%msg, ?i, "tick: to_actor");
                    match msg {
                        ToEngineActor::Shutdown { reply } => {
                            break Ok(reply);
                        }
                        msg => self.on_actor_message(msg).await,
                    }
                }
                notice = self.notices.recv_async() => {
                    let notice = notice.context("feed notices closed")?;
                    trace!(%notice, ?i, "tick: feed");
                    self.on_feed_notice(notice).await;
                }
                Some(res) = self.fetch_tasks.join_next(), if !self.fetch_tasks.is_empty() => {
                    trace!(?i, "tick: fetch");
                    match res {
                        Ok(done) => self.on_fetch_done(done).await,
                        Err(err) => warn!(?err, "fetch task failed"),
                    }
                }
            }
        }
    }

    async fn on_actor_message(&mut self, msg: ToEngineActor) {
        match msg {
            ToEngineActor::Shutdown { .. } => {
                unreachable!("handled in run");
            }
            ToEngineActor::FetchFirst { reply } => {
                self.start_fetch_first(Some(reply), false);
            }
            ToEngineActor::FetchOlder { reply } => {
                self.start_fetch_older(reply);
            }
            ToEngineActor::ApplyCreate { record, reply } => {
                let res = self.apply_create(record).await;
                reply.send(res).ok();
            }
            ToEngineActor::ApplyEdit { id, content, reply } => {
                let res = self.apply_edit(id, content).await;
                reply.send(res).ok();
            }
            ToEngineActor::ApplyDelete { id, reply } => {
                let res = self.apply_delete(id).await;
                reply.send(res).ok();
            }
            ToEngineActor::ConfirmCreate {
                tentative,
                record,
                reply,
            } => {
                self.confirm_create(tentative, record).await;
                reply.send(()).ok();
            }
            ToEngineActor::ConfirmUpdate { id, record, reply } => {
                self.confirm_update(id, record).await;
                reply.send(()).ok();
            }
            ToEngineActor::ConfirmDelete { id, reply } => {
                self.confirm_delete(id).await;
                reply.send(()).ok();
            }
            ToEngineActor::Rollback { target, reply } => {
                self.rollback(target).await;
                reply.send(()).ok();
            }
            ToEngineActor::Subscribe { sender, reply } => {
                self.subscribers.subscribe(sender);
                reply.send(()).ok();
            }
            ToEngineActor::Records { reply } => {
                reply.send(self.cache.snapshot()).ok();
            }
            ToEngineActor::GetConnection { reply } => {
                reply.send(self.connection).ok();
            }
            ToEngineActor::Pending { reply } => {
                reply.send(self.ledger.statuses()).ok();
            }
            ToEngineActor::HasOlder { reply } => {
                reply.send(self.cache.has_older()).ok();
            }
        }
    }

    // ---- page fetches ----

    fn start_fetch_first(
        &mut self,
        reply: Option<oneshot::Sender<Result<(), FetchError>>>,
        resync: bool,
    ) {
        // a newer first-page fetch supersedes the outstanding one; a resync
        // already in flight must not lose its cache-discarding effect
        let mut resync = resync;
        if let Some(prev) = self.pending_first.take() {
            resync |= prev.resync;
            self.metrics.fetches_superseded.inc();
            if let Some(reply) = prev.reply {
                reply.send(Err(FetchError::Superseded)).ok();
            }
        }
        let id = self.next_fetch_id();
        self.pending_first = Some(PendingFirst { id, reply, resync });

        let authority = self.authority.clone();
        let feed = self.feed;
        let limit = self.page_limit;
        if resync {
            self.fetch_tasks.spawn(async move {
                let res = fetch_with_retries(authority.as_ref(), feed, limit).await;
                FetchDone {
                    id,
                    slot: FetchSlot::First,
                    res,
                }
            });
        } else {
            self.fetch_tasks.spawn(async move {
                let res = authority.fetch_page(feed, None, limit).await;
                FetchDone {
                    id,
                    slot: FetchSlot::First,
                    res,
                }
            });
        }
    }

    fn start_fetch_older(&mut self, reply: oneshot::Sender<Result<bool, FetchError>>) {
        let Some(cursor) = self.cache.next_cursor() else {
            reply.send(Ok(false)).ok();
            return;
        };
        if let Some(prev) = self.pending_older.take() {
            self.metrics.fetches_superseded.inc();
            prev.reply.send(Err(FetchError::Superseded)).ok();
        }
        let id = self.next_fetch_id();
        self.pending_older = Some(PendingOlder { id, reply });

        let authority = self.authority.clone();
        let feed = self.feed;
        let limit = self.page_limit;
        self.fetch_tasks.spawn(async move {
            let res = authority.fetch_page(feed, Some(cursor), limit).await;
            FetchDone {
                id,
                slot: FetchSlot::Older,
                res,
            }
        });
    }

    async fn on_fetch_done(&mut self, done: FetchDone) {
        match done.slot {
            FetchSlot::First => {
                if self.pending_first.as_ref().map(|p| p.id) != Some(done.id) {
                    trace!(id = done.id, "dropping superseded first-page fetch");
                    return;
                }
                let pending = self.pending_first.take().expect("checked above");
                match done.res {
                    Ok(page) => {
                        if pending.resync {
                            self.cache.clear();
                            self.metrics.resyncs.inc();
                            info!("resynced from authority");
                        }
                        self.cache.replace_first_page(Page {
                            records: page.records,
                            next_cursor: page.next_cursor,
                        });
                        self.set_state(CacheState::Loaded);
                        self.metrics.pages_applied.inc();
                        self.emit_records().await;
                        if let Some(reply) = pending.reply {
                            reply.send(Ok(())).ok();
                        }
                    }
                    Err(err) => {
                        if pending.resync {
                            // keep the stale cache; the next reconnect retries
                            error!(?err, "resync fetch failed");
                            self.set_state(CacheState::Loaded);
                        }
                        if let Some(reply) = pending.reply {
                            reply.send(Err(FetchError::Failed(err))).ok();
                        }
                    }
                }
            }
            FetchSlot::Older => {
                if self.pending_older.as_ref().map(|p| p.id) != Some(done.id) {
                    trace!(id = done.id, "dropping superseded older-page fetch");
                    return;
                }
                let pending = self.pending_older.take().expect("checked above");
                match done.res {
                    Ok(page) => {
                        self.cache.append_older_page(Page {
                            records: page.records,
                            next_cursor: page.next_cursor,
                        });
                        self.metrics.pages_applied.inc();
                        self.emit_records().await;
                        pending.reply.send(Ok(true)).ok();
                    }
                    Err(err) => {
                        pending.reply.send(Err(FetchError::Failed(err))).ok();
                    }
                }
            }
        }
    }

    fn next_fetch_id(&mut self) -> u64 {
        self.next_fetch_id += 1;
        self.next_fetch_id
    }

    // ---- optimistic mutations ----

    async fn apply_create(&mut self, record: Record) -> Result<(), ApplyError> {
        let pending = PendingMutation {
            target: record.id,
            kind: MutationKind::Create,
            submitted_at: timestamp_now(),
            rollback: Rollback::RemoveCreated,
        };
        if !self.ledger.register(pending) {
            return Err(ApplyError::InFlight);
        }
        debug!(id = %record.id.fmt_short(), "optimistic create");
        self.cache.upsert(record);
        self.metrics.optimistic_applied.inc();
        self.emit_records().await;
        Ok(())
    }

    async fn apply_edit(&mut self, id: RecordId, content: String) -> Result<(), ApplyError> {
        if self.ledger.contains(&id) {
            return Err(ApplyError::InFlight);
        }
        let Some(existing) = self.cache.get(&id).cloned() else {
            return Err(ApplyError::NotFound);
        };
        let registered = self.ledger.register(PendingMutation {
            target: id,
            kind: MutationKind::Update,
            submitted_at: timestamp_now(),
            rollback: Rollback::RestoreRecord(existing.clone()),
        });
        debug_assert!(registered);
        let mut updated = existing;
        updated.content = content;
        updated.updated_at = timestamp_now();
        updated.tentative = true;
        debug!(id = %id.fmt_short(), "optimistic edit");
        self.cache.replace_in_place(&id, updated);
        self.metrics.optimistic_applied.inc();
        self.emit_records().await;
        Ok(())
    }

    async fn apply_delete(&mut self, id: RecordId) -> Result<(), ApplyError> {
        if self.ledger.contains(&id) {
            return Err(ApplyError::InFlight);
        }
        let Some(existing) = self.cache.get(&id).cloned() else {
            return Err(ApplyError::NotFound);
        };
        let registered = self.ledger.register(PendingMutation {
            target: id,
            kind: MutationKind::Delete,
            submitted_at: timestamp_now(),
            rollback: Rollback::RestoreRecord(existing),
        });
        debug_assert!(registered);
        debug!(id = %id.fmt_short(), "optimistic delete");
        self.cache.remove(&id);
        self.metrics.optimistic_applied.inc();
        self.emit_records().await;
        Ok(())
    }

    // ---- confirmation and rollback ----

    /// Applies the authoritative record for a confirmed create.
    ///
    /// The tentative copy may already have been reconciled away by a racing
    /// feed insert; whichever side runs second must leave exactly one
    /// representation, under the authoritative id.
    async fn confirm_create(&mut self, tentative: RecordId, mut record: Record) {
        self.ledger.resolve(&tentative);
        record.tentative = false;
        if self.cache.replace_in_place(&tentative, record.clone()) {
            debug!(tentative = %tentative.fmt_short(), id = %record.id.fmt_short(), "create confirmed");
        } else if self.cache.get(&record.id).is_none() {
            debug!(id = %record.id.fmt_short(), "create confirmed, reinserting");
            self.cache.upsert(record);
        } else {
            trace!(id = %record.id.fmt_short(), "create confirmed, already reconciled");
        }
        self.metrics.mutations_confirmed.inc();
        self.emit_records().await;
    }

    async fn confirm_update(&mut self, id: RecordId, mut record: Record) {
        self.ledger.resolve(&id);
        record.tentative = false;
        let apply = self
            .cache
            .get(&id)
            .is_some_and(|stored| stored.tentative || record.updated_at > stored.updated_at);
        if apply {
            self.cache.replace_in_place(&id, record);
        } else {
            // either a newer authoritative state already landed via the feed,
            // or the record was deleted meanwhile; deletion is terminal
            trace!(id = %id.fmt_short(), "update confirmed, superseded");
        }
        self.metrics.mutations_confirmed.inc();
        self.emit_records().await;
    }

    async fn confirm_delete(&mut self, id: RecordId) {
        self.ledger.resolve(&id);
        self.cache.remove(&id);
        self.metrics.mutations_confirmed.inc();
        self.emit_records().await;
    }

    /// Restores the pre-mutation snapshot exactly and drops the ledger entry.
    async fn rollback(&mut self, target: RecordId) {
        let Some(pending) = self.ledger.resolve(&target) else {
            warn!(target = %target.fmt_short(), "rollback for unknown mutation");
            return;
        };
        match pending.rollback {
            Rollback::RemoveCreated => {
                self.cache.remove(&target);
            }
            Rollback::RestoreRecord(record) => {
                if !self.cache.replace_in_place(&record.id, record.clone()) {
                    self.cache.restore(record);
                }
            }
        }
        debug!(target = %target.fmt_short(), kind = %pending.kind, "rolled back");
        self.metrics.mutations_rolled_back.inc();
        self.emit_records().await;
    }

    // ---- feed events ----

    async fn on_feed_notice(&mut self, notice: FeedNotice) {
        match notice {
            FeedNotice::Event(event) => self.on_feed_event(event).await,
            FeedNotice::Connection(state) => self.on_connection(state).await,
        }
    }

    async fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Inserted(record) => self.on_inserted(record).await,
            FeedEvent::Updated(record) => self.on_updated(record).await,
            FeedEvent::Deleted(id) => self.on_deleted(id).await,
        }
    }

    /// Applies an insert event, deduplicating against already-applied and
    /// optimistic copies.
    async fn on_inserted(&mut self, record: Record) {
        match self.cache.get(&record.id).map(|r| r.tentative) {
            Some(false) => {
                trace!(id = %record.id.fmt_short(), "insert event: already applied");
                self.metrics.feed_inserts_deduped.inc();
                return;
            }
            Some(true) => {
                // an authoritative row under this id supersedes the tentative
                // copy
                let id = record.id;
                self.cache.replace_in_place(&id, record);
                self.metrics.feed_inserts_applied.inc();
                self.emit_records().await;
                return;
            }
            None => {}
        }
        // the echo of an optimistic create may arrive before the mutation's
        // own success response supplies the authoritative id; match it by
        // author and content
        let tentative = self
            .cache
            .iter()
            .find(|r| r.tentative && r.author == record.author && r.content == record.content)
            .map(|r| r.id);
        match tentative {
            Some(tentative_id) => {
                debug!(
                    tentative = %tentative_id.fmt_short(),
                    id = %record.id.fmt_short(),
                    "insert event: reconciled optimistic record"
                );
                self.cache.replace_in_place(&tentative_id, record);
            }
            None => {
                self.cache.upsert(record);
            }
        }
        self.metrics.feed_inserts_applied.inc();
        self.emit_records().await;
    }

    /// Applies an update event if it is strictly newer than the stored state.
    async fn on_updated(&mut self, record: Record) {
        let newer = self
            .cache
            .get(&record.id)
            .is_some_and(|stored| record.updated_at > stored.updated_at);
        if newer {
            let id = record.id;
            self.cache.replace_in_place(&id, record);
            self.metrics.feed_updates_applied.inc();
            self.emit_records().await;
        } else {
            trace!(id = %record.id.fmt_short(), "update event: stale or unknown");
            self.metrics.feed_updates_stale.inc();
        }
    }

    /// Deletion is terminal and takes precedence over pending updates.
    async fn on_deleted(&mut self, id: RecordId) {
        self.metrics.feed_deletes.inc();
        if self.cache.remove(&id).is_some() {
            self.emit_records().await;
        }
    }

    // ---- connection ----

    async fn on_connection(&mut self, state: ConnectionState) {
        match (self.connection, state) {
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                debug!("connection lost");
                self.connection = state;
                self.emit(LiveEvent::Connection(state)).await;
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                // the feed may have missed events; the authority is the
                // source of truth across the gap
                info!("reconnected, resyncing");
                self.connection = state;
                self.emit(LiveEvent::Connection(state)).await;
                self.start_resync();
            }
            _ => {}
        }
    }

    fn start_resync(&mut self) {
        if let Some(prev) = self.pending_older.take() {
            self.metrics.fetches_superseded.inc();
            prev.reply.send(Err(FetchError::Superseded)).ok();
        }
        self.set_state(CacheState::Resyncing);
        self.start_fetch_first(None, true);
    }

    fn set_state(&mut self, state: CacheState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state");
            self.state = state;
        }
    }

    // ---- subscribers ----

    async fn emit_records(&mut self) {
        let snapshot = self.cache.snapshot();
        self.subscribers.send(LiveEvent::Records(snapshot)).await;
    }

    async fn emit(&mut self, event: LiveEvent) {
        self.subscribers.send(event).await;
    }

    async fn shutdown(&mut self) -> Result<()> {
        // cancel all subscriptions
        self.subscribers.clear();
        // tear down the feed actor; its subscription is cancelled before it
        // replies
        let (reply, rx) = oneshot::channel();
        if self
            .to_feed
            .send(ToFeedActor::Shutdown { reply })
            .await
            .is_ok()
        {
            rx.await.ok();
        }
        self.fetch_tasks.abort_all();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Subscribers(Vec<flume::Sender<LiveEvent>>);

impl Subscribers {
    fn subscribe(&mut self, sender: flume::Sender<LiveEvent>) {
        self.0.push(sender)
    }

    async fn send(&mut self, event: LiveEvent) -> bool {
        let futs = self.0.iter().map(|sender| sender.send_async(event.clone()));
        let res = futures_buffered::join_all(futs).await;
        // reverse the order so removing does not shift remaining indices
        for (i, res) in res.into_iter().enumerate().rev() {
            if res.is_err() {
                self.0.remove(i);
            }
        }
        !self.0.is_empty()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Fetches the first page, retrying with exponential backoff.
async fn fetch_with_retries<A: Authority + ?Sized>(
    authority: &A,
    feed: FeedKey,
    limit: usize,
) -> FetchRes {
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter()
        .build();
    loop {
        match authority.fetch_page(feed, None, limit).await {
            Ok(page) => break Ok(page),
            Err(err) => match backoff.next() {
                Some(delay) => {
                    warn!(?err, "resync fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => break Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_prune_dropped_receivers() {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        let mut subscribers = Subscribers::default();
        subscribers.subscribe(a_tx);
        subscribers.subscribe(b_tx);
        drop(a_rx);
        assert!(
            subscribers
                .send(LiveEvent::Connection(ConnectionState::Connected))
                .await
        );
        drop(b_rx);
        assert!(
            !subscribers
                .send(LiveEvent::Connection(ConnectionState::Connected))
                .await
        );
    }
}
