//! Integration tests driving a full engine against in-memory collaborators.
//!
//! The fake authority can hold mutation responses open (to observe
//! intermediate optimistic state) and the fake feed can drop its connection
//! (to exercise reconnect and resync).

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{future::BoxFuture, FutureExt};
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use feedsync::{
    Authority, AuthorId, Change, ConnectionState, Engine, EngineOptions, FeedKey, FetchedPage,
    Identity, LiveEvent, LiveFeed, MutationCoordinator, MutationError, Record, RecordId,
    Subscription,
};

const FEED: FeedKey = FeedKey::from_bytes([7; 16]);
const AUTHOR: AuthorId = AuthorId::from_bytes([9; 16]);

fn server_id(n: u8) -> RecordId {
    let mut bytes = [0xf0u8; 16];
    bytes[15] = n;
    RecordId::from_bytes(bytes)
}

fn server_record(n: u8, created_at: u64, content: &str) -> Record {
    Record {
        id: server_id(n),
        feed: FEED,
        author: AUTHOR,
        content: content.into(),
        created_at,
        updated_at: created_at,
        tentative: false,
    }
}

/// Blocks mutation responses while held.
#[derive(Default)]
struct Gate {
    held: Mutex<bool>,
    notify: Notify,
}

impl Gate {
    fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.notify.notify_waiters();
    }

    async fn pass(&self) {
        loop {
            let notified = self.notify.notified();
            if !*self.held.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct AuthorityState {
    records: Vec<Record>,
    next_id: u8,
    next_ts: u64,
    fail_create: bool,
    fail_update: bool,
    fail_delete: bool,
}

impl AuthorityState {
    fn insert_new(&mut self, feed: FeedKey, content: String) -> Record {
        self.next_id += 1;
        self.next_ts += 1_000;
        let record = Record {
            id: server_id(self.next_id),
            feed,
            author: AUTHOR,
            content,
            created_at: self.next_ts,
            updated_at: self.next_ts,
            tentative: false,
        };
        self.records.push(record.clone());
        record
    }
}

/// In-memory stand-in for the remote store.
#[derive(Clone, Default)]
struct TestAuthority {
    state: Arc<Mutex<AuthorityState>>,
    gate: Arc<Gate>,
}

impl TestAuthority {
    fn seed(&self, record: Record) {
        let mut state = self.state.lock().unwrap();
        state.next_ts = state.next_ts.max(record.created_at);
        // keep generated ids clear of seeded ones
        state.next_id = state.next_id.max(record.id.as_bytes()[15]);
        state.records.push(record);
    }

    fn latest(&self) -> Record {
        self.state
            .lock()
            .unwrap()
            .records
            .last()
            .cloned()
            .expect("no records")
    }

    fn refuse_creates(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    fn refuse_updates(&self) {
        self.state.lock().unwrap().fail_update = true;
    }

    fn refuse_deletes(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }
}

impl Authority for TestAuthority {
    fn fetch_page(
        &self,
        feed: FeedKey,
        cursor: Option<u64>,
        limit: usize,
    ) -> BoxFuture<'_, Result<FetchedPage>> {
        let state = self.state.clone();
        async move {
            let state = state.lock().unwrap();
            let mut records: Vec<Record> = state
                .records
                .iter()
                .filter(|r| r.feed == feed && cursor.is_none_or(|c| r.created_at < c))
                .cloned()
                .collect();
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            records.truncate(limit);
            let next_cursor = if records.len() == limit {
                records.last().map(|r| r.created_at)
            } else {
                None
            };
            Ok(FetchedPage {
                records,
                next_cursor,
            })
        }
        .boxed()
    }

    fn create(&self, feed: FeedKey, content: String) -> BoxFuture<'_, Result<Record>> {
        let this = self.clone();
        async move {
            let record = {
                let mut state = this.state.lock().unwrap();
                if state.fail_create {
                    return Err(anyhow!("create refused"));
                }
                state.insert_new(feed, content)
            };
            this.gate.pass().await;
            Ok(record)
        }
        .boxed()
    }

    fn update(&self, id: RecordId, content: String) -> BoxFuture<'_, Result<Record>> {
        let this = self.clone();
        async move {
            let record = {
                let mut state = this.state.lock().unwrap();
                if state.fail_update {
                    return Err(anyhow!("update refused"));
                }
                state.next_ts += 1_000;
                let ts = state.next_ts;
                let record = state
                    .records
                    .iter_mut()
                    .find(|r| r.id == id)
                    .ok_or_else(|| anyhow!("no such record"))?;
                record.content = content;
                record.updated_at = ts;
                record.clone()
            };
            this.gate.pass().await;
            Ok(record)
        }
        .boxed()
    }

    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<()>> {
        let this = self.clone();
        async move {
            {
                let mut state = this.state.lock().unwrap();
                if state.fail_delete {
                    return Err(anyhow!("delete refused"));
                }
                state.records.retain(|r| r.id != id);
            }
            this.gate.pass().await;
            Ok(())
        }
        .boxed()
    }
}

#[derive(Default)]
struct FeedInner {
    sender: Option<flume::Sender<Change>>,
    generation: u64,
    subscribes: u64,
}

/// In-memory stand-in for the live push channel.
#[derive(Clone, Default)]
struct TestFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl TestFeed {
    fn push(&self, change: Change) {
        let sender = self
            .inner
            .lock()
            .unwrap()
            .sender
            .clone()
            .expect("not subscribed");
        sender.send(change).unwrap();
    }

    /// Drops the subscription's sender, simulating a lost connection.
    fn drop_connection(&self) {
        self.inner.lock().unwrap().sender = None;
    }

    fn subscribes(&self) -> u64 {
        self.inner.lock().unwrap().subscribes
    }

    async fn wait_subscribed(&self) {
        for _ in 0..1000 {
            if self.inner.lock().unwrap().sender.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("feed never subscribed");
    }
}

impl LiveFeed for TestFeed {
    fn subscribe(
        &self,
        _feed: FeedKey,
        events: flume::Sender<Change>,
    ) -> BoxFuture<'_, Result<Subscription>> {
        let inner = self.inner.clone();
        async move {
            let generation = {
                let mut inner = inner.lock().unwrap();
                inner.generation += 1;
                inner.subscribes += 1;
                inner.sender = Some(events);
                inner.generation
            };
            let cancel_inner = inner.clone();
            Ok(Subscription::new(move || {
                let mut inner = cancel_inner.lock().unwrap();
                if inner.generation == generation {
                    inner.sender = None;
                }
            }))
        }
        .boxed()
    }
}

struct TestIdentity;

impl Identity for TestIdentity {
    fn author_id(&self) -> BoxFuture<'_, Result<AuthorId>> {
        async move { Ok(AUTHOR) }.boxed()
    }
}

struct Harness {
    engine: Engine,
    coordinator: MutationCoordinator<TestAuthority, TestIdentity>,
    authority: TestAuthority,
    feed: TestFeed,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

fn harness_with(opts: EngineOptions) -> Harness {
    setup_logging();
    let authority = TestAuthority::default();
    let feed = TestFeed::default();
    let engine = Engine::spawn(
        FEED,
        Arc::new(authority.clone()),
        Arc::new(feed.clone()),
        opts,
    );
    let coordinator = MutationCoordinator::new(
        engine.clone(),
        Arc::new(authority.clone()),
        Arc::new(TestIdentity),
    );
    Harness {
        engine,
        coordinator,
        authority,
        feed,
    }
}

fn harness() -> Harness {
    harness_with(EngineOptions::default())
}

async fn wait_records(engine: &Engine, pred: impl Fn(&[Record]) -> bool) -> Vec<Record> {
    for _ in 0..1000 {
        let records = engine.records().await.unwrap();
        if pred(&records) {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "condition not reached, records: {:?}",
        engine.records().await.unwrap()
    );
}

async fn wait_connection(engine: &Engine, want: ConnectionState) {
    for _ in 0..1000 {
        if engine.connection().await.unwrap() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("connection never became {want}");
}

fn assert_unique_ids(records: &[Record]) {
    let mut seen = std::collections::HashSet::new();
    for record in records {
        assert!(seen.insert(record.id), "duplicate id {}", record.id);
    }
}

// Scenario A: an empty cache filled from one fetched page displays ascending.
#[tokio::test]
async fn fetch_first_page_displays_ascending() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.authority.seed(server_record(2, 2_000, "m2"));

    h.engine.load().await.unwrap();
    let records = h.engine.records().await.unwrap();
    assert_eq!(
        records.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2"]
    );
    h.engine.shutdown().await.unwrap();
}

// Scenario B: an optimistic create is visible immediately and is replaced by
// the authoritative record on confirmation.
#[tokio::test]
async fn create_confirms_to_authoritative_record() {
    let h = harness();
    h.engine.load().await.unwrap();

    h.authority.gate.hold();
    let coordinator = h.coordinator.clone();
    let submit = tokio::spawn(async move { coordinator.submit_create("hi").await });

    let records = wait_records(&h.engine, |r| r.len() == 1).await;
    assert!(records[0].tentative);
    assert_eq!(records[0].content, "hi");
    assert_eq!(records[0].author, AUTHOR);
    assert_eq!(h.engine.pending().await.unwrap().len(), 1);

    h.authority.gate.release();
    let confirmed = submit.await.unwrap().unwrap();
    assert_eq!(confirmed.id, server_id(1));

    let records = wait_records(&h.engine, |r| r.len() == 1 && !r[0].tentative).await;
    assert_eq!(records[0].id, server_id(1));
    assert!(h.engine.pending().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

// Scenario C: the feed's insert echo arrives before the create response; both
// reconcile to a single authoritative record.
#[tokio::test]
async fn feed_echo_wins_race_against_create_response() {
    let h = harness();
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    h.authority.gate.hold();
    let coordinator = h.coordinator.clone();
    let submit = tokio::spawn(async move { coordinator.submit_create("hi").await });
    wait_records(&h.engine, |r| r.len() == 1 && r[0].tentative).await;

    // the authority has inserted the row; its echo overtakes the response
    let echo = h.authority.latest();
    h.feed.push(Change::Insert { new: echo.clone() });
    let records = wait_records(&h.engine, |r| r.len() == 1 && !r[0].tentative).await;
    assert_eq!(records[0].id, echo.id);

    // the response arrives later and must be a no-op
    h.authority.gate.release();
    submit.await.unwrap().unwrap();
    let records = h.engine.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, echo.id);
    assert!(!records[0].tentative);
    h.engine.shutdown().await.unwrap();
}

// The reverse race: the create response lands first, the echo second.
#[tokio::test]
async fn create_response_wins_race_against_feed_echo() {
    let h = harness();
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    let confirmed = h.coordinator.submit_create("hi").await.unwrap();
    h.feed.push(Change::Insert {
        new: confirmed.clone(),
    });
    // give the event a chance to apply before asserting it deduped
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = h.engine.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, confirmed.id);
    assert!(!records[0].tentative);
    h.engine.shutdown().await.unwrap();
}

// Scenario D: a failed edit reverts the record to its previous state.
#[tokio::test]
async fn failed_edit_rolls_back_exactly() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.engine.load().await.unwrap();
    let before = h.engine.records().await.unwrap();

    h.authority.refuse_updates();
    let err = h
        .coordinator
        .submit_edit(server_id(1), "bye")
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::Failed { .. }));

    let after = h.engine.records().await.unwrap();
    assert_eq!(after, before);
    assert!(h.engine.pending().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_delete_restores_record_in_place() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.authority.seed(server_record(2, 2_000, "m2"));
    h.authority.seed(server_record(3, 3_000, "m3"));
    h.engine.load().await.unwrap();
    let before = h.engine.records().await.unwrap();

    h.authority.refuse_deletes();
    let err = h.coordinator.submit_delete(server_id(2)).await.unwrap_err();
    assert!(matches!(err, MutationError::Failed { .. }));

    // restored at its original position, not at the head
    let after = h.engine.records().await.unwrap();
    assert_eq!(after, before);
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_create_removes_tentative_record() {
    let h = harness();
    h.engine.load().await.unwrap();
    h.authority.refuse_creates();

    let err = h.coordinator.submit_create("hi").await.unwrap_err();
    assert!(matches!(err, MutationError::Failed { .. }));
    assert!(h.engine.records().await.unwrap().is_empty());
    assert!(h.engine.pending().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

// Scenario E: a reconnect discards feed-derived state and refetches, so the
// cache equals a fresh load.
#[tokio::test]
async fn reconnect_resyncs_from_authority() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    // a feed-only record that the authority does not know about
    h.feed.push(Change::Insert {
        new: server_record(99, 5_000, "ghost"),
    });
    wait_records(&h.engine, |r| r.len() == 2).await;

    h.feed.drop_connection();
    wait_connection(&h.engine, ConnectionState::Reconnecting).await;
    wait_connection(&h.engine, ConnectionState::Connected).await;
    assert!(h.feed.subscribes() >= 2);

    let records = wait_records(&h.engine, |r| r.len() == 1).await;
    assert_eq!(records[0].content, "m1");
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn insert_events_are_idempotent() {
    let h = harness();
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    let record = server_record(1, 1_000, "m1");
    h.feed.push(Change::Insert {
        new: record.clone(),
    });
    let after_one = wait_records(&h.engine, |r| r.len() == 1).await;
    h.feed.push(Change::Insert { new: record });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.engine.records().await.unwrap(), after_one);
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_updates_are_discarded() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    // an equal timestamp must not apply
    let mut stale = server_record(1, 1_000, "stale");
    stale.updated_at = 1_000;
    h.feed.push(Change::Update { new: stale.clone() });
    // an older timestamp must not apply either
    stale.updated_at = 500;
    h.feed.push(Change::Update { new: stale });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.records().await.unwrap()[0].content, "m1");

    let mut fresh = server_record(1, 1_000, "fresh");
    fresh.updated_at = 2_000;
    h.feed.push(Change::Update { new: fresh });
    wait_records(&h.engine, |r| r[0].content == "fresh").await;
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_events_are_terminal() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    h.feed.push(Change::Delete {
        old_id: server_id(1),
    });
    wait_records(&h.engine, |r| r.is_empty()).await;

    // a late update for the deleted id must not resurrect it
    let mut late = server_record(1, 1_000, "late");
    late.updated_at = 9_000;
    h.feed.push(Change::Update { new: late });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.engine.records().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_mutation_on_busy_target_is_rejected() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.engine.load().await.unwrap();

    h.authority.gate.hold();
    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.submit_edit(server_id(1), "a").await });
    wait_records(&h.engine, |r| r[0].content == "a").await;

    let err = h
        .coordinator
        .submit_edit(server_id(1), "b")
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::InFlight(id) if id == server_id(1)));
    let err = h.coordinator.submit_delete(server_id(1)).await.unwrap_err();
    assert!(matches!(err, MutationError::InFlight(_)));

    h.authority.gate.release();
    first.await.unwrap().unwrap();
    assert!(h.engine.pending().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn validation_fails_synchronously_without_state_change() {
    let h = harness();
    h.engine.load().await.unwrap();

    let err = h.coordinator.submit_create("   ").await.unwrap_err();
    assert!(matches!(err, MutationError::Validation(_)));
    let err = h
        .coordinator
        .submit_create(&"x".repeat(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::Validation(_)));

    assert!(h.engine.records().await.unwrap().is_empty());
    assert!(h.engine.pending().await.unwrap().is_empty());
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn edit_of_unknown_record_is_rejected() {
    let h = harness();
    h.engine.load().await.unwrap();
    let err = h
        .coordinator
        .submit_edit(server_id(42), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::NotFound(_)));
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn older_pages_paginate_until_exhausted() {
    let h = harness_with(EngineOptions { page_limit: 2 });
    for n in 1..=5u8 {
        h.authority
            .seed(server_record(n, n as u64 * 1_000, &format!("m{n}")));
    }

    h.engine.load().await.unwrap();
    assert_eq!(h.engine.records().await.unwrap().len(), 2);
    assert!(h.engine.has_older().await.unwrap());

    assert!(h.engine.fetch_older().await.unwrap());
    assert!(h.engine.fetch_older().await.unwrap());
    assert!(!h.engine.has_older().await.unwrap());
    // nothing older to fetch anymore
    assert!(!h.engine.fetch_older().await.unwrap());

    let records = h.engine.records().await.unwrap();
    assert_eq!(
        records.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2", "m3", "m4", "m5"]
    );
    assert_unique_ids(&records);
    h.engine.shutdown().await.unwrap();
}

// Uniqueness holds across a mixed sequence of fetches, mutations and events.
#[tokio::test]
async fn uniqueness_across_mixed_operations() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    h.authority.seed(server_record(2, 2_000, "m2"));
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    // a record only the feed knows about, plus duplicate echoes
    h.feed.push(Change::Insert {
        new: server_record(50, 3_000, "ghost"),
    });
    let created = h.coordinator.submit_create("mine").await.unwrap();
    h.feed.push(Change::Insert {
        new: created.clone(),
    });
    h.feed.push(Change::Insert {
        new: server_record(2, 2_000, "m2"),
    });
    let records = wait_records(&h.engine, |r| r.len() == 4).await;
    assert_unique_ids(&records);

    // a refetch replaces the first page; the feed-only record drops out
    h.engine.load().await.unwrap();
    let records = wait_records(&h.engine, |r| r.len() == 3).await;
    assert_unique_ids(&records);
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscribers_observe_changes_and_transitions() {
    let h = harness();
    h.authority.seed(server_record(1, 1_000, "m1"));
    let events = h.engine.subscribe().await.unwrap();

    h.engine.load().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
        .await
        .unwrap()
        .unwrap();
    match event {
        LiveEvent::Records(records) => assert_eq!(records.len(), 1),
        other => panic!("unexpected event {other}"),
    }

    h.feed.wait_subscribed().await;
    h.feed.drop_connection();
    let mut saw_reconnecting = false;
    for _ in 0..10 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .unwrap()
            .unwrap();
        if matches!(
            event,
            LiveEvent::Connection(ConnectionState::Reconnecting)
        ) {
            saw_reconnecting = true;
            break;
        }
    }
    assert!(saw_reconnecting);
    h.engine.shutdown().await.unwrap();
}

// Shutdown tears the subscription down, so a new engine for the same feed can
// subscribe without leakage from the previous one.
#[tokio::test]
async fn shutdown_cancels_subscription() {
    let h = harness();
    h.engine.load().await.unwrap();
    h.feed.wait_subscribed().await;

    h.engine.shutdown().await.unwrap();
    assert!(h.feed.inner.lock().unwrap().sender.is_none());
}
