//! Actor owning the live push subscription for one feed key.
//!
//! Normalizes raw [`Change`]s into [`FeedEvent`]s, forwards them to the
//! reconciliation engine in delivery order, and tracks connection
//! transitions. A lost subscription is reported as reconnecting and reopened
//! with exponential backoff; the previous subscription is always torn down
//! before a new one is opened.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::record::{FeedKey, Record, RecordId};
use crate::remote::{Change, LiveFeed};

/// Capacity of the raw change channel handed to the [`LiveFeed`].
const CHANGE_CHANNEL_CAP: usize = 1024;

/// A normalized change notification from the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum FeedEvent {
    /// A record was inserted.
    Inserted(Record),
    /// A record was updated.
    Updated(Record),
    /// A record was deleted.
    Deleted(RecordId),
}

/// State of the live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ConnectionState {
    /// The feed is believed to have delivered every event so far.
    Connected,
    /// The subscription was lost; events may have been missed.
    Reconnecting,
}

/// What the feed actor delivers to the engine.
#[derive(Debug, Clone, strum::Display)]
pub(crate) enum FeedNotice {
    /// A normalized change event.
    Event(FeedEvent),
    /// A connection transition.
    Connection(ConnectionState),
}

/// Messages to the feed actor.
#[derive(derive_more::Debug, strum::Display)]
pub(crate) enum ToFeedActor {
    Shutdown {
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct FeedActor<L> {
    feed: FeedKey,
    live: Arc<L>,
    inbox: mpsc::Receiver<ToFeedActor>,
    notices: flume::Sender<FeedNotice>,
    /// Backoff for resubscription attempts, reset after each success.
    retry_backoff: Option<Box<dyn Iterator<Item = Duration> + Send + Sync>>,
}

impl<L: LiveFeed> FeedActor<L> {
    pub(crate) fn new(
        feed: FeedKey,
        live: Arc<L>,
        inbox: mpsc::Receiver<ToFeedActor>,
        notices: flume::Sender<FeedNotice>,
    ) -> Self {
        Self {
            feed,
            live,
            inbox,
            notices,
            retry_backoff: None,
        }
    }

    /// Run the actor loop. The subscription is fully cancelled before the
    /// shutdown reply is sent.
    pub(crate) async fn run(mut self) -> Result<()> {
        let reply = self.run_inner().await;
        debug!("shutdown");
        if let Some(reply) = reply {
            reply.send(()).ok();
        }
        Ok(())
    }

    async fn run_inner(&mut self) -> Option<oneshot::Sender<()>> {
        loop {
            let (changes_tx, changes_rx) = flume::bounded(CHANGE_CHANNEL_CAP);
            let subscription = match self.live.subscribe(self.feed, changes_tx).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(?err, "subscribe failed");
                    if !self.notify_connection(ConnectionState::Reconnecting).await {
                        return None;
                    }
                    match self.await_retry().await {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Shutdown(reply) => return reply,
                    }
                }
            };
            debug!(feed = %self.feed.fmt_short(), "subscribed");
            self.retry_backoff = None;
            if !self.notify_connection(ConnectionState::Connected).await {
                subscription.unsubscribe();
                return None;
            }

            // pump changes until the subscription drops its sender
            loop {
                tokio::select! {
                    biased;
                    msg = self.inbox.recv() => {
                        subscription.unsubscribe();
                        return match msg {
                            Some(ToFeedActor::Shutdown { reply }) => Some(reply),
                            None => None,
                        };
                    }
                    change = changes_rx.recv_async() => {
                        match change {
                            Ok(change) => {
                                let event = normalize(change);
                                trace!(%event, "tick: change");
                                if self.notices.send_async(FeedNotice::Event(event)).await.is_err() {
                                    subscription.unsubscribe();
                                    return None;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            // subscription lost: teardown first, then report and retry
            warn!(feed = %self.feed.fmt_short(), "subscription lost");
            subscription.unsubscribe();
            if !self.notify_connection(ConnectionState::Reconnecting).await {
                return None;
            }
            match self.await_retry().await {
                RetryOutcome::Retry => {}
                RetryOutcome::Shutdown(reply) => return reply,
            }
        }
    }

    async fn notify_connection(&self, state: ConnectionState) -> bool {
        self.notices
            .send_async(FeedNotice::Connection(state))
            .await
            .is_ok()
    }

    /// Waits for the next backoff delay, or for a shutdown request.
    async fn await_retry(&mut self) -> RetryOutcome {
        let delay = self
            .backoff_delay()
            .unwrap_or_else(|| Duration::from_secs(10));
        tokio::select! {
            biased;
            msg = self.inbox.recv() => match msg {
                Some(ToFeedActor::Shutdown { reply }) => RetryOutcome::Shutdown(Some(reply)),
                None => RetryOutcome::Shutdown(None),
            },
            _ = tokio::time::sleep(delay) => RetryOutcome::Retry,
        }
    }

    fn backoff_delay(&mut self) -> Option<Duration> {
        self.retry_backoff
            .get_or_insert_with(new_backoff)
            .next()
    }
}

enum RetryOutcome {
    Retry,
    Shutdown(Option<oneshot::Sender<()>>),
}

fn new_backoff() -> Box<dyn Iterator<Item = Duration> + Send + Sync> {
    Box::new(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter()
            .without_max_times()
            .build(),
    )
}

fn normalize(change: Change) -> FeedEvent {
    match change {
        Change::Insert { mut new } => {
            new.tentative = false;
            FeedEvent::Inserted(new)
        }
        Change::Update { mut new } => {
            new.tentative = false;
            FeedEvent::Updated(new)
        }
        Change::Delete { old_id } => FeedEvent::Deleted(old_id),
    }
}
