//! Interfaces to the remote authority and its live push channel.
//!
//! The engine treats everything behind these traits as external collaborators:
//! transport, persistence and access control live on the other side.

use anyhow::Result;
use futures_util::future::BoxFuture;

use crate::record::{AuthorId, FeedKey, Record, RecordId};

/// One page of records fetched from the authority.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Records, newest first.
    pub records: Vec<Record>,
    /// Cursor for the next older page; `None` when fewer than `limit` records
    /// were returned.
    pub next_cursor: Option<u64>,
}

/// The remote system holding the durable, canonical record set.
///
/// Methods return boxed futures so the trait stays dyn-compatible.
pub trait Authority: Send + Sync + 'static {
    /// Fetches one page of records, newest first, starting below `cursor`.
    fn fetch_page(
        &self,
        feed: FeedKey,
        cursor: Option<u64>,
        limit: usize,
    ) -> BoxFuture<'_, Result<FetchedPage>>;

    /// Creates a record and returns the authoritative row.
    fn create(&self, feed: FeedKey, content: String) -> BoxFuture<'_, Result<Record>>;

    /// Updates a record's content and returns the authoritative row.
    fn update(&self, id: RecordId, content: String) -> BoxFuture<'_, Result<Record>>;

    /// Deletes a record.
    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<()>>;
}

/// Raw change notification as delivered by the authority's push channel.
///
/// The feed adapter normalizes these into [`crate::FeedEvent`]s; collaborators
/// deliver them untouched and in authority order.
#[derive(Debug, Clone)]
pub enum Change {
    /// A row was inserted.
    Insert {
        /// The inserted row.
        new: Record,
    },
    /// A row was updated.
    Update {
        /// The new state of the row.
        new: Record,
    },
    /// A row was deleted.
    Delete {
        /// Id of the deleted row.
        old_id: RecordId,
    },
}

/// A live push subscription for one feed key.
///
/// Implementors deliver [`Change`]s over the sender passed to
/// [`LiveFeed::subscribe`] and drop that sender when the subscription is lost.
pub trait LiveFeed: Send + Sync + 'static {
    /// Opens a subscription delivering changes for `feed` into `events`.
    fn subscribe(
        &self,
        feed: FeedKey,
        events: flume::Sender<Change>,
    ) -> BoxFuture<'_, Result<Subscription>>;
}

/// Handle to an open subscription.
///
/// Unsubscribes when dropped; [`Self::unsubscribe`] does so explicitly.
#[derive(derive_more::Debug)]
pub struct Subscription {
    #[debug("cancel")]
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    /// Creates a subscription handle from a cancel function.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancels the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Accessor for the local actor's id, needed to stamp optimistic creates.
pub trait Identity: Send + Sync + 'static {
    /// The local author id.
    fn author_id(&self) -> BoxFuture<'_, Result<AuthorId>>;
}
