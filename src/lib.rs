//! Client-side reconciliation engine for live record feeds
//!
//! Many clients view and edit a shared, append-mostly feed of records while a
//! single remote authority holds the canonical set. This crate merges three
//! independently-arriving data sources into one consistent, duplicate-free,
//! correctly-ordered view:
//!
//! - paginated historical reads ([`Engine::load`], [`Engine::fetch_older`]),
//! - locally-originated optimistic mutations ([`MutationCoordinator`]),
//! - a live push feed of authoritative change notifications ([`LiveFeed`]).
//!
//! The [`Engine`] owns the cache for one feed key and recovers
//! deterministically from mutation failure, out-of-order delivery, and
//! connection loss: failed mutations roll back exactly, stale updates are
//! discarded, and a reconnect triggers a full resynchronization from the
//! authority.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cache;
mod coordinator;
mod engine;
mod feed;
pub mod ledger;
pub mod metrics;
mod record;
pub mod remote;

pub use self::coordinator::{validate_content, MutationCoordinator, MutationError, ValidationError};
pub use self::engine::{Engine, EngineOptions, FetchError, LiveEvent, DEFAULT_PAGE_LIMIT};
pub use self::feed::{ConnectionState, FeedEvent};
pub use self::ledger::{MutationKind, PendingStatus};
pub use self::record::{timestamp_now, AuthorId, FeedKey, Record, RecordId, MAX_CONTENT_LEN};
pub use self::remote::{Authority, Change, FetchedPage, Identity, LiveFeed, Subscription};
