//! Orchestrates user mutations: validate, optimistic-apply, remote call,
//! confirm or rollback.
//!
//! The coordinator never touches the cache itself; all merging is delegated
//! to the [`Engine`]. Concurrent submissions are independent as long as they
//! target distinct ids.

use std::sync::Arc;

use tracing::debug;

use crate::{
    engine::{ApplyError, Engine},
    ledger::MutationKind,
    record::{Record, RecordId, MAX_CONTENT_LEN},
    remote::{Authority, Identity},
};

/// Rejected mutation input. Never reaches the network, never changes state.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty after trimming.
    #[error("content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_LEN`] after trimming.
    #[error("content too long ({len} > {max} bytes)")]
    TooLong {
        /// Trimmed length of the submitted content.
        len: usize,
        /// The allowed maximum.
        max: usize,
    },
}

/// Error surfaced from a submitted mutation.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    /// Input was rejected synchronously; nothing was submitted or applied.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A mutation for the target id is already in flight. Resubmit after it
    /// resolves.
    #[error("a mutation for {0} is already in flight")]
    InFlight(RecordId),
    /// The target record is not cached.
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// The remote call failed. The optimistic effect has been rolled back.
    #[error("{kind} failed: {cause}")]
    Failed {
        /// Kind of the failed mutation.
        kind: MutationKind,
        /// The remote error.
        cause: anyhow::Error,
    },
    /// The engine was shut down.
    #[error("engine shut down")]
    Shutdown,
}

/// Submits mutations for one feed key.
#[derive(Debug)]
pub struct MutationCoordinator<A, I> {
    engine: Engine,
    authority: Arc<A>,
    identity: Arc<I>,
}

impl<A, I> Clone for MutationCoordinator<A, I> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            authority: self.authority.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<A: Authority, I: Identity> MutationCoordinator<A, I> {
    /// Creates a coordinator submitting through `authority` and reconciling
    /// through `engine`.
    pub fn new(engine: Engine, authority: Arc<A>, identity: Arc<I>) -> Self {
        Self {
            engine,
            authority,
            identity,
        }
    }

    /// Creates a record.
    ///
    /// The tentative record is visible in the cache immediately; the returned
    /// record is the authoritative row.
    pub async fn submit_create(&self, content: &str) -> Result<Record, MutationError> {
        let content = validate_content(content)?;
        // the identity is resolved before the optimistic apply so the
        // tentative record carries the real author id
        let author = self
            .identity
            .author_id()
            .await
            .map_err(|cause| MutationError::Failed {
                kind: MutationKind::Create,
                cause,
            })?;
        let tentative_id = RecordId::generate(&mut rand::thread_rng());
        let record = Record::tentative(tentative_id, self.engine.feed, author, content.clone());
        self.engine
            .apply_create(record)
            .await
            .map_err(|err| apply_err(err, tentative_id))?;
        debug!(tentative = %tentative_id.fmt_short(), "create submitted");

        match self.authority.create(self.engine.feed, content).await {
            Ok(mut record) => {
                record.tentative = false;
                self.engine
                    .confirm_create(tentative_id, record.clone())
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Ok(record)
            }
            Err(cause) => {
                self.engine
                    .rollback(tentative_id)
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Err(MutationError::Failed {
                    kind: MutationKind::Create,
                    cause,
                })
            }
        }
    }

    /// Changes a record's content.
    pub async fn submit_edit(&self, id: RecordId, content: &str) -> Result<Record, MutationError> {
        let content = validate_content(content)?;
        self.engine
            .apply_edit(id, content.clone())
            .await
            .map_err(|err| apply_err(err, id))?;
        debug!(id = %id.fmt_short(), "edit submitted");

        match self.authority.update(id, content).await {
            Ok(mut record) => {
                record.tentative = false;
                self.engine
                    .confirm_update(id, record.clone())
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Ok(record)
            }
            Err(cause) => {
                self.engine
                    .rollback(id)
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Err(MutationError::Failed {
                    kind: MutationKind::Update,
                    cause,
                })
            }
        }
    }

    /// Deletes a record.
    pub async fn submit_delete(&self, id: RecordId) -> Result<(), MutationError> {
        self.engine
            .apply_delete(id)
            .await
            .map_err(|err| apply_err(err, id))?;
        debug!(id = %id.fmt_short(), "delete submitted");

        match self.authority.delete(id).await {
            Ok(()) => {
                self.engine
                    .confirm_delete(id)
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Ok(())
            }
            Err(cause) => {
                self.engine
                    .rollback(id)
                    .await
                    .map_err(|_| MutationError::Shutdown)?;
                Err(MutationError::Failed {
                    kind: MutationKind::Delete,
                    cause,
                })
            }
        }
    }
}

fn apply_err(err: ApplyError, target: RecordId) -> MutationError {
    match err {
        ApplyError::InFlight => MutationError::InFlight(target),
        ApplyError::NotFound => MutationError::NotFound(target),
        ApplyError::Shutdown => MutationError::Shutdown,
    }
}

/// Trims mutation content and checks its bounds.
pub fn validate_content(content: &str) -> Result<String, ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    if trimmed.len() > MAX_CONTENT_LEN {
        return Err(ValidationError::TooLong {
            len: trimmed.len(),
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(trimmed.to_string())
}
