//! Single-owner handle over one locked entity.

use chrono::{DateTime, Utc};

use docrepo_core::lock::{error_update, held_filter, release_update};
use docrepo_core::metrics::LOCK_OPERATIONS;
use docrepo_core::{
    CoreError, CoreResult, DocumentId, LockErrorInfo, LockInfo, LockToken, Update,
};

use crate::collection::Collection;
use crate::entity::Entity;

/// Lifecycle of an [`EntityScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Locked,
    Committed,
    Abandoned,
    Error,
}

/// Exclusive working rights over one document, obtained from
/// [`Collection::acquire`].
///
/// Ends with exactly one of [`commit`](Self::commit),
/// [`abandon`](Self::abandon) or [`set_error_state`](Self::set_error_state),
/// each of which consumes the scope. Every write is conditioned on the scope's
/// token, so a holder whose lease was reclaimed gets `LockLost` and cannot
/// overwrite the new holder's work. A scope dropped while still locked leaves
/// the lock in place until the lease expires.
pub struct EntityScope<T: Entity> {
    collection: Collection<T>,
    id: DocumentId,
    entity: T,
    lock: LockInfo,
    state: ScopeState,
}

impl<T: Entity> EntityScope<T> {
    pub(crate) fn new(collection: Collection<T>, id: DocumentId, entity: T, lock: LockInfo) -> Self {
        Self {
            collection,
            id,
            entity,
            lock,
            state: ScopeState::Locked,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn token(&self) -> LockToken {
        self.lock.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lock.expires_at
    }

    pub fn lock(&self) -> &LockInfo {
        &self.lock
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn entity(&self) -> &T {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut T {
        &mut self.entity
    }

    /// Persists the entity and releases the lock in one conditional write.
    ///
    /// # Errors
    ///
    /// `LockLost` when the token no longer matches; the stored document is
    /// left untouched.
    pub async fn commit(mut self) -> CoreResult<()> {
        // The stored `_id` survives a replacement, whatever the entity reports.
        let body = self.collection.encode(&self.entity)?;
        let filter = self.collection.scoped(held_filter(self.id, self.lock.token));
        let committed = self
            .collection
            .store()
            .update_one(self.collection.name(), &filter, &Update::replace_with(body))
            .await?;

        if committed {
            self.finish(ScopeState::Committed, "commit", "ok");
            tracing::info!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                "Committed entity scope"
            );
            Ok(())
        } else {
            self.finish(ScopeState::Abandoned, "commit", "lost");
            tracing::warn!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                "Commit rejected, lock was lost"
            );
            Err(CoreError::lock_lost(self.collection.name(), self.id.to_string()))
        }
    }

    /// Releases the lock and discards local changes.
    ///
    /// A lock that was already lost is only logged.
    ///
    /// # Errors
    ///
    /// Store failures; the lock then stays until the lease expires.
    pub async fn abandon(mut self) -> CoreResult<()> {
        let filter = self.collection.scoped(held_filter(self.id, self.lock.token));
        let released = self
            .collection
            .store()
            .update_one(self.collection.name(), &filter, &release_update())
            .await?;

        if released {
            self.finish(ScopeState::Abandoned, "abandon", "ok");
            tracing::info!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                "Abandoned entity scope"
            );
        } else {
            self.finish(ScopeState::Abandoned, "abandon", "lost");
            tracing::warn!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                "Abandon found the lock already lost"
            );
        }
        Ok(())
    }

    /// Flags the document as faulted, keeping it locked for operator action.
    ///
    /// Local entity changes are not persisted.
    ///
    /// # Errors
    ///
    /// `LockLost` when the token no longer matches.
    pub async fn set_error_state(mut self, error: LockErrorInfo) -> CoreResult<()> {
        let filter = self.collection.scoped(held_filter(self.id, self.lock.token));
        let flagged = self
            .collection
            .store()
            .update_one(self.collection.name(), &filter, &error_update(&error)?)
            .await?;

        if flagged {
            self.finish(ScopeState::Error, "error", "ok");
            tracing::warn!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                error = %error.message,
                "Entity scope moved to error state"
            );
            Ok(())
        } else {
            self.finish(ScopeState::Abandoned, "error", "lost");
            tracing::warn!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                "Error state rejected, lock was lost"
            );
            Err(CoreError::lock_lost(self.collection.name(), self.id.to_string()))
        }
    }

    fn finish(&mut self, state: ScopeState, operation: &str, outcome: &str) {
        self.state = state;
        LOCK_OPERATIONS
            .with_label_values(&[self.collection.name(), operation, outcome])
            .inc();
    }
}

impl<T: Entity> Drop for EntityScope<T> {
    fn drop(&mut self) {
        if self.state == ScopeState::Locked {
            tracing::warn!(
                collection = %self.collection.name(),
                id = %self.id,
                token = %self.lock.token,
                expires_at = %self.lock.expires_at,
                "Entity scope dropped while locked; lock remains until lease expiry"
            );
        }
    }
}
