//! Lease-based locking for the `Lockable` flavor.
//!
//! There is no lock table and no in-process mutex: a claim is one atomic
//! conditional update that succeeds only on an unlocked document or one whose
//! lease has run out. Expired leases are reclaimed lazily by the next acquirer.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use docrepo_core::lock::{claim_update, claimable_filter, release_update, state_filter};
use docrepo_core::metrics::LOCK_OPERATIONS;
use docrepo_core::{
    CoreError, CoreResult, DocumentId, Filter, FindOptions, LockInfo, LockState,
};

use crate::collection::{Collection, CollectionFlavor};
use crate::entity::{decode, Entity};
use crate::scope::EntityScope;

impl<T: Entity> Collection<T> {
    /// Claims the document for exclusive work.
    ///
    /// # Errors
    ///
    /// `NotFound` when the document does not exist, `LockConflict` when it is
    /// held under a live lease or flagged with an error.
    pub async fn acquire(&self, id: DocumentId) -> CoreResult<EntityScope<T>> {
        self.touch();
        self.require_flavor(CollectionFlavor::Lockable)?;

        let lock_config = &self.options().lock;
        let claim = LockInfo::claim(Utc::now(), lock_config.lease(), lock_config.actor.clone());
        let claimed = self
            .store()
            .find_one_and_update(
                self.name(),
                &self.scoped(claimable_filter(id, claim.locked_at)),
                &claim_update(&claim)?,
            )
            .await?;

        match claimed {
            Some(doc) => {
                let entity = decode(doc)?;
                LOCK_OPERATIONS
                    .with_label_values(&[self.name(), "acquire", "ok"])
                    .inc();
                tracing::debug!(
                    collection = %self.name(),
                    id = %id,
                    token = %claim.token,
                    expires_at = %claim.expires_at,
                    "Acquired entity lock"
                );
                Ok(EntityScope::new(self.clone(), id, entity, claim))
            }
            None => {
                let mut err = self
                    .explain_refusal(id, CoreError::not_found(self.name(), id.to_string()))
                    .await;
                // Released or expired between the claim and the re-read.
                if matches!(err, CoreError::NotFound { .. }) && self.exists(id).await? {
                    err = CoreError::lock_conflict(
                        self.name(),
                        id.to_string(),
                        "claim raced with another holder",
                    );
                }
                let outcome = if err.is_lock_conflict() { "conflict" } else { "failed" };
                LOCK_OPERATIONS
                    .with_label_values(&[self.name(), "acquire", outcome])
                    .inc();
                Err(err)
            }
        }
    }

    /// Retries [`acquire`](Self::acquire) on `LockConflict` with the configured
    /// exponential backoff until `timeout` or the attempt limit is reached.
    ///
    /// # Errors
    ///
    /// The last `LockConflict` once retries are exhausted; any other error
    /// immediately.
    pub async fn acquire_with_retry(
        &self,
        id: DocumentId,
        timeout: Duration,
    ) -> CoreResult<EntityScope<T>> {
        let retry = self.options().lock.retry.clone();
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;

        loop {
            match self.acquire(id).await {
                Err(err) if err.is_lock_conflict() => {
                    let delay = retry.backoff_for_attempt(attempt);
                    attempt += 1;
                    if attempt >= retry.max_attempts || Instant::now() + delay > deadline {
                        tracing::debug!(
                            collection = %self.name(),
                            id = %id,
                            attempts = attempt,
                            "Giving up on entity lock"
                        );
                        return Err(err);
                    }
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Current lock of a document, `None` when unlocked.
    ///
    /// # Errors
    ///
    /// `NotFound` when the document does not exist.
    pub async fn lock_info(&self, id: DocumentId) -> CoreResult<Option<LockInfo>> {
        self.touch();
        let doc = self
            .store()
            .find_one(self.name(), &self.scoped(Filter::Id(id)))
            .await?
            .ok_or_else(|| CoreError::not_found(self.name(), id.to_string()))?;
        LockInfo::from_document(&doc)
    }

    /// Documents currently in `locked` state, expired leases included.
    pub async fn list_locked(&self) -> CoreResult<Vec<(T, LockInfo)>> {
        self.list_in_state(LockState::Locked).await
    }

    /// Documents flagged by [`EntityScope::set_error_state`].
    pub async fn list_errored(&self) -> CoreResult<Vec<(T, LockInfo)>> {
        self.list_in_state(LockState::Error).await
    }

    /// Operator action: releases a document left in error state.
    ///
    /// Returns whether a document was released.
    pub async fn clear_error_state(&self, id: DocumentId) -> CoreResult<bool> {
        self.touch();
        self.require_flavor(CollectionFlavor::Lockable)?;
        let cleared = self
            .store()
            .update_one(
                self.name(),
                &self.scoped(Filter::Id(id).and(state_filter(LockState::Error))),
                &release_update(),
            )
            .await?;
        if cleared {
            LOCK_OPERATIONS
                .with_label_values(&[self.name(), "clear_error", "ok"])
                .inc();
            tracing::info!(collection = %self.name(), id = %id, "Cleared entity error state");
        }
        Ok(cleared)
    }

    async fn list_in_state(&self, state: LockState) -> CoreResult<Vec<(T, LockInfo)>> {
        self.touch();
        self.require_flavor(CollectionFlavor::Lockable)?;
        let docs = self
            .store()
            .find(self.name(), &self.scoped(state_filter(state)), &FindOptions::default())
            .await?;

        let mut listed = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(lock) = LockInfo::from_document(&doc)? else {
                continue;
            };
            listed.push((decode(doc)?, lock));
        }
        Ok(listed)
    }
}
