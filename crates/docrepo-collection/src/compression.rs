//! Age-based compression of time-series entities.
//!
//! A sweep walks every document of a collection, picks the retention tier for
//! its age and folds documents that share a group key and a period of the
//! tier's granularity into the oldest of them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use docrepo_core::metrics::COMPRESSION_REMOVED;
use docrepo_core::{
    get_strata_at, CompressionConfig, CoreError, CoreResult, DocumentId, Filter, FindOptions,
    Granularity, LockInfo, Strata, Update, ID_FIELD, LOCK_FIELD,
};

use crate::collection::Collection;
use crate::entity::{decode, Entity};

/// An entity whose records can be folded together as they age.
pub trait Compressible: Entity {
    /// Point in time the record describes.
    fn timestamp(&self) -> DateTime<Utc>;

    fn set_timestamp(&mut self, timestamp: DateTime<Utc>);

    /// Records are only folded with records of the same key.
    fn group_key(&self) -> String;

    /// Absorbs a newer record of the same group and period.
    fn merge(&mut self, other: Self);
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionReport {
    /// Unlocked documents read by the sweep.
    pub examined: usize,
    /// Buckets folded into a single document.
    pub folded_groups: usize,
    /// Documents deleted after being merged.
    pub removed: usize,
    /// Documents left alone because they hold a lock.
    pub skipped_locked: usize,
}

type BucketKey = (String, Granularity, DateTime<Utc>);

impl<T: Compressible> Collection<T> {
    /// Runs one sweep against the current time.
    pub async fn compress(&self, stratas: &[Strata]) -> CoreResult<CompressionReport> {
        self.compress_at(stratas, Utc::now()).await
    }

    /// Runs one sweep, aging documents against `now`.
    ///
    /// Buffered collections are flushed first. Every write is conditioned on
    /// the document carrying no lock and still holding the body the sweep
    /// read. A record written or claimed mid-sweep is left out of its bucket,
    /// and when the survivor itself changed the absorbed records are put back.
    ///
    /// # Errors
    ///
    /// Store and serialization failures; buckets folded before the failure
    /// stay folded.
    pub async fn compress_at(
        &self,
        stratas: &[Strata],
        now: DateTime<Utc>,
    ) -> CoreResult<CompressionReport> {
        self.touch();
        let mut report = CompressionReport::default();
        if stratas.is_empty() {
            return Ok(report);
        }
        if self.inner.buffer.is_some() {
            self.flush().await?;
        }

        let docs = self
            .store()
            .find(self.name(), &self.scoped(Filter::All), &FindOptions::default())
            .await?;

        let mut buckets: BTreeMap<BucketKey, Vec<(T, Value)>> = BTreeMap::new();
        for doc in docs {
            if LockInfo::from_document(&doc)?.is_some() {
                report.skipped_locked += 1;
                continue;
            }
            report.examined += 1;

            let entity: T = decode(doc.clone())?;
            let Some(tier) = get_strata_at(stratas, entity.timestamp(), now) else {
                continue;
            };
            if tier.compress_per == Granularity::None {
                continue;
            }
            let start = tier.compress_per.truncate(entity.timestamp());
            buckets
                .entry((entity.group_key(), tier.compress_per, start))
                .or_default()
                .push((entity, doc));
        }

        for ((group, granularity, start), mut members) in buckets {
            if members.len() < 2 {
                continue;
            }
            members.sort_by_key(|(member, _)| member.timestamp());

            let mut members = members.into_iter();
            let Some((mut survivor, survivor_read)) = members.next() else {
                continue;
            };
            let survivor_id = survivor.id();

            // Absorbed records go first, each only while it still matches what
            // was read, so a concurrent write is never merged from a stale copy.
            let mut absorbed = Vec::new();
            for (member, read) in members {
                let id = member.id();
                if self.store().delete_one(self.name(), &self.unchanged(id, &read)).await? {
                    absorbed.push((id, read));
                    survivor.merge(member);
                } else {
                    tracing::warn!(
                        collection = %self.name(),
                        group = %group,
                        id = %id,
                        "Record changed since the sweep read it, leaving it out of the fold"
                    );
                }
            }
            if absorbed.is_empty() {
                continue;
            }
            survivor.set_timestamp(start);

            let written = self
                .store()
                .update_one(
                    self.name(),
                    &self.unchanged(survivor_id, &survivor_read),
                    &Update::replace_with(self.encode(&survivor)?),
                )
                .await?;
            if !written {
                tracing::warn!(
                    collection = %self.name(),
                    group = %group,
                    id = %survivor_id,
                    restored = absorbed.len(),
                    "Survivor changed since the sweep read it, restoring the bucket"
                );
                self.store().insert_many(self.name(), absorbed).await?;
                continue;
            }

            let removed = absorbed.len();
            report.folded_groups += 1;
            report.removed += removed;
            COMPRESSION_REMOVED
                .with_label_values(&[self.name(), granularity.as_str()])
                .inc_by(removed as u64);
        }

        tracing::info!(
            collection = %self.name(),
            examined = report.examined,
            folded_groups = report.folded_groups,
            removed = report.removed,
            skipped_locked = report.skipped_locked,
            "Compression sweep finished"
        );
        Ok(report)
    }

    /// Matches `id` only while it is unlocked and every field still holds the
    /// value in `read`.
    fn unchanged(&self, id: DocumentId, read: &Value) -> Filter {
        let mut filter = Filter::Id(id).and(Filter::is_null(LOCK_FIELD));
        if let Value::Object(fields) = read {
            for (field, value) in fields {
                if field == ID_FIELD || field == LOCK_FIELD {
                    continue;
                }
                filter = filter.and(Filter::Eq(field.clone(), value.clone()));
            }
        }
        self.scoped(filter)
    }
}

/// Background task running [`Collection::compress`] on a fixed period.
///
/// The task is aborted on [`shutdown`](Self::shutdown) or drop.
pub struct CompressionWorker {
    collection: String,
    worker: Option<JoinHandle<()>>,
}

impl CompressionWorker {
    /// Spawns the worker; the first sweep runs immediately.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a zero `interval`.
    pub fn start<T: Compressible>(
        collection: Collection<T>,
        stratas: Vec<Strata>,
        interval: Duration,
    ) -> CoreResult<Self> {
        if interval.is_zero() {
            return Err(CoreError::ValidationError(
                "compression worker interval must be > 0".to_string(),
            ));
        }

        let name = collection.name().to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                if let Err(e) = collection.compress(&stratas).await {
                    tracing::error!(collection = %collection.name(), error = %e, "Compression sweep failed");
                }
            }
        });

        tracing::info!(
            collection = %name,
            "Compression worker started (interval: {:?})",
            interval
        );
        Ok(Self {
            collection: name,
            worker: Some(handle),
        })
    }

    /// Starts a worker when compression is enabled in `config`.
    ///
    /// # Errors
    ///
    /// `ValidationError` when enabled with a zero interval.
    pub fn from_config<T: Compressible>(
        collection: &Collection<T>,
        config: &CompressionConfig,
    ) -> CoreResult<Option<Self>> {
        if !config.enabled {
            tracing::debug!(collection = %collection.name(), "Compression disabled");
            return Ok(None);
        }
        Self::start(
            collection.clone(),
            config.stratas.clone(),
            config.worker_interval(),
        )
        .map(Some)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            handle.abort();
            tracing::info!(collection = %self.collection, "Compression worker shut down");
        }
    }
}

impl Drop for CompressionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
