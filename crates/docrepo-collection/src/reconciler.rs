//! Brings a collection's stored indexes in line with its declaration.

use std::fmt;
use std::sync::Arc;

use docrepo_core::metrics::INDEX_ACTIONS;
use docrepo_core::{
    diff_indexes, CoreError, CoreResult, DocumentStore, IndexConfig, IndexModel,
    IndexReconcileMode, IndexSpec,
};

/// Prefix of store-owned primary key indexes, which are never dropped.
const PROTECTED_PREFIX: &str = "_id";

/// Suffix of the side index a recreate builds before touching the live one.
const STAGING_SUFFIX: &str = ".staging";

/// One store mutation needed to remove drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexAction {
    Create(IndexSpec),
    Drop(String),
    /// Replace the stored index with the declared one under the same name.
    ///
    /// The declared spec is first built under a staging name, so a spec the
    /// stored documents cannot satisfy fails before the live index is dropped.
    Recreate(IndexSpec),
}

impl IndexAction {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Create(spec) | Self::Recreate(spec) => &spec.name,
            Self::Drop(name) => name,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Drop(_) => "drop",
            Self::Recreate(_) => "recreate",
        }
    }
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}

/// Compares and reconciles declared indexes against a store.
pub struct IndexReconciler {
    store: Arc<dyn DocumentStore>,
    mode: IndexReconcileMode,
    drop_unknown: bool,
}

impl IndexReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, config: &IndexConfig) -> Self {
        Self {
            store,
            mode: config.mode,
            drop_unknown: config.drop_unknown,
        }
    }

    /// Per-name comparison of declared and stored specs, sorted by name.
    #[must_use]
    pub fn diff(declared: &[IndexSpec], current: &[IndexSpec]) -> Vec<IndexModel> {
        diff_indexes(declared, current)
    }

    /// Actions that remove the drift in `models`.
    ///
    /// Indexes whose name starts with `_id` are never dropped or recreated.
    #[must_use]
    pub fn plan(models: &[IndexModel], drop_unknown: bool) -> Vec<IndexAction> {
        let mut actions = Vec::new();
        for model in models.iter().filter(|model| model.has_drift()) {
            let protected = model.name.starts_with(PROTECTED_PREFIX);
            match (&model.defined, &model.current) {
                (Some(defined), None) => actions.push(IndexAction::Create(defined.clone())),
                (None, Some(_)) if drop_unknown && !protected => {
                    actions.push(IndexAction::Drop(model.name.clone()));
                }
                (Some(defined), Some(_)) if !protected => {
                    actions.push(IndexAction::Recreate(defined.clone()));
                }
                (Some(_), Some(_)) => {
                    tracing::warn!(index = %model.name, "Protected index differs from its declaration");
                }
                _ => {}
            }
        }
        actions
    }

    /// Diffs `declared` against the store and acts according to the mode.
    ///
    /// Returns the report as observed before any change was made.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an invalid declaration, `IndexMismatch` in
    /// fail-fast mode when drift exists, and store failures while fixing.
    pub async fn reconcile(
        &self,
        collection: &str,
        declared: &[IndexSpec],
    ) -> CoreResult<Vec<IndexModel>> {
        for spec in declared {
            spec.validate()?;
        }

        let current = self.store.list_indexes(collection).await?;
        let report = Self::diff(declared, &current);
        let drifted: Vec<String> = report
            .iter()
            .filter(|model| model.has_drift())
            .map(|model| model.name.clone())
            .collect();

        if drifted.is_empty() {
            tracing::debug!(collection = %collection, indexes = report.len(), "Indexes match declaration");
            return Ok(report);
        }

        match self.mode {
            IndexReconcileMode::Disabled => {
                tracing::info!(
                    collection = %collection,
                    drifted = ?drifted,
                    "Index drift detected, reconciliation disabled"
                );
            }
            IndexReconcileMode::FailFast => {
                tracing::error!(collection = %collection, drifted = ?drifted, "Index drift detected");
                return Err(CoreError::IndexMismatch {
                    collection: collection.to_string(),
                    names: drifted,
                });
            }
            IndexReconcileMode::BySchema => {
                for action in Self::plan(&report, self.drop_unknown) {
                    self.execute(collection, &action, &current).await?;
                }
            }
        }
        Ok(report)
    }

    async fn execute(
        &self,
        collection: &str,
        action: &IndexAction,
        current: &[IndexSpec],
    ) -> CoreResult<()> {
        match action {
            IndexAction::Create(spec) => self.store.create_index(collection, spec).await?,
            IndexAction::Drop(name) => {
                self.store.drop_index(collection, name).await?;
            }
            IndexAction::Recreate(spec) => {
                let previous = current.iter().find(|stored| stored.name == spec.name);
                self.recreate(collection, spec, previous).await?;
            }
        }

        INDEX_ACTIONS
            .with_label_values(&[collection, action.kind()])
            .inc();
        tracing::info!(collection = %collection, action = %action, "Reconciled index");
        Ok(())
    }

    /// Swaps a stored index for `spec` without leaving the name unindexed on
    /// failure.
    async fn recreate(
        &self,
        collection: &str,
        spec: &IndexSpec,
        previous: Option<&IndexSpec>,
    ) -> CoreResult<()> {
        let mut staging = spec.clone();
        staging.name = format!("{}{STAGING_SUFFIX}", spec.name);

        // Leftover from an interrupted run.
        self.store.drop_index(collection, &staging.name).await?;
        if let Err(err) = self.store.create_index(collection, &staging).await {
            tracing::warn!(
                collection = %collection,
                index = %spec.name,
                error = %err,
                "Declared index cannot be built, keeping the stored one"
            );
            return Err(err);
        }

        self.store.drop_index(collection, &spec.name).await?;
        if let Err(err) = self.store.create_index(collection, spec).await {
            if let Some(previous) = previous {
                if let Err(restore) = self.store.create_index(collection, previous).await {
                    tracing::error!(
                        collection = %collection,
                        index = %spec.name,
                        error = %restore,
                        "Failed to restore stored index"
                    );
                }
            }
            self.store.drop_index(collection, &staging.name).await?;
            return Err(err);
        }

        self.store.drop_index(collection, &staging.name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, defined: Option<IndexSpec>, current: Option<IndexSpec>) -> IndexModel {
        IndexModel::new(name, current, defined)
    }

    #[test]
    fn test_plan_covers_each_kind_of_drift() {
        let a = IndexSpec::new("a").asc("a");
        let b_declared = IndexSpec::new("b").asc("b").unique();
        let b_stored = IndexSpec::new("b").asc("b");
        let c = IndexSpec::new("c").asc("c");
        let ok = IndexSpec::new("ok").asc("x");

        let models = vec![
            model("a", Some(a.clone()), None),
            model("b", Some(b_declared.clone()), Some(b_stored)),
            model("c", None, Some(c)),
            model("ok", Some(ok.clone()), Some(ok)),
        ];

        assert_eq!(
            IndexReconciler::plan(&models, true),
            vec![
                IndexAction::Create(a.clone()),
                IndexAction::Recreate(b_declared.clone()),
                IndexAction::Drop("c".into()),
            ]
        );
        assert_eq!(
            IndexReconciler::plan(&models, false),
            vec![IndexAction::Create(a), IndexAction::Recreate(b_declared)]
        );
    }

    #[test]
    fn test_plan_never_drops_id_indexes() {
        let models = vec![
            model("_id_", None, Some(IndexSpec::new("_id_").asc("_id"))),
            model(
                "_id_hashed",
                Some(IndexSpec::new("_id_hashed").hashed("_id")),
                Some(IndexSpec::new("_id_hashed").asc("_id")),
            ),
        ];
        assert!(IndexReconciler::plan(&models, true).is_empty());
    }
}
