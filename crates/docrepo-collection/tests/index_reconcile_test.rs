use std::path::PathBuf;
use std::sync::Arc;

use docrepo_collection::{Collection, CollectionFlavor, CollectionOptions, Entity};
use docrepo_core::{
    CoreError, DocumentId, DocumentStore, IndexConfig, IndexReconcileMode, IndexSpec, StoreConfig,
};
use docrepo_store::{open_store, MemoryDocumentStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Customer {
    id: DocumentId,
    email: String,
    region: String,
}

impl Entity for Customer {
    fn id(&self) -> DocumentId {
        self.id
    }

    fn declared_indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::new("by_email").asc("email").unique(),
            IndexSpec::new("by_region").asc("region").desc("email"),
        ]
    }
}

fn temp_db_path() -> PathBuf {
    let filename = format!("docrepo-index-test-{}.db", Uuid::now_v7());
    std::env::temp_dir().join(filename)
}

async fn backends() -> Vec<Arc<dyn DocumentStore>> {
    let sqlite = open_store(&StoreConfig {
        url: format!("sqlite://{}", temp_db_path().display()),
        max_connections: 4,
    })
    .await
    .expect("open sqlite store");
    vec![Arc::new(MemoryDocumentStore::new()), sqlite]
}

fn customers(
    store: &Arc<dyn DocumentStore>,
    mode: IndexReconcileMode,
    drop_unknown: bool,
) -> Collection<Customer> {
    Collection::new(
        Arc::clone(store),
        CollectionOptions::new("customers", CollectionFlavor::Disk)
            .with_index(IndexConfig { mode, drop_unknown }),
    )
    .expect("collection")
}

/// Leaves the store with a stale `by_email`, no `by_region` and an extra index.
async fn seed_drift(store: &Arc<dyn DocumentStore>) {
    store
        .create_index("customers", &IndexSpec::new("by_email").asc("email"))
        .await
        .unwrap();
    store
        .create_index("customers", &IndexSpec::new("legacy").asc("created"))
        .await
        .unwrap();
}

async fn index_names(store: &Arc<dyn DocumentStore>) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_indexes("customers")
        .await
        .unwrap()
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn init_creates_declared_indexes() {
    for store in backends().await {
        let customers = customers(&store, IndexReconcileMode::BySchema, true);

        let report = customers.init().await.unwrap();
        assert!(report.iter().all(|model| model.is_missing()), "{}", store.backend_name());
        assert_eq!(index_names(&store).await, vec!["by_email", "by_region"]);

        let again = customers.init().await.unwrap();
        assert!(again.iter().all(|model| !model.has_drift()));
        assert!(customers.model().await.unwrap().index_healthy);
    }
}

#[tokio::test]
async fn by_schema_recreates_and_drops() {
    for store in backends().await {
        seed_drift(&store).await;
        let customers = customers(&store, IndexReconcileMode::BySchema, true);

        let report = customers.reconcile_indexes().await.unwrap();
        let drifted: Vec<&str> = report
            .iter()
            .filter(|model| model.has_drift())
            .map(|model| model.name.as_str())
            .collect();
        assert_eq!(drifted, vec!["by_email", "by_region", "legacy"]);

        assert_eq!(index_names(&store).await, vec!["by_email", "by_region"]);
        let by_email = store
            .list_indexes("customers")
            .await
            .unwrap()
            .into_iter()
            .find(|spec| spec.name == "by_email")
            .unwrap();
        assert!(by_email.unique, "{}", store.backend_name());
    }
}

#[tokio::test]
async fn by_schema_keeps_unknown_indexes_when_asked() {
    for store in backends().await {
        seed_drift(&store).await;
        let customers = customers(&store, IndexReconcileMode::BySchema, false);

        customers.reconcile_indexes().await.unwrap();
        assert_eq!(
            index_names(&store).await,
            vec!["by_email", "by_region", "legacy"],
            "{}",
            store.backend_name()
        );
        assert!(!customers.model().await.unwrap().index_healthy);
    }
}

#[tokio::test]
async fn fail_fast_refuses_drift_without_changes() {
    for store in backends().await {
        seed_drift(&store).await;
        let customers = customers(&store, IndexReconcileMode::FailFast, true);

        match customers.init().await {
            Err(CoreError::IndexMismatch { collection, names }) => {
                assert_eq!(collection, "customers");
                assert_eq!(names, vec!["by_email", "by_region", "legacy"]);
            }
            other => panic!("{}: expected IndexMismatch, got {other:?}", store.backend_name()),
        }
        assert_eq!(index_names(&store).await, vec!["by_email", "legacy"]);
    }
}

#[tokio::test]
async fn fail_fast_passes_without_drift() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
    for spec in Customer::declared_indexes() {
        store.create_index("customers", &spec).await.unwrap();
    }
    let report = customers(&store, IndexReconcileMode::FailFast, true)
        .init()
        .await
        .unwrap();
    assert_eq!(report.len(), 2);
}

#[tokio::test]
async fn disabled_only_reports() {
    for store in backends().await {
        seed_drift(&store).await;
        let customers = customers(&store, IndexReconcileMode::Disabled, true);

        let report = customers.init().await.unwrap();
        assert_eq!(report.iter().filter(|model| model.has_drift()).count(), 3);
        assert_eq!(
            index_names(&store).await,
            vec!["by_email", "legacy"],
            "{}",
            store.backend_name()
        );

        let model = customers.model().await.unwrap();
        assert!(!model.index_healthy);
        assert_eq!(model.fingerprint.collection_name, "customers");
    }
}

#[tokio::test]
async fn reconciled_unique_index_is_enforced() {
    for store in backends().await {
        let customers = customers(&store, IndexReconcileMode::BySchema, true);
        customers.init().await.unwrap();

        let first = Customer {
            id: DocumentId::new(),
            email: "ada@example.com".into(),
            region: "eu".into(),
        };
        let clash = Customer {
            id: DocumentId::new(),
            ..first.clone()
        };
        customers.insert(&first).await.unwrap();
        let err = customers.insert(&clash).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }), "{}: {err}", store.backend_name());
    }
}

#[tokio::test]
async fn failed_recreate_keeps_the_stored_index() {
    for store in backends().await {
        let name = store.backend_name();
        store
            .create_index("customers", &IndexSpec::new("by_email").asc("email"))
            .await
            .unwrap();
        let customers = customers(&store, IndexReconcileMode::BySchema, true);
        let first = Customer {
            id: DocumentId::new(),
            email: "grace@example.com".into(),
            region: "us".into(),
        };
        let twin = Customer {
            id: DocumentId::new(),
            ..first.clone()
        };
        customers.insert(&first).await.unwrap();
        customers.insert(&twin).await.unwrap();

        // The declared unique spec cannot be built over the duplicate emails.
        let err = customers.reconcile_indexes().await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }), "{name}: {err}");

        let stored = store.list_indexes("customers").await.unwrap();
        assert_eq!(stored.len(), 1, "{name}: {stored:?}");
        assert_eq!(stored[0], IndexSpec::new("by_email").asc("email"), "{name}");

        // Once the data is fixed the same reconcile goes through.
        customers.delete(twin.id).await.unwrap();
        customers.reconcile_indexes().await.unwrap();
        assert_eq!(index_names(&store).await, vec!["by_email", "by_region"], "{name}");
    }
}
