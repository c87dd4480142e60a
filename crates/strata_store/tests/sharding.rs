//! End-to-end sharding tests: routing, migration, recovery.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use strata_store::catalog::{CatalogStore, KeyRange};
use strata_store::error::StoreError;
use strata_store::migration::{
    MigrationConfig, MigrationCoordinator, MigrationRecoveryDocument, MigrationState,
};
use strata_store::router::{ClientOp, ClientResponse, KeyQuery, Router};
use strata_store::shard::{ShardNode, ShardNodeConfig};

struct TestCluster {
    catalog: Arc<CatalogStore>,
    shards: Vec<Arc<ShardNode>>,
    router: Arc<Router>,
    coordinator: Arc<MigrationCoordinator>,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    fn shard(&self, id: u64) -> &Arc<ShardNode> {
        &self.shards[(id - 1) as usize]
    }

    fn new_router(&self) -> Router {
        Router::new(self.catalog.clone(), self.shards.clone())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_cluster() -> TestCluster {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(CatalogStore::open(dir.path().join("catalog.json")).unwrap());
    let mut shards = Vec::new();
    for id in [1u64, 2] {
        shards.push(
            ShardNode::launch(
                ShardNodeConfig::new(id),
                dir.path().join(format!("shard-{id}")),
                catalog.clone(),
            )
            .await
            .unwrap(),
        );
    }
    let router = Arc::new(Router::new(catalog.clone(), shards.clone()));
    let coordinator = MigrationCoordinator::open(
        dir.path().join("coordinator"),
        catalog.clone(),
        shards.clone(),
        MigrationConfig {
            page_size: 32,
            max_catchup_rounds: 50,
            ..MigrationConfig::default()
        },
    )
    .unwrap();
    TestCluster {
        catalog,
        shards,
        router,
        coordinator,
        _dir: dir,
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("{i:03}").into_bytes()
}

/// Collection split at key "050", both halves initially on shard 1.
fn split_collection(cluster: &TestCluster) -> Uuid {
    let info = cluster
        .catalog
        .create_collection("{_id: 1}", vec![(KeyRange::full(), 1)])
        .unwrap();
    cluster
        .catalog
        .split_chunk(info.collection, &KeyRange::full(), &[key(50)])
        .unwrap();
    info.collection
}

async fn put(router: &Router, coll: Uuid, i: u32) {
    let resp = router
        .execute(
            coll,
            ClientOp::Put {
                key: key(i),
                value: format!("doc-{i}").into_bytes(),
                session: None,
            },
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(matches!(resp, ClientResponse::Ack));
}

async fn scan_all(router: &Router, coll: Uuid) -> Vec<(Vec<u8>, Vec<u8>)> {
    match router
        .execute(
            coll,
            ClientOp::Scan {
                query: KeyQuery::All,
                page_size: 64,
            },
            Duration::from_secs(10),
        )
        .await
        .unwrap()
    {
        ClientResponse::Docs(docs) => docs,
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn migration_with_concurrent_writes_loses_and_duplicates_nothing() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);
    let tail = KeyRange::new(key(50), vec![]);

    // Pre-existing documents across the whole key space.
    for i in 0..100 {
        put(&cluster.router, coll, i).await;
    }

    // Concurrent writer on fresh keys while the chunk moves.
    let writer_router = Arc::new(cluster.new_router());
    let writer = {
        let router = writer_router.clone();
        tokio::spawn(async move {
            for i in 100..300 {
                put(&router, coll, i).await;
            }
        })
    };

    let migration = cluster
        .coordinator
        .start(coll, tail.clone(), 1, 2)
        .await
        .unwrap();
    let outcome = cluster.coordinator.wait(migration).await.unwrap();
    assert_eq!(outcome, MigrationState::Done);
    writer.await.unwrap();

    // Ownership moved in the catalog and the chunks still tile the space.
    let info = cluster.catalog.get_routing_info(coll).unwrap();
    assert_eq!(info.chunk_owning(&key(75)).unwrap().shard, 2);
    assert_eq!(info.chunk_owning(&key(25)).unwrap().shard, 1);
    assert_eq!(info.chunks.len(), 2);
    assert_eq!(info.chunks[0].range.max, info.chunks[1].range.min);

    // Every document exactly once, across both shards.
    let docs = scan_all(&cluster.router, coll).await;
    assert_eq!(docs.len(), 300);
    let mut keys: Vec<Vec<u8>> = docs.iter().map(|(k, _)| k.clone()).collect();
    keys.dedup();
    assert_eq!(keys.len(), 300);
    for i in 0..300 {
        assert!(keys.contains(&key(i)), "missing key {i}");
    }

    // The donor's copy of the moved range is gone; exactly one shard is
    // authoritative for every key.
    assert_eq!(cluster.shard(1).count_range(coll, &tail).unwrap(), 0);
    let tail_count = cluster.shard(2).count_range(coll, &tail).unwrap();
    let head_count = cluster
        .shard(1)
        .count_range(coll, &KeyRange::new(vec![], key(50)))
        .unwrap();
    assert_eq!(tail_count + head_count, 300);

    // The recovery document is gone.
    assert!(cluster
        .coordinator
        .recovery_store()
        .list()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn stale_router_cache_heals_with_exactly_one_refresh() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);
    for i in 0..100 {
        put(&cluster.router, coll, i).await;
    }

    // Warm a second router's cache, then migrate behind its back.
    let stale_router = cluster.new_router();
    assert_eq!(scan_all(&stale_router, coll).await.len(), 100);
    let refreshes_before = stale_router.refresh_count();

    let migration = cluster
        .coordinator
        .start(coll, KeyRange::new(key(50), vec![]), 1, 2)
        .await
        .unwrap();
    assert_eq!(
        cluster.coordinator.wait(migration).await.unwrap(),
        MigrationState::Done
    );

    // A write into the moved range succeeds with no user-visible error and
    // exactly one internal refresh.
    put(&stale_router, coll, 75).await;
    assert_eq!(stale_router.refresh_count(), refreshes_before + 1);

    match stale_router
        .execute(
            coll,
            ClientOp::Get { key: key(75) },
            Duration::from_secs(10),
        )
        .await
        .unwrap()
    {
        ClientResponse::Doc(Some(v)) => assert_eq!(v, b"doc-75"),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn abort_before_any_progress_discards_recipient_data() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);
    for i in 0..100 {
        put(&cluster.router, coll, i).await;
    }

    let tail = KeyRange::new(key(50), vec![]);
    let migration = cluster
        .coordinator
        .start(coll, tail.clone(), 1, 2)
        .await
        .unwrap();
    // The driver task has not run yet on this runtime; the abort lands
    // before its first pause point.
    cluster.coordinator.abort(migration);
    let outcome = cluster.coordinator.wait(migration).await.unwrap();
    assert_eq!(outcome, MigrationState::Aborted);

    // No ownership change, no recipient-side leftovers, no recovery doc.
    let info = cluster.catalog.get_routing_info(coll).unwrap();
    assert_eq!(info.chunk_owning(&key(75)).unwrap().shard, 1);
    assert_eq!(cluster.shard(2).count_range(coll, &tail).unwrap(), 0);
    assert!(cluster
        .coordinator
        .recovery_store()
        .list()
        .unwrap()
        .is_empty());
    assert_eq!(cluster.coordinator.status(migration).unwrap(), None);
}

#[tokio::test]
async fn concurrent_migration_on_same_collection_is_lock_busy() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);

    let first = cluster
        .coordinator
        .start(coll, KeyRange::new(key(50), vec![]), 1, 2)
        .await
        .unwrap();
    let err = cluster
        .coordinator
        .start(coll, KeyRange::new(vec![], key(50)), 1, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockBusy(_)));

    assert_eq!(
        cluster.coordinator.wait(first).await.unwrap(),
        MigrationState::Done
    );
}

#[tokio::test]
async fn recovery_aborts_uncommitted_and_completes_committed() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);
    for i in 0..100 {
        put(&cluster.router, coll, i).await;
    }
    let tail = KeyRange::new(key(50), vec![]);

    // Crash mid-clone: a recovery document exists, some documents were
    // already copied, the catalog never recorded a commit.
    let half_cloned = MigrationRecoveryDocument {
        migration_id: Uuid::new_v4(),
        collection: coll,
        range: tail.clone(),
        donor: 1,
        recipient: 2,
        expected_version: cluster
            .catalog
            .get_routing_info(coll)
            .unwrap()
            .chunk_owning(&key(75))
            .unwrap()
            .version,
        state: MigrationState::Cloning,
    };
    cluster
        .coordinator
        .recovery_store()
        .save(&half_cloned)
        .unwrap();
    let partial: Vec<(Vec<u8>, Vec<u8>)> =
        (50..60).map(|i| (key(i), b"partial".to_vec())).collect();
    cluster.shard(2).ingest(coll, partial, vec![]).await.unwrap();
    assert_eq!(cluster.shard(2).count_range(coll, &tail).unwrap(), 10);

    let outcomes = cluster.coordinator.recover().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, MigrationState::Aborted);
    assert_eq!(cluster.shard(2).count_range(coll, &tail).unwrap(), 0);
    // The donor kept everything; nothing changed in the catalog.
    assert_eq!(cluster.shard(1).count_range(coll, &tail).unwrap(), 50);

    // Replaying recovery with no documents left is a no-op.
    assert!(cluster.coordinator.recover().await.unwrap().is_empty());

    // Crash after commit: the catalog has the outcome, the donor still
    // holds its stale copy, the recovery document survived.
    let expected = cluster
        .catalog
        .get_routing_info(coll)
        .unwrap()
        .chunk_owning(&key(75))
        .unwrap()
        .version;
    let committed = MigrationRecoveryDocument {
        migration_id: Uuid::new_v4(),
        collection: coll,
        range: tail.clone(),
        donor: 1,
        recipient: 2,
        expected_version: expected,
        state: MigrationState::Committed,
    };
    cluster
        .catalog
        .commit_chunk_migration(committed.migration_id, coll, &tail, 1, 2, expected)
        .unwrap();
    cluster
        .coordinator
        .recovery_store()
        .save(&committed)
        .unwrap();

    let outcomes = cluster.coordinator.recover().await.unwrap();
    assert_eq!(outcomes, vec![(committed.migration_id, MigrationState::Done)]);
    assert_eq!(cluster.shard(1).count_range(coll, &tail).unwrap(), 0);

    // A stale duplicate of the same document resolves to the same outcome
    // without moving any data again.
    cluster
        .coordinator
        .recovery_store()
        .save(&committed)
        .unwrap();
    let recipient_count = cluster.shard(2).count_range(coll, &tail).unwrap();
    let outcomes = cluster.coordinator.recover().await.unwrap();
    assert_eq!(outcomes, vec![(committed.migration_id, MigrationState::Done)]);
    assert_eq!(
        cluster.shard(2).count_range(coll, &tail).unwrap(),
        recipient_count
    );
}

#[tokio::test]
async fn expired_deadline_surfaces_timeout_and_leaves_no_cursors() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);
    for i in 0..50 {
        put(&cluster.router, coll, i).await;
    }

    let err = cluster
        .router
        .execute(
            coll,
            ClientOp::Scan {
                query: KeyQuery::All,
                page_size: 8,
            },
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ExceededTimeLimit));
    assert_eq!(cluster.shard(1).open_cursors(), 0);
    assert_eq!(cluster.shard(2).open_cursors(), 0);
}

#[tokio::test]
async fn retryable_write_resolves_maybe_committed_ambiguity() {
    let cluster = spawn_cluster().await;
    let coll = split_collection(&cluster);

    let session = strata_store::shard::StatementId {
        session_id: Uuid::new_v4(),
        statement_id: 1,
    };
    for value in [b"v1".to_vec(), b"v2".to_vec()] {
        let resp = cluster
            .router
            .execute(
                coll,
                ClientOp::Put {
                    key: key(10),
                    value,
                    session: Some(session),
                },
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(matches!(resp, ClientResponse::Ack));
    }
    match cluster
        .router
        .execute(coll, ClientOp::Get { key: key(10) }, Duration::from_secs(10))
        .await
        .unwrap()
    {
        ClientResponse::Doc(Some(v)) => assert_eq!(v, b"v1"),
        other => panic!("unexpected response: {other:?}"),
    }
}
