//! One shard: a replicated log driving a fjall-backed document store, plus
//! the donor/recipient hooks the migration protocol needs (mod capture,
//! range fences, paged cloning) and the version gate routers hit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_repl::repl::{
    ApplyResult, CountingClock, LocalMesh, LogEntry, OpPayload, ReplNode, ReplNodeConfig,
    ReplicaSetConfig, StateMachine,
};

use crate::catalog::{CatalogStore, ChunkVersion, KeyRange, ShardId};
use crate::error::StoreError;
use crate::storage::DocumentStore;

/// Retryable-write identity carried by client writes. One statement applies
/// at most once per session no matter how often it is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementId {
    pub session_id: Uuid,
    pub statement_id: u64,
}

/// Replicated command, dispatched once in the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ShardCommand {
    Put {
        collection: Uuid,
        key: Vec<u8>,
        value: Vec<u8>,
        session: Option<StatementId>,
    },
    Delete {
        collection: Uuid,
        key: Vec<u8>,
        session: Option<StatementId>,
    },
    /// Migration clone/catch-up traffic on the recipient.
    BulkPut {
        collection: Uuid,
        items: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Post-commit cleanup on the donor, abort cleanup on the recipient.
    DeleteRange {
        collection: Uuid,
        range: KeyRange,
    },
}

/// One in-flight write captured for migration catch-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferMod {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Operation fragment a router sends to one shard.
#[derive(Clone, Debug)]
pub enum ShardOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        session: Option<StatementId>,
    },
    Delete {
        key: Vec<u8>,
        session: Option<StatementId>,
    },
    Get {
        key: Vec<u8>,
    },
    Scan {
        range: KeyRange,
        page_size: usize,
    },
}

#[derive(Clone, Debug)]
pub enum ShardResponse {
    Ack,
    Doc(Option<Vec<u8>>),
    Docs {
        items: Vec<(Vec<u8>, Vec<u8>)>,
        /// Present when the page filled up and more documents remain.
        cursor: Option<u64>,
    },
}

struct CaptureState {
    range: KeyRange,
    mods: Vec<XferMod>,
}

#[derive(Default)]
struct RuntimeState {
    /// Installed shard version per collection, the value routers' attached
    /// versions are checked against.
    versions: HashMap<Uuid, ChunkVersion>,
    capture: HashMap<Uuid, CaptureState>,
    fences: HashMap<Uuid, KeyRange>,
    /// Writes currently between fence check and applied, per collection.
    in_flight: HashMap<Uuid, usize>,
}

/// Replicated state machine for one shard. `apply` is idempotent: plain
/// puts/deletes are naturally so, session-tagged writes dedup via durable
/// statement markers, so recovery replay is safe.
struct ShardMachine {
    shard_id: ShardId,
    docs: DocumentStore,
    runtime: Mutex<RuntimeState>,
}

impl ShardMachine {
    fn record_mod(&self, collection: Uuid, xfer: XferMod) {
        let mut rt = self.runtime.lock().unwrap();
        if let Some(capture) = rt.capture.get_mut(&collection) {
            let key = match &xfer {
                XferMod::Put { key, .. } | XferMod::Delete { key } => key,
            };
            if capture.range.contains(key) {
                capture.mods.push(xfer);
            }
        }
    }
}

impl StateMachine for ShardMachine {
    fn apply(&self, entry: &LogEntry) -> anyhow::Result<ApplyResult> {
        let OpPayload::Application(raw) = &entry.operation else {
            return Ok(ApplyResult { index: entry.index });
        };
        let command: ShardCommand =
            serde_json::from_slice(raw).context("decode shard command")?;
        match command {
            ShardCommand::Put {
                collection,
                key,
                value,
                session,
            } => {
                if let Some(id) = session {
                    if !self
                        .docs
                        .mark_statement_executed(id.session_id, id.statement_id)?
                    {
                        tracing::debug!(
                            shard = self.shard_id,
                            session = %id.session_id,
                            statement = id.statement_id,
                            "skipping already-executed statement"
                        );
                        return Ok(ApplyResult { index: entry.index });
                    }
                }
                self.docs.put(collection, &key, &value)?;
                self.record_mod(collection, XferMod::Put { key, value });
            }
            ShardCommand::Delete {
                collection,
                key,
                session,
            } => {
                if let Some(id) = session {
                    if !self
                        .docs
                        .mark_statement_executed(id.session_id, id.statement_id)?
                    {
                        return Ok(ApplyResult { index: entry.index });
                    }
                }
                self.docs.delete(collection, &key)?;
                self.record_mod(collection, XferMod::Delete { key });
            }
            ShardCommand::BulkPut { collection, items } => {
                for (key, value) in items {
                    self.docs.put(collection, &key, &value)?;
                }
            }
            ShardCommand::DeleteRange { collection, range } => {
                self.docs.delete_range(collection, &range)?;
            }
        }
        Ok(ApplyResult { index: entry.index })
    }
}

#[derive(Clone, Debug)]
pub struct ShardNodeConfig {
    pub shard_id: ShardId,
    /// How long a client write waits behind a migration critical section.
    pub fence_wait: Duration,
    /// How long a fence waits for in-flight writes to quiesce before it
    /// gives up with `LockBusy`.
    pub fence_quiesce: Duration,
}

impl ShardNodeConfig {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            fence_wait: Duration::from_secs(2),
            fence_quiesce: Duration::from_secs(2),
        }
    }
}

struct Cursor {
    collection: Uuid,
    range: KeyRange,
    after: Vec<u8>,
    page_size: usize,
}

/// One shard node, leader of its own (here single-member) replica set.
pub struct ShardNode {
    cfg: ShardNodeConfig,
    repl: Arc<ReplNode>,
    machine: Arc<ShardMachine>,
    catalog: Arc<CatalogStore>,
    fence_released: tokio::sync::Notify,
    quiesced: tokio::sync::Notify,
    cursors: Mutex<HashMap<u64, Cursor>>,
    next_cursor: AtomicU64,
}

impl ShardNode {
    /// Open the shard's storage and stand up its replica set.
    pub async fn launch(
        cfg: ShardNodeConfig,
        data_dir: impl AsRef<Path>,
        catalog: Arc<CatalogStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref();
        let keyspace = fjall::Config::new(data_dir.join("fjall"))
            .open()
            .context("open shard keyspace")?;
        let docs = DocumentStore::open(keyspace, cfg.shard_id)?;
        let machine = Arc::new(ShardMachine {
            shard_id: cfg.shard_id,
            docs,
            runtime: Mutex::new(RuntimeState::default()),
        });

        let mesh = LocalMesh::new();
        let repl = ReplNode::open(
            ReplNodeConfig::new(1),
            ReplicaSetConfig::with_voters([1]),
            data_dir.join("repl.wal"),
            machine.clone(),
            mesh.transport_for(1),
            Arc::new(CountingClock::default()),
        )?;
        mesh.register(repl.clone());
        repl.start();
        repl.campaign().await;

        tracing::info!(shard = cfg.shard_id, dir = %data_dir.display(), "shard node up");
        Ok(Arc::new(Self {
            cfg,
            repl,
            machine,
            catalog,
            fence_released: tokio::sync::Notify::new(),
            quiesced: tokio::sync::Notify::new(),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        }))
    }

    pub fn shard_id(&self) -> ShardId {
        self.cfg.shard_id
    }

    pub fn repl(&self) -> &Arc<ReplNode> {
        &self.repl
    }

    /// The shard's installed version for `collection`, refreshing from the
    /// catalog when nothing is installed yet.
    pub fn installed_version(&self, collection: Uuid) -> Result<ChunkVersion, StoreError> {
        {
            let rt = self.machine.runtime.lock().unwrap();
            if let Some(v) = rt.versions.get(&collection) {
                return Ok(*v);
            }
        }
        self.refresh_version(collection)
    }

    /// Re-read this shard's version from the catalog and install it.
    pub fn refresh_version(&self, collection: Uuid) -> Result<ChunkVersion, StoreError> {
        let info = self.catalog.get_routing_info(collection)?;
        let version = info.shard_version(self.cfg.shard_id);
        let mut rt = self.machine.runtime.lock().unwrap();
        rt.versions.insert(collection, version);
        Ok(version)
    }

    fn check_version(
        &self,
        collection: Uuid,
        attached: ChunkVersion,
    ) -> Result<(), StoreError> {
        let installed = self.installed_version(collection)?;
        if installed == attached {
            return Ok(());
        }
        // The router may simply be ahead of us; refresh once before
        // declaring anyone stale.
        let installed = self.refresh_version(collection)?;
        if installed == attached {
            return Ok(());
        }
        tracing::debug!(
            shard = self.cfg.shard_id,
            collection = %collection,
            ?attached,
            ?installed,
            "version mismatch"
        );
        Err(StoreError::StaleConfig {
            shard: self.cfg.shard_id,
            attached,
            installed,
        })
    }

    /// Execute one version-checked operation fragment.
    pub async fn execute(
        &self,
        collection: Uuid,
        attached: ChunkVersion,
        op: ShardOp,
    ) -> Result<ShardResponse, StoreError> {
        self.check_version(collection, attached)?;
        match op {
            ShardOp::Put { key, value, session } => {
                self.replicated_write(
                    collection,
                    attached,
                    &key,
                    ShardCommand::Put {
                        collection,
                        key: key.clone(),
                        value,
                        session,
                    },
                )
                .await?;
                Ok(ShardResponse::Ack)
            }
            ShardOp::Delete { key, session } => {
                self.replicated_write(
                    collection,
                    attached,
                    &key,
                    ShardCommand::Delete {
                        collection,
                        key: key.clone(),
                        session,
                    },
                )
                .await?;
                Ok(ShardResponse::Ack)
            }
            ShardOp::Get { key } => {
                let doc = self.machine.docs.get(collection, &key).map_err(StoreError::Internal)?;
                Ok(ShardResponse::Doc(doc))
            }
            ShardOp::Scan { range, page_size } => self.scan(collection, range, page_size),
        }
    }

    /// Client write path: wait out any fence covering the key, then propose
    /// through the replicated log.
    async fn replicated_write(
        &self,
        collection: Uuid,
        attached: ChunkVersion,
        key: &[u8],
        command: ShardCommand,
    ) -> Result<(), StoreError> {
        let deadline = tokio::time::Instant::now() + self.cfg.fence_wait;
        loop {
            let blocked = {
                let mut rt = self.machine.runtime.lock().unwrap();
                match rt.fences.get(&collection) {
                    Some(fence) if fence.contains(key) => true,
                    _ => {
                        *rt.in_flight.entry(collection).or_insert(0) += 1;
                        false
                    }
                }
            };
            if !blocked {
                break;
            }
            let released = self.fence_released.notified();
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(StoreError::ExceededTimeLimit);
            }
            // A fence usually means a migration critical section. If it
            // committed while we waited, our ownership view is gone; recheck
            // so the write reroutes instead of landing on the old owner.
            self.check_version(collection, attached)?;
        }

        let raw = serde_json::to_vec(&command).context("encode shard command")?;
        let result = self.repl.propose(Bytes::from(raw)).await;

        {
            let mut rt = self.machine.runtime.lock().unwrap();
            if let Some(count) = rt.in_flight.get_mut(&collection) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.quiesced.notify_waiters();
                }
            }
        }
        result?;
        Ok(())
    }

    fn scan(
        &self,
        collection: Uuid,
        range: KeyRange,
        page_size: usize,
    ) -> Result<ShardResponse, StoreError> {
        let items = self
            .machine
            .docs
            .scan_page(collection, &range, None, page_size)
            .map_err(StoreError::Internal)?;
        let cursor = if items.len() >= page_size {
            let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
            self.cursors.lock().unwrap().insert(
                id,
                Cursor {
                    collection,
                    range,
                    after: items.last().map(|(k, _)| k.clone()).unwrap_or_default(),
                    page_size,
                },
            );
            Some(id)
        } else {
            None
        };
        Ok(ShardResponse::Docs { items, cursor })
    }

    /// Continue a scan cursor. The cursor is retired once exhausted.
    pub fn get_more(&self, cursor_id: u64) -> Result<ShardResponse, StoreError> {
        let (collection, range, after, page_size) = {
            let cursors = self.cursors.lock().unwrap();
            let cursor = cursors
                .get(&cursor_id)
                .ok_or_else(|| anyhow::anyhow!("unknown cursor {cursor_id}"))?;
            (
                cursor.collection,
                cursor.range.clone(),
                cursor.after.clone(),
                cursor.page_size,
            )
        };
        let items = self
            .machine
            .docs
            .scan_page(collection, &range, Some(&after), page_size)
            .map_err(StoreError::Internal)?;
        let mut cursors = self.cursors.lock().unwrap();
        if items.len() >= page_size {
            if let Some(cursor) = cursors.get_mut(&cursor_id) {
                cursor.after = items.last().map(|(k, _)| k.clone()).unwrap_or_default();
            }
            Ok(ShardResponse::Docs {
                items,
                cursor: Some(cursor_id),
            })
        } else {
            cursors.remove(&cursor_id);
            Ok(ShardResponse::Docs {
                items,
                cursor: None,
            })
        }
    }

    /// Release server-side cursor state. Called by routers on deadline
    /// expiry so no idle cursors linger.
    pub fn kill_cursor(&self, cursor_id: u64) {
        if self.cursors.lock().unwrap().remove(&cursor_id).is_some() {
            tracing::debug!(shard = self.cfg.shard_id, cursor_id, "killed cursor");
        }
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }

    // --- migration hooks (donor side) ---

    /// Start capturing writes in `range` into the xfer-mods buffer.
    pub fn begin_capture(&self, collection: Uuid, range: KeyRange) {
        let mut rt = self.machine.runtime.lock().unwrap();
        rt.capture.insert(
            collection,
            CaptureState {
                range,
                mods: Vec::new(),
            },
        );
    }

    /// Take everything captured so far. Later captures keep accumulating, so
    /// a second drain picks up exactly the mods that arrived in between.
    pub fn drain_mods(&self, collection: Uuid) -> Vec<XferMod> {
        let mut rt = self.machine.runtime.lock().unwrap();
        rt.capture
            .get_mut(&collection)
            .map(|c| std::mem::take(&mut c.mods))
            .unwrap_or_default()
    }

    pub fn end_capture(&self, collection: Uuid) {
        self.machine.runtime.lock().unwrap().capture.remove(&collection);
    }

    /// One page of existing documents for the cloning phase.
    pub fn fetch_page(
        &self,
        collection: Uuid,
        range: &KeyRange,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.machine
            .docs
            .scan_page(collection, range, after, limit)
            .map_err(StoreError::Internal)
    }

    /// Block new writes to `range` and wait for in-flight writes to drain.
    /// Fails with `LockBusy` rather than waiting unboundedly; the caller
    /// releases and retries instead of deadlocking.
    pub async fn fence_range(
        &self,
        collection: Uuid,
        range: KeyRange,
    ) -> Result<(), StoreError> {
        {
            let mut rt = self.machine.runtime.lock().unwrap();
            if rt.fences.contains_key(&collection) {
                return Err(StoreError::LockBusy(format!(
                    "collection {collection} already fenced"
                )));
            }
            rt.fences.insert(collection, range);
        }
        let deadline = tokio::time::Instant::now() + self.cfg.fence_quiesce;
        loop {
            let pending = {
                let rt = self.machine.runtime.lock().unwrap();
                rt.in_flight.get(&collection).copied().unwrap_or(0)
            };
            if pending == 0 {
                tracing::debug!(shard = self.cfg.shard_id, collection = %collection, "range fenced");
                return Ok(());
            }
            let quiesced = self.quiesced.notified();
            if tokio::time::timeout_at(deadline, quiesced).await.is_err() {
                self.release_fence(collection);
                return Err(StoreError::LockBusy(
                    "in-flight writes did not quiesce under the fence".into(),
                ));
            }
        }
    }

    pub fn release_fence(&self, collection: Uuid) {
        self.machine.runtime.lock().unwrap().fences.remove(&collection);
        self.fence_released.notify_waiters();
    }

    // --- migration hooks (recipient side) ---

    /// Ingest cloned documents or drained xfer-mods through this shard's own
    /// replicated log.
    pub async fn ingest(
        &self,
        collection: Uuid,
        items: Vec<(Vec<u8>, Vec<u8>)>,
        deletes: Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        if !items.is_empty() {
            let raw = serde_json::to_vec(&ShardCommand::BulkPut { collection, items })
                .context("encode bulk put")?;
            self.repl.propose(Bytes::from(raw)).await?;
        }
        for key in deletes {
            let raw = serde_json::to_vec(&ShardCommand::Delete {
                collection,
                key,
                session: None,
            })
            .context("encode delete")?;
            self.repl.propose(Bytes::from(raw)).await?;
        }
        Ok(())
    }

    /// Replicated range deletion: donor post-commit cleanup and recipient
    /// abort cleanup.
    pub async fn delete_range(
        &self,
        collection: Uuid,
        range: KeyRange,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(&ShardCommand::DeleteRange { collection, range })
            .context("encode range deletion")?;
        self.repl.propose(Bytes::from(raw)).await?;
        Ok(())
    }

    /// Direct count, used by tests and the migration coordinator's progress
    /// accounting.
    pub fn count_range(&self, collection: Uuid, range: &KeyRange) -> Result<usize, StoreError> {
        self.machine
            .docs
            .count_range(collection, range)
            .map_err(StoreError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn launch_shard(dir: &Path, shard: ShardId) -> (Arc<ShardNode>, Arc<CatalogStore>, Uuid) {
        let catalog = Arc::new(CatalogStore::open(dir.join("catalog.json")).unwrap());
        let info = catalog
            .create_collection("{_id: 1}", vec![(KeyRange::full(), shard)])
            .unwrap();
        let node = ShardNode::launch(
            ShardNodeConfig::new(shard),
            dir.join(format!("shard-{shard}")),
            catalog.clone(),
        )
        .await
        .unwrap();
        (node, catalog, info.collection)
    }

    #[tokio::test]
    async fn versioned_write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (node, catalog, coll) = launch_shard(dir.path(), 1).await;
        let version = catalog.get_routing_info(coll).unwrap().shard_version(1);

        let resp = node
            .execute(
                coll,
                version,
                ShardOp::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                    session: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(resp, ShardResponse::Ack));

        match node
            .execute(coll, version, ShardOp::Get { key: b"k1".to_vec() })
            .await
            .unwrap()
        {
            ShardResponse::Doc(Some(v)) => assert_eq!(v, b"v1"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_version_is_stale_config() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _catalog, coll) = launch_shard(dir.path(), 1).await;
        let bogus = ChunkVersion::new(Uuid::new_v4(), 9, 9);
        let err = node
            .execute(coll, bogus, ShardOp::Get { key: b"k".to_vec() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleConfig { shard: 1, .. }));
    }

    #[tokio::test]
    async fn capture_records_only_in_range_mods() {
        let dir = tempfile::tempdir().unwrap();
        let (node, catalog, coll) = launch_shard(dir.path(), 1).await;
        let version = catalog.get_routing_info(coll).unwrap().shard_version(1);

        node.begin_capture(coll, KeyRange::new(b"m".to_vec(), vec![]));
        for key in [b"a".to_vec(), b"n".to_vec(), b"z".to_vec()] {
            node.execute(
                coll,
                version,
                ShardOp::Put {
                    key,
                    value: b"v".to_vec(),
                    session: None,
                },
            )
            .await
            .unwrap();
        }
        let mods = node.drain_mods(coll);
        assert_eq!(mods.len(), 2);
        assert!(node.drain_mods(coll).is_empty());

        // Mods arriving after a drain land in the next drain.
        node.execute(
            coll,
            version,
            ShardOp::Delete {
                key: b"z".to_vec(),
                session: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            node.drain_mods(coll),
            vec![XferMod::Delete { key: b"z".to_vec() }]
        );
        node.end_capture(coll);
    }

    #[tokio::test]
    async fn fenced_range_blocks_writes_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let (node, catalog, coll) = launch_shard(dir.path(), 1).await;
        let version = catalog.get_routing_info(coll).unwrap().shard_version(1);

        node.fence_range(coll, KeyRange::new(b"m".to_vec(), vec![]))
            .await
            .unwrap();

        // A write outside the fenced range proceeds.
        node.execute(
            coll,
            version,
            ShardOp::Put {
                key: b"a".to_vec(),
                value: b"v".to_vec(),
                session: None,
            },
        )
        .await
        .unwrap();

        // A write inside it blocks until the fence lifts.
        let node2 = node.clone();
        let blocked = tokio::spawn(async move {
            node2
                .execute(
                    coll,
                    version,
                    ShardOp::Put {
                        key: b"z".to_vec(),
                        value: b"v".to_vec(),
                        session: None,
                    },
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        node.release_fence(coll);
        blocked.await.unwrap().unwrap();
        match node
            .execute(coll, version, ShardOp::Get { key: b"z".to_vec() })
            .await
            .unwrap()
        {
            ShardResponse::Doc(found) => assert!(found.is_some()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_fence_is_lock_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _catalog, coll) = launch_shard(dir.path(), 1).await;
        node.fence_range(coll, KeyRange::full()).await.unwrap();
        let err = node.fence_range(coll, KeyRange::full()).await.unwrap_err();
        assert!(matches!(err, StoreError::LockBusy(_)));
        node.release_fence(coll);
    }

    #[tokio::test]
    async fn session_statement_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let (node, catalog, coll) = launch_shard(dir.path(), 1).await;
        let version = catalog.get_routing_info(coll).unwrap().shard_version(1);
        let session = Some(StatementId {
            session_id: Uuid::new_v4(),
            statement_id: 7,
        });

        for value in [b"first".to_vec(), b"second".to_vec()] {
            node.execute(
                coll,
                version,
                ShardOp::Put {
                    key: b"k".to_vec(),
                    value,
                    session,
                },
            )
            .await
            .unwrap();
        }
        // The retried statement did not overwrite the first application.
        match node
            .execute(coll, version, ShardOp::Get { key: b"k".to_vec() })
            .await
            .unwrap()
        {
            ShardResponse::Doc(Some(v)) => assert_eq!(v, b"first"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_cursor_is_retired() {
        let dir = tempfile::tempdir().unwrap();
        let (node, catalog, coll) = launch_shard(dir.path(), 1).await;
        let version = catalog.get_routing_info(coll).unwrap().shard_version(1);
        for i in 0..7u32 {
            node.execute(
                coll,
                version,
                ShardOp::Put {
                    key: format!("{i:03}").into_bytes(),
                    value: b"v".to_vec(),
                    session: None,
                },
            )
            .await
            .unwrap();
        }

        let ShardResponse::Docs { items, cursor } = node
            .execute(
                coll,
                version,
                ShardOp::Scan {
                    range: KeyRange::full(),
                    page_size: 3,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected docs");
        };
        assert_eq!(items.len(), 3);
        let cursor = cursor.unwrap();
        assert_eq!(node.open_cursors(), 1);

        let mut total = items.len();
        let mut cursor = Some(cursor);
        while let Some(id) = cursor {
            let ShardResponse::Docs { items, cursor: next } = node.get_more(id).unwrap() else {
                panic!("expected docs");
            };
            total += items.len();
            cursor = next;
        }
        assert_eq!(total, 7);
        assert_eq!(node.open_cursors(), 0);
    }
}
