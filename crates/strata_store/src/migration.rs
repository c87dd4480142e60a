//! Chunk migration: move one chunk's documents from a donor shard to a
//! recipient shard with no loss, no duplication, and a short write-blocked
//! critical section.
//!
//! The durable recovery document is the arbiter of truth. It is written
//! before any data moves and deleted only after the outcome is durable on
//! the catalog and the cleanup side effects ran; a crash at any point is
//! resolved deterministically by `recover`, which consults the catalog's
//! migration outcome ledger: committed migrations finish their post-commit
//! cleanup, everything else aborts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::catalog::{CatalogStore, ChunkVersion, KeyRange, ShardId};
use crate::error::StoreError;
use crate::shard::{ShardNode, XferMod};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    Created,
    Cloning,
    Catchup,
    Committed,
    Aborted,
    Done,
}

impl MigrationState {
    fn rank(self) -> u8 {
        match self {
            MigrationState::Created => 0,
            MigrationState::Cloning => 1,
            MigrationState::Catchup => 2,
            MigrationState::Committed => 3,
            MigrationState::Aborted => 3,
            MigrationState::Done => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Aborted | MigrationState::Done)
    }
}

/// Durable record of one migration, written on the coordinator before any
/// data movement. State only moves forward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationRecoveryDocument {
    pub migration_id: Uuid,
    pub collection: Uuid,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    /// The donor chunk's version when the migration started; the commit's
    /// conflict check runs against it.
    pub expected_version: ChunkVersion,
    pub state: MigrationState,
}

/// fjall-backed store of recovery documents, keyed by migration id.
pub struct RecoveryStore {
    partition: PartitionHandle,
}

impl RecoveryStore {
    pub fn open(keyspace: &Keyspace) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition("migration_recovery", PartitionCreateOptions::default())
            .context("open migration recovery partition")?;
        Ok(Self { partition })
    }

    pub fn save(&self, doc: &MigrationRecoveryDocument) -> anyhow::Result<()> {
        if let Some(existing) = self.get(doc.migration_id)? {
            // States of equal rank (Committed vs Aborted) are distinct
            // outcomes; a document may repeat its own state but never swap
            // to the other one.
            anyhow::ensure!(
                doc.state == existing.state || doc.state.rank() > existing.state.rank(),
                "recovery document state may not move backwards ({:?} -> {:?})",
                existing.state,
                doc.state
            );
        }
        let raw = serde_json::to_vec(doc).context("serialize recovery document")?;
        self.partition
            .insert(doc.migration_id.as_bytes(), raw)
            .context("persist recovery document")
    }

    pub fn get(&self, migration_id: Uuid) -> anyhow::Result<Option<MigrationRecoveryDocument>> {
        let Some(raw) = self
            .partition
            .get(migration_id.as_bytes())
            .context("read recovery document")?
        else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&raw).context("parse recovery document")?,
        ))
    }

    pub fn delete(&self, migration_id: Uuid) -> anyhow::Result<()> {
        self.partition
            .remove(migration_id.as_bytes())
            .context("delete recovery document")
    }

    pub fn list(&self) -> anyhow::Result<Vec<MigrationRecoveryDocument>> {
        let mut out = Vec::new();
        for item in self.partition.iter() {
            let (_, raw) = item.context("iterate recovery documents")?;
            out.push(serde_json::from_slice(&raw).context("parse recovery document")?);
        }
        Ok(out)
    }
}

/// What the stalled-migration watchdog should do with a migration that has
/// made no persisted progress for `stalled_for`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogAction {
    Wait,
    /// Before commit nothing has changed ownership; aborting is always safe.
    Abort,
    /// After commit the ownership change is durable; the only way out is
    /// forward, finishing the post-commit cleanup. The cleanup itself runs
    /// in `recover` on the next start; until then the watchdog reports the
    /// migration without touching it.
    ForceFinish,
}

pub fn plan_stalled_migration(
    state: MigrationState,
    stalled_for: Duration,
    stall_timeout: Duration,
) -> WatchdogAction {
    if stalled_for < stall_timeout {
        return WatchdogAction::Wait;
    }
    match state {
        MigrationState::Created | MigrationState::Cloning | MigrationState::Catchup => {
            WatchdogAction::Abort
        }
        MigrationState::Committed => WatchdogAction::ForceFinish,
        MigrationState::Aborted | MigrationState::Done => WatchdogAction::Wait,
    }
}

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Documents per cloning page.
    pub page_size: usize,
    /// Catch-up rounds before the migration gives up as non-converging.
    pub max_catchup_rounds: usize,
    /// A catch-up batch at or below this size is small enough to enter the
    /// critical section.
    pub settle_threshold: usize,
    /// Attempts at taking the write fence before aborting.
    pub fence_attempts: usize,
    pub stall_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            max_catchup_rounds: 8,
            settle_threshold: 16,
            fence_attempts: 3,
            stall_timeout: Duration::from_secs(60),
        }
    }
}

struct ActiveMigration {
    state_rx: watch::Receiver<MigrationState>,
    abort: Arc<AtomicBool>,
    collection: Uuid,
    progress: Arc<Mutex<tokio::time::Instant>>,
}

pub struct MigrationCoordinator {
    catalog: Arc<CatalogStore>,
    shards: HashMap<ShardId, Arc<ShardNode>>,
    recovery: RecoveryStore,
    cfg: MigrationConfig,
    active: Mutex<HashMap<Uuid, ActiveMigration>>,
}

impl MigrationCoordinator {
    pub fn open(
        data_dir: impl AsRef<Path>,
        catalog: Arc<CatalogStore>,
        shards: Vec<Arc<ShardNode>>,
        cfg: MigrationConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let keyspace = fjall::Config::new(data_dir.as_ref())
            .open()
            .context("open migration keyspace")?;
        let recovery = RecoveryStore::open(&keyspace)?;
        Ok(Arc::new(Self {
            catalog,
            shards: shards.into_iter().map(|s| (s.shard_id(), s)).collect(),
            recovery,
            cfg,
            active: Mutex::new(HashMap::new()),
        }))
    }

    fn shard(&self, id: ShardId) -> Result<Arc<ShardNode>, StoreError> {
        self.shards
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("unknown shard {id}")))
    }

    /// Begin moving the chunk exactly covering `range` from `from` to `to`.
    /// Returns once the recovery document is durable; the migration itself
    /// runs in the background (`wait` to observe the outcome).
    pub async fn start(
        self: &Arc<Self>,
        collection: Uuid,
        range: KeyRange,
        from: ShardId,
        to: ShardId,
    ) -> Result<Uuid, StoreError> {
        self.shard(from)?;
        self.shard(to)?;
        let info = self.catalog.get_routing_info(collection)?;
        let Some(chunk) = info
            .chunks
            .iter()
            .find(|c| c.range == range && c.shard == from)
        else {
            return Err(StoreError::ChunkVersionConflict {
                expected: ChunkVersion::default(),
                found: info.chunks_overlapping(&range).next().map(|c| c.version),
            });
        };

        {
            let active = self.active.lock().unwrap();
            if active.values().any(|m| m.collection == collection) {
                return Err(StoreError::LockBusy(format!(
                    "a migration is already running for collection {collection}"
                )));
            }
        }

        let doc = MigrationRecoveryDocument {
            migration_id: Uuid::new_v4(),
            collection,
            range,
            donor: from,
            recipient: to,
            expected_version: chunk.version,
            state: MigrationState::Created,
        };
        self.recovery.save(&doc).map_err(StoreError::Internal)?;
        tracing::info!(
            migration_id = %doc.migration_id,
            collection = %collection,
            from,
            to,
            "migration created"
        );

        let (state_tx, state_rx) = watch::channel(MigrationState::Created);
        let abort = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(Mutex::new(tokio::time::Instant::now()));
        self.active.lock().unwrap().insert(
            doc.migration_id,
            ActiveMigration {
                state_rx,
                abort: abort.clone(),
                collection,
                progress: progress.clone(),
            },
        );

        let migration_id = doc.migration_id;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = coordinator.drive(doc, &state_tx, &abort, &progress).await {
                tracing::error!(migration_id = %migration_id, error = ?err, "migration driver failed");
            }
            coordinator.active.lock().unwrap().remove(&migration_id);
        });
        Ok(migration_id)
    }

    /// Current state of a migration: the live one if running, otherwise the
    /// persisted recovery document, otherwise the catalog outcome.
    pub fn status(&self, migration_id: Uuid) -> Result<Option<MigrationState>, StoreError> {
        if let Some(active) = self.active.lock().unwrap().get(&migration_id) {
            return Ok(Some(*active.state_rx.borrow()));
        }
        if let Some(doc) = self.recovery.get(migration_id).map_err(StoreError::Internal)? {
            return Ok(Some(doc.state));
        }
        if self.catalog.migration_outcome(migration_id).is_some() {
            return Ok(Some(MigrationState::Done));
        }
        Ok(None)
    }

    /// Request cancellation; honored at the next pause point, and only
    /// before commit.
    pub fn abort(&self, migration_id: Uuid) {
        if let Some(active) = self.active.lock().unwrap().get(&migration_id) {
            active.abort.store(true, Ordering::Relaxed);
            tracing::info!(migration_id = %migration_id, "migration abort requested");
        }
    }

    /// Wait for the migration to reach a terminal state.
    pub async fn wait(&self, migration_id: Uuid) -> Result<MigrationState, StoreError> {
        let mut rx = {
            let active = self.active.lock().unwrap();
            match active.get(&migration_id) {
                Some(m) => m.state_rx.clone(),
                None => return self.status(migration_id)?.ok_or_else(|| {
                    StoreError::Internal(anyhow::anyhow!("unknown migration {migration_id}"))
                }),
            }
        };
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                return Ok(*rx.borrow());
            }
        }
    }

    /// Apply the watchdog policy to every live migration. Stalled
    /// pre-commit migrations get their abort flag set; a stalled committed
    /// one is only reported, its leftover cleanup belongs to `recover`.
    pub fn check_stalled(&self) -> Vec<(Uuid, WatchdogAction)> {
        let now = tokio::time::Instant::now();
        let mut out = Vec::new();
        let active = self.active.lock().unwrap();
        for (id, migration) in active.iter() {
            let stalled_for = now - *migration.progress.lock().unwrap();
            let action =
                plan_stalled_migration(*migration.state_rx.borrow(), stalled_for, self.cfg.stall_timeout);
            match action {
                WatchdogAction::Abort => {
                    tracing::warn!(migration_id = %id, ?stalled_for, "watchdog aborting stalled migration");
                    migration.abort.store(true, Ordering::Relaxed);
                }
                WatchdogAction::ForceFinish => {
                    tracing::warn!(migration_id = %id, "watchdog nudging committed migration forward");
                }
                WatchdogAction::Wait => {}
            }
            out.push((*id, action));
        }
        out
    }

    async fn drive(
        self: &Arc<Self>,
        mut doc: MigrationRecoveryDocument,
        state_tx: &watch::Sender<MigrationState>,
        abort: &Arc<AtomicBool>,
        progress: &Arc<Mutex<tokio::time::Instant>>,
    ) -> anyhow::Result<()> {
        let donor = self.shard(doc.donor).map_err(|e| anyhow::anyhow!("{e}"))?;
        let recipient = self.shard(doc.recipient).map_err(|e| anyhow::anyhow!("{e}"))?;

        // Rollback on the donor's replica set must drain us first; our pause
        // point doubles as an abort signal.
        let (op_guard, pause) = donor
            .repl()
            .background_ops()
            .register(format!("chunk migration {}", doc.migration_id));

        let advance = |doc: &mut MigrationRecoveryDocument, state: MigrationState| {
            doc.state = state;
            self.recovery.save(doc)?;
            let _ = state_tx.send(state);
            *progress.lock().unwrap() = tokio::time::Instant::now();
            tracing::info!(migration_id = %doc.migration_id, ?state, "migration state advanced");
            anyhow::Ok(())
        };
        let interrupted = || abort.load(Ordering::Relaxed) || *pause.borrow();

        // --- cloning ---
        advance(&mut doc, MigrationState::Cloning)?;
        donor.begin_capture(doc.collection, doc.range.clone());

        let mut after: Option<Vec<u8>> = None;
        loop {
            if interrupted() {
                return self.finish_aborted(doc, &donor, &recipient, state_tx, "interrupted during cloning").await;
            }
            let page = match donor.fetch_page(
                doc.collection,
                &doc.range,
                after.as_deref(),
                self.cfg.page_size,
            ) {
                Ok(page) => page,
                Err(err) => {
                    return self
                        .finish_aborted(doc, &donor, &recipient, state_tx, &format!("clone read failed: {err}"))
                        .await;
                }
            };
            if page.is_empty() {
                break;
            }
            let next_after = page.last().map(|(k, _)| k.clone());
            if next_after == after {
                // A cursor that stops advancing would loop forever.
                return self
                    .finish_aborted(doc, &donor, &recipient, state_tx, "clone cursor stalled")
                    .await;
            }
            if let Err(err) = recipient.ingest(doc.collection, page, Vec::new()).await {
                return self
                    .finish_aborted(doc, &donor, &recipient, state_tx, &format!("clone write failed: {err}"))
                    .await;
            }
            after = next_after;
            *progress.lock().unwrap() = tokio::time::Instant::now();
        }

        // --- catch-up ---
        advance(&mut doc, MigrationState::Catchup)?;
        let mut rounds = 0usize;
        loop {
            if interrupted() {
                return self.finish_aborted(doc, &donor, &recipient, state_tx, "interrupted during catch-up").await;
            }
            let mods = donor.drain_mods(doc.collection);
            let batch = mods.len();
            if let Err(err) = apply_mods(&recipient, doc.collection, mods).await {
                return self
                    .finish_aborted(doc, &donor, &recipient, state_tx, &format!("catch-up failed: {err}"))
                    .await;
            }
            *progress.lock().unwrap() = tokio::time::Instant::now();
            if batch <= self.cfg.settle_threshold {
                break;
            }
            rounds += 1;
            if rounds >= self.cfg.max_catchup_rounds {
                return self
                    .finish_aborted(doc, &donor, &recipient, state_tx, "catch-up not converging")
                    .await;
            }
        }

        // --- critical section ---
        let mut fenced = false;
        for attempt in 0..self.cfg.fence_attempts {
            match donor.fence_range(doc.collection, doc.range.clone()).await {
                Ok(()) => {
                    fenced = true;
                    break;
                }
                Err(StoreError::LockBusy(reason)) => {
                    tracing::info!(
                        migration_id = %doc.migration_id,
                        attempt,
                        reason,
                        "fence busy; backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => {
                    return self
                        .finish_aborted(doc, &donor, &recipient, state_tx, &format!("fence failed: {err}"))
                        .await;
                }
            }
        }
        if !fenced {
            return self
                .finish_aborted(doc, &donor, &recipient, state_tx, "could not take the write fence")
                .await;
        }

        // The fence is up and in-flight writes have drained, so one more
        // read of the mods buffer catches anything that landed between the
        // last catch-up drain and the fence.
        let final_mods = donor.drain_mods(doc.collection);
        if let Err(err) = apply_mods(&recipient, doc.collection, final_mods).await {
            donor.release_fence(doc.collection);
            return self
                .finish_aborted(doc, &donor, &recipient, state_tx, &format!("final drain failed: {err}"))
                .await;
        }

        let committed = self.catalog.commit_chunk_migration(
            doc.migration_id,
            doc.collection,
            &doc.range,
            doc.donor,
            doc.recipient,
            doc.expected_version,
        );
        match committed {
            Ok(version) => {
                advance(&mut doc, MigrationState::Committed)?;
                tracing::info!(
                    migration_id = %doc.migration_id,
                    major = version.major,
                    "ownership transferred"
                );
            }
            Err(err) => {
                donor.release_fence(doc.collection);
                return self
                    .finish_aborted(doc, &donor, &recipient, state_tx, &format!("commit rejected: {err}"))
                    .await;
            }
        }

        // --- post-commit: never undone, only completed ---
        let _ = donor.refresh_version(doc.collection);
        let _ = recipient.refresh_version(doc.collection);
        donor.end_capture(doc.collection);
        donor.release_fence(doc.collection);
        drop(op_guard);

        if let Err(err) = donor.delete_range(doc.collection, doc.range.clone()).await {
            // The recovery document stays behind in Committed; recovery or
            // the watchdog resumes the deletion later.
            tracing::warn!(
                migration_id = %doc.migration_id,
                error = %err,
                "post-commit range deletion failed; leaving recovery document for resume"
            );
            return Ok(());
        }
        self.recovery.delete(doc.migration_id)?;
        let _ = state_tx.send(MigrationState::Done);
        tracing::info!(migration_id = %doc.migration_id, "migration done");
        Ok(())
    }

    async fn finish_aborted(
        &self,
        mut doc: MigrationRecoveryDocument,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        state_tx: &watch::Sender<MigrationState>,
        reason: &str,
    ) -> anyhow::Result<()> {
        tracing::warn!(migration_id = %doc.migration_id, reason, "migration aborting");
        doc.state = MigrationState::Aborted;
        self.recovery.save(&doc)?;
        donor.end_capture(doc.collection);
        donor.release_fence(doc.collection);
        // Partial recipient-side data is discarded; ownership never changed.
        if let Err(err) = recipient.delete_range(doc.collection, doc.range.clone()).await {
            tracing::warn!(
                migration_id = %doc.migration_id,
                error = %err,
                "abort cleanup failed; recovery will retry"
            );
            let _ = state_tx.send(MigrationState::Aborted);
            return Ok(());
        }
        self.recovery.delete(doc.migration_id)?;
        let _ = state_tx.send(MigrationState::Aborted);
        Ok(())
    }

    /// Resolve every leftover recovery document after a restart. Committed
    /// migrations (per the catalog's outcome ledger) finish their post-commit
    /// cleanup; all others abort. Deterministic and idempotent: replaying any
    /// number of times converges to the same outcome and never re-moves data.
    pub async fn recover(&self) -> Result<Vec<(Uuid, MigrationState)>, StoreError> {
        let mut outcomes = Vec::new();
        for doc in self.recovery.list().map_err(StoreError::Internal)? {
            let donor = self.shard(doc.donor)?;
            let recipient = self.shard(doc.recipient)?;
            let outcome = match self.catalog.migration_outcome(doc.migration_id) {
                Some(version) => {
                    tracing::info!(
                        migration_id = %doc.migration_id,
                        major = version.major,
                        "recovery: migration committed; completing cleanup"
                    );
                    let _ = donor.refresh_version(doc.collection);
                    let _ = recipient.refresh_version(doc.collection);
                    donor.end_capture(doc.collection);
                    donor.release_fence(doc.collection);
                    donor
                        .delete_range(doc.collection, doc.range.clone())
                        .await?;
                    MigrationState::Done
                }
                None => {
                    tracing::info!(
                        migration_id = %doc.migration_id,
                        "recovery: migration never committed; aborting"
                    );
                    donor.end_capture(doc.collection);
                    donor.release_fence(doc.collection);
                    recipient
                        .delete_range(doc.collection, doc.range.clone())
                        .await?;
                    MigrationState::Aborted
                }
            };
            self.recovery
                .delete(doc.migration_id)
                .map_err(StoreError::Internal)?;
            outcomes.push((doc.migration_id, outcome));
        }
        Ok(outcomes)
    }

    /// Test/operator access to the durable recovery documents.
    pub fn recovery_store(&self) -> &RecoveryStore {
        &self.recovery
    }
}

async fn apply_mods(
    recipient: &Arc<ShardNode>,
    collection: Uuid,
    mods: Vec<XferMod>,
) -> Result<(), StoreError> {
    if mods.is_empty() {
        return Ok(());
    }
    let mut items = Vec::new();
    let mut deletes = Vec::new();
    for xfer in mods {
        match xfer {
            XferMod::Put { key, value } => items.push((key, value)),
            XferMod::Delete { key } => deletes.push(key),
        }
    }
    recipient.ingest(collection, items, deletes).await
}
