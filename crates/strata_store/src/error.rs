//! Error taxonomy surfaced at operation boundaries.
//!
//! Transient errors (`NotLeader`, `StaleConfig`, `InterruptedDueToReplStateChange`,
//! `LockBusy`) get at least one retry at the layer that owns the relevant
//! cache before reaching a client. `ChunkVersionConflict` is a genuine race:
//! refresh authoritative state, never blind-retry.

use strata_repl::repl::{NodeId, ReplError};

use crate::catalog::{ChunkVersion, ShardId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The targeted shard's installed version for the namespace differs from
    /// the version the router attached to the request.
    #[error("stale config on shard {shard}: attached {attached:?}, installed {installed:?}")]
    StaleConfig {
        shard: ShardId,
        attached: ChunkVersion,
        installed: ChunkVersion,
    },

    #[error("interrupted due to replication state change")]
    InterruptedDueToReplStateChange,

    /// A DDL-style lock could not be acquired within its bounded wait.
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// The chunk's current version does not match what the caller believed.
    #[error("chunk version conflict (expected {expected:?}, found {found:?})")]
    ChunkVersionConflict {
        expected: ChunkVersion,
        found: Option<ChunkVersion>,
    },

    #[error("exceeded time limit")]
    ExceededTimeLimit,

    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::NotLeader { .. }
                | StoreError::StaleConfig { .. }
                | StoreError::InterruptedDueToReplStateChange
                | StoreError::LockBusy(_)
        )
    }

    /// Rank used when a fan-out sees several failures and must report the
    /// most severe one. Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            StoreError::NotLeader { .. } => 1,
            StoreError::StaleConfig { .. } => 2,
            StoreError::InterruptedDueToReplStateChange => 3,
            StoreError::LockBusy(_) => 4,
            StoreError::ExceededTimeLimit => 5,
            StoreError::ChunkVersionConflict { .. } => 6,
            StoreError::MigrationAborted(_) => 7,
            StoreError::Internal(_) => 8,
        }
    }

    /// Of `self` and `other`, keep the more severe.
    pub fn merge(self, other: StoreError) -> StoreError {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl From<ReplError> for StoreError {
    fn from(err: ReplError) -> Self {
        match err {
            ReplError::NotLeader { leader_hint } => StoreError::NotLeader { leader_hint },
            ReplError::InterruptedDueToReplStateChange => {
                StoreError::InterruptedDueToReplStateChange
            }
            ReplError::ExceededTimeLimit => StoreError::ExceededTimeLimit,
            ReplError::Shutdown => StoreError::Internal(anyhow::anyhow!("replication shut down")),
            ReplError::ConfigVersionConflict { expected, found } => StoreError::Internal(
                anyhow::anyhow!("replica set config version conflict: expected {expected}, found {found}"),
            ),
            ReplError::Internal(err) => StoreError::Internal(err),
        }
    }
}
