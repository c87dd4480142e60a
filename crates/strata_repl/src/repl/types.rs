//! Shared types for the replication engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the transport/state-machine layers.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical node identifier within a replica set.
pub type NodeId = u64;
/// Election term.
pub type Term = u64;
/// Position in the replicated log. Index 0 means "before the first entry".
pub type LogIndex = u64;

/// Externally-supplied logical timestamp used to pick consistent read points
/// across shards. The engine only stamps and carries it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTime(pub u64);

/// Source of logical timestamps for commit stamping.
pub trait LogicalClock: Send + Sync + 'static {
    fn now(&self) -> LogicalTime;
}

/// Monotonic counter clock, sufficient when no cross-shard snapshot reads are
/// in play.
#[derive(Default)]
pub struct CountingClock {
    next: std::sync::atomic::AtomicU64,
}

impl LogicalClock for CountingClock {
    fn now(&self) -> LogicalTime {
        LogicalTime(
            self.next
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1,
        )
    }
}

/// Payload carried by one log entry.
///
/// Dispatch happens once here: application commands stay opaque to the
/// engine, while configuration changes are interpreted by the engine itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    Application(Bytes),
    Reconfig(ReplicaSetConfig),
}

/// One immutable entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub operation: OpPayload,
    pub commit_timestamp: Option<LogicalTime>,
}

/// One replica-set member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub node_id: NodeId,
    pub host: String,
    /// Voting weight; 0 means non-voting.
    pub votes: u32,
    /// Election priority; 0 means never electable.
    pub priority: u32,
}

impl MemberConfig {
    pub fn voter(node_id: NodeId, host: impl Into<String>) -> Self {
        Self {
            node_id,
            host: host.into(),
            votes: 1,
            priority: 1,
        }
    }

    pub fn is_voting(&self) -> bool {
        self.votes > 0
    }

    pub fn is_electable(&self) -> bool {
        self.votes > 0 && self.priority > 0
    }
}

/// Replica-set membership, mutated only through quorum reconfiguration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    pub members: Vec<MemberConfig>,
    pub config_version: u64,
    pub term: Term,
}

impl ReplicaSetConfig {
    pub fn with_voters(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: ids
                .into_iter()
                .map(|id| MemberConfig::voter(id, format!("node-{id}")))
                .collect(),
            config_version: 1,
            term: 0,
        }
    }

    pub fn member(&self, node_id: NodeId) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.node_id == node_id)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &MemberConfig> {
        self.members.iter().filter(|m| m.is_voting())
    }

    /// Majority of the voting membership.
    pub fn majority(&self) -> usize {
        (self.voting_members().count() / 2) + 1
    }

    pub fn peer_ids(&self, self_id: NodeId) -> Vec<NodeId> {
        self.members
            .iter()
            .map(|m| m.node_id)
            .filter(|id| *id != self_id)
            .collect()
    }
}

/// Per-node replication role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Replication error taxonomy surfaced verbatim to callers.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The operation requires the leader; a hint to the believed leader is
    /// attached when known.
    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// Leadership was lost while the operation was in flight. The outcome is
    /// unknown: callers resolve via the idempotent retry discipline of the
    /// operation itself (session/statement ids at the API boundary).
    #[error("interrupted due to replication state change")]
    InterruptedDueToReplStateChange,

    /// A bounded wait expired before its condition held.
    #[error("exceeded time limit")]
    ExceededTimeLimit,

    /// Reconfiguration raced with another config change.
    #[error("replica set config version conflict (expected {expected}, found {found})")]
    ConfigVersionConflict { expected: u64, found: u64 },

    #[error("replication node is shut down")]
    Shutdown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of applying one committed entry against the storage engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyResult {
    pub index: LogIndex,
}

/// Application-specific state machine driven by the commit point.
///
/// `apply` must be durable and idempotent: entries may be re-applied on
/// recovery replay.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &LogEntry) -> anyhow::Result<ApplyResult>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success: highest index now matching the leader. On failure: the
    /// follower's best-guess match point, used to rewind `next_index`.
    pub match_index: LogIndex,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub config_version: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Transport interface for replication RPCs.
///
/// The engine is transport-agnostic; concrete implementations can use gRPC,
/// in-memory channels, or test harnesses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn request_vote(
        &self,
        target: NodeId,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse>;
}
