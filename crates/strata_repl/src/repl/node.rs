//! The replication engine: one `ReplNode` per replica of a shard.
//!
//! Roles follow the usual follower/candidate/leader cycle. `propose` returns
//! once a majority of voting members have durably acknowledged the entry;
//! the commit point never regresses; uncommitted suffixes may be rolled back
//! on leadership change, gated on draining registered background operations.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::background::BackgroundOps;
use super::types::*;
use super::wal::{HardState, ReplWal};

/// Tuning for one replication node.
#[derive(Clone, Debug)]
pub struct ReplNodeConfig {
    pub node_id: NodeId,
    /// Randomized election timeout range.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound for point-to-point RPC waits used by protocol steps.
    pub rpc_timeout: Duration,
    /// End-to-end timeout for one propose attempt.
    pub propose_timeout: Duration,
    /// Bounded wait for background operations before a rollback truncation.
    pub rollback_drain_timeout: Duration,
    /// Maximum entries shipped in one append round.
    pub max_entries_per_append: usize,
}

impl ReplNodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(200),
            propose_timeout: Duration::from_secs(5),
            rollback_drain_timeout: Duration::from_secs(10),
            max_entries_per_append: 256,
        }
    }
}

struct LeaderState {
    next_index: BTreeMap<NodeId, LogIndex>,
    match_index: BTreeMap<NodeId, LogIndex>,
}

struct Inner {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    /// Contiguous log starting at index 1. Never compacted here; snapshotting
    /// belongs to the storage engine.
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    config: ReplicaSetConfig,
    leader_hint: Option<NodeId>,
    election_deadline: Instant,
    leader_state: Option<LeaderState>,
}

impl Inner {
    fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entry_at(index).map(|e| e.term)
    }

    fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_log_index() {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = (start + max).min(self.log.len());
        self.log[start..end].to_vec()
    }

    fn reset_election_deadline(&mut self, cfg: &ReplNodeConfig) {
        let min = cfg.election_timeout_min;
        let max = cfg.election_timeout_max.max(min + Duration::from_millis(1));
        let jitter = rand::thread_rng().gen_range(min..max);
        self.election_deadline = Instant::now() + jitter;
    }
}

/// One replica of a shard's replicated log.
pub struct ReplNode {
    cfg: ReplNodeConfig,
    inner: Mutex<Inner>,
    wal: Mutex<ReplWal>,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn LogicalClock>,
    background_ops: Arc<BackgroundOps>,
    commit_notify: Notify,
    apply_lock: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
}

impl ReplNode {
    /// Open the node's durable log and build the engine. Call `start` to
    /// spawn the election and heartbeat loops.
    pub fn open(
        cfg: ReplNodeConfig,
        initial_config: ReplicaSetConfig,
        wal_path: impl AsRef<std::path::Path>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn LogicalClock>,
    ) -> anyhow::Result<Arc<Self>> {
        let (wal, entries, hard) = ReplWal::open(wal_path)?;

        // The newest replicated config in the log supersedes the seed config.
        let mut config = initial_config;
        for entry in &entries {
            if let OpPayload::Reconfig(c) = &entry.operation {
                config = c.clone();
            }
        }

        let mut inner = Inner {
            role: Role::Follower,
            current_term: hard.term,
            voted_for: hard.voted_for,
            log: entries,
            commit_index: 0,
            last_applied: 0,
            config,
            leader_hint: None,
            election_deadline: Instant::now(),
            leader_state: None,
        };
        inner.reset_election_deadline(&cfg);

        Ok(Arc::new(Self {
            cfg,
            inner: Mutex::new(inner),
            wal: Mutex::new(wal),
            state_machine,
            transport,
            clock,
            background_ops: BackgroundOps::new(),
            commit_notify: Notify::new(),
            apply_lock: tokio::sync::Mutex::new(()),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Spawn the election and heartbeat drivers.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(15));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if node.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let due = {
                    let inner = node.inner.lock().unwrap();
                    inner.role != Role::Leader && Instant::now() >= inner.election_deadline
                };
                if due {
                    node.run_election().await;
                }
            }
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.cfg.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if node.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                node.broadcast_heartbeats();
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn role(&self) -> Role {
        self.inner.lock().unwrap().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.inner.lock().unwrap().current_term
    }

    /// Monotonically non-decreasing; entries at or below are never rolled
    /// back.
    pub fn committed_up_to(&self) -> LogIndex {
        self.inner.lock().unwrap().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().unwrap().last_applied
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.inner.lock().unwrap().last_log_index()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().leader_hint
    }

    pub fn config(&self) -> ReplicaSetConfig {
        self.inner.lock().unwrap().config.clone()
    }

    /// Registry used by long-running operations that must be drained before
    /// rollback may truncate the log.
    pub fn background_ops(&self) -> Arc<BackgroundOps> {
        Arc::clone(&self.background_ops)
    }

    /// Propose an application operation; returns once a majority of voting
    /// members have durably acknowledged it.
    pub async fn propose(self: &Arc<Self>, operation: Bytes) -> Result<LogEntry, ReplError> {
        self.propose_payload(OpPayload::Application(operation)).await
    }

    /// Quorum reconfiguration: replicated like any entry, effective on
    /// append.
    pub async fn reconfigure(
        self: &Arc<Self>,
        members: Vec<MemberConfig>,
        expected_version: u64,
    ) -> Result<ReplicaSetConfig, ReplError> {
        let new_config = {
            let inner = self.inner.lock().unwrap();
            if inner.config.config_version != expected_version {
                return Err(ReplError::ConfigVersionConflict {
                    expected: expected_version,
                    found: inner.config.config_version,
                });
            }
            ReplicaSetConfig {
                members,
                config_version: expected_version + 1,
                term: inner.current_term,
            }
        };
        self.propose_payload(OpPayload::Reconfig(new_config.clone()))
            .await?;
        Ok(new_config)
    }

    async fn propose_payload(self: &Arc<Self>, payload: OpPayload) -> Result<LogEntry, ReplError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(ReplError::Shutdown);
        }

        let (entry, term, self_voting) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return Err(ReplError::NotLeader {
                    leader_hint: inner.leader_hint,
                });
            }
            let index = inner.last_log_index() + 1;
            let entry = LogEntry {
                term: inner.current_term,
                index,
                operation: payload,
                commit_timestamp: Some(self.clock.now()),
            };
            if let OpPayload::Reconfig(config) = &entry.operation {
                inner.config = config.clone();
            }
            inner.log.push(entry.clone());
            self.wal
                .lock()
                .unwrap()
                .append_entries(std::slice::from_ref(&entry))?;
            if let Some(ls) = inner.leader_state.as_mut() {
                ls.match_index.insert(self.cfg.node_id, index);
            }
            let self_voting = inner
                .config
                .member(self.cfg.node_id)
                .map(|m| m.is_voting())
                .unwrap_or(false);
            (entry, inner.current_term, self_voting)
        };

        let deadline = Instant::now() + self.cfg.propose_timeout;
        let mut acked: HashSet<NodeId> = HashSet::new();
        if self_voting {
            acked.insert(self.cfg.node_id);
        }

        loop {
            let (peers, majority, voting_ids) = {
                let inner = self.inner.lock().unwrap();
                if inner.role != Role::Leader || inner.current_term != term {
                    return Err(ReplError::InterruptedDueToReplStateChange);
                }
                let voting_ids: HashSet<NodeId> =
                    inner.config.voting_members().map(|m| m.node_id).collect();
                (
                    inner.config.peer_ids(self.cfg.node_id),
                    inner.config.majority(),
                    voting_ids,
                )
            };

            if acked.iter().filter(|id| voting_ids.contains(id)).count() >= majority {
                break;
            }

            let mut set = JoinSet::new();
            for peer in peers {
                if acked.contains(&peer) {
                    continue;
                }
                let node = Arc::clone(self);
                let target = entry.index;
                set.spawn(async move { (peer, node.replicate_to(peer, target, term).await) });
            }

            let mut progressed = false;
            while let Ok(joined) = tokio::time::timeout_at(deadline, set.join_next()).await {
                let Some(joined) = joined else { break };
                if let Ok((peer, true)) = joined {
                    acked.insert(peer);
                    progressed = true;
                }
                let votes = acked.iter().filter(|id| voting_ids.contains(id)).count();
                if votes >= majority {
                    break;
                }
            }
            set.abort_all();

            let votes = acked.iter().filter(|id| voting_ids.contains(id)).count();
            if votes >= majority {
                break;
            }
            if Instant::now() >= deadline {
                let inner = self.inner.lock().unwrap();
                if inner.role != Role::Leader || inner.current_term != term {
                    return Err(ReplError::InterruptedDueToReplStateChange);
                }
                return Err(ReplError::ExceededTimeLimit);
            }
            if !progressed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader || inner.current_term != term {
                return Err(ReplError::InterruptedDueToReplStateChange);
            }
            if entry.index > inner.commit_index {
                inner.commit_index = entry.index;
            }
        }
        self.commit_notify.notify_waiters();
        self.apply_committed().await;
        Ok(entry)
    }

    /// Voluntary leadership relinquishment.
    ///
    /// Succeeds only once a majority of voting members, including at least
    /// one electable secondary, have caught up to the leader's last log
    /// index; otherwise fails with `ExceededTimeLimit` at the deadline.
    /// Stepping down never drops committed writes below majority durability.
    pub async fn step_down(self: &Arc<Self>, catch_up_deadline: Duration) -> Result<(), ReplError> {
        let deadline = Instant::now() + catch_up_deadline;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.role != Role::Leader {
                    return Err(ReplError::NotLeader {
                        leader_hint: inner.leader_hint,
                    });
                }
                let last = inner.last_log_index();
                let mut caught_up = 0usize;
                let mut electable_secondary_current = false;
                if let Some(ls) = inner.leader_state.as_ref() {
                    for member in inner.config.voting_members() {
                        let matched = if member.node_id == self.cfg.node_id {
                            last
                        } else {
                            ls.match_index.get(&member.node_id).copied().unwrap_or(0)
                        };
                        if matched >= last {
                            caught_up += 1;
                            if member.node_id != self.cfg.node_id && member.is_electable() {
                                electable_secondary_current = true;
                            }
                        }
                    }
                }
                if caught_up >= inner.config.majority() && electable_secondary_current {
                    let term = inner.current_term;
                    tracing::info!(
                        node_id = self.cfg.node_id,
                        term,
                        caught_up,
                        "stepping down: quorum caught up"
                    );
                    inner.role = Role::Follower;
                    inner.leader_state = None;
                    inner.leader_hint = None;
                    // Give another node a full timeout to win before we
                    // would stand again.
                    inner.election_deadline = Instant::now() + self.cfg.election_timeout_max * 2;
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(ReplError::ExceededTimeLimit);
            }
            // Heartbeats keep pushing entries; just wait for match indexes.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Trigger an election now. Used by tests and by operators to force a
    /// deterministic first leader.
    pub async fn campaign(self: &Arc<Self>) {
        self.run_election().await;
    }

    /// Wait until the commit point reaches `index`.
    pub async fn wait_for_commit(
        &self,
        index: LogIndex,
        timeout: Duration,
    ) -> Result<(), ReplError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.committed_up_to() >= index {
                return Ok(());
            }
            let notified = self.commit_notify.notified();
            if self.committed_up_to() >= index {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ReplError::ExceededTimeLimit);
            }
        }
    }

    fn persist_hard_locked(&self, inner: &MutexGuard<'_, Inner>) {
        let hard = HardState {
            term: inner.current_term,
            voted_for: inner.voted_for,
        };
        if let Err(err) = self.wal.lock().unwrap().save_hard_state(hard) {
            // A node that cannot persist its vote must not keep running: it
            // could vote twice in one term after restart.
            tracing::error!(error = ?err, "failed to persist hard state");
            panic!("wal hard-state persistence failed: {err:#}");
        }
    }

    fn become_follower_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        term: Term,
        leader_hint: Option<NodeId>,
    ) {
        if term > inner.current_term {
            inner.current_term = term;
            inner.voted_for = None;
            self.persist_hard_locked(inner);
        }
        if inner.role != Role::Follower {
            tracing::info!(
                node_id = self.cfg.node_id,
                term = inner.current_term,
                "becoming follower"
            );
        }
        inner.role = Role::Follower;
        inner.leader_state = None;
        if leader_hint.is_some() {
            inner.leader_hint = leader_hint;
        }
        inner.reset_election_deadline(&self.cfg);
    }

    async fn run_election(self: &Arc<Self>) {
        let (req, peers, majority, term) = {
            let mut inner = self.inner.lock().unwrap();
            let electable = inner
                .config
                .member(self.cfg.node_id)
                .map(|m| m.is_electable())
                .unwrap_or(false);
            if !electable {
                inner.reset_election_deadline(&self.cfg);
                return;
            }
            inner.role = Role::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.cfg.node_id);
            self.persist_hard_locked(&inner);
            inner.reset_election_deadline(&self.cfg);
            let req = RequestVoteRequest {
                term: inner.current_term,
                candidate_id: self.cfg.node_id,
                last_log_index: inner.last_log_index(),
                last_log_term: inner.last_log_term(),
                config_version: inner.config.config_version,
            };
            tracing::debug!(
                node_id = self.cfg.node_id,
                term = inner.current_term,
                "starting election"
            );
            (
                req,
                inner.config.peer_ids(self.cfg.node_id),
                inner.config.majority(),
                inner.current_term,
            )
        };

        let mut granted = 1usize; // self-vote; electability was checked above
        if granted >= majority {
            let mut inner = self.inner.lock().unwrap();
            if inner.role == Role::Candidate && inner.current_term == term {
                self.become_leader_locked(&mut inner, granted);
                drop(inner);
                self.broadcast_heartbeats();
            }
            return;
        }

        let mut set = JoinSet::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let rpc_timeout = self.cfg.rpc_timeout;
            set.spawn(async move {
                let resp =
                    tokio::time::timeout(rpc_timeout, transport.request_vote(peer, req)).await;
                (peer, resp)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((peer, Ok(Ok(resp)))) = joined else {
                continue;
            };
            let mut inner = self.inner.lock().unwrap();
            if resp.term > inner.current_term {
                self.become_follower_locked(&mut inner, resp.term, None);
                return;
            }
            if inner.role != Role::Candidate || inner.current_term != term {
                return;
            }
            if !resp.vote_granted {
                continue;
            }
            let voting = inner
                .config
                .member(peer)
                .map(|m| m.is_voting())
                .unwrap_or(false);
            if !voting {
                continue;
            }
            granted += 1;
            if granted >= majority {
                self.become_leader_locked(&mut inner, granted);
                drop(inner);
                self.broadcast_heartbeats();
                return;
            }
        }
    }

    fn become_leader_locked(&self, inner: &mut MutexGuard<'_, Inner>, granted: usize) {
        tracing::info!(
            node_id = self.cfg.node_id,
            term = inner.current_term,
            granted,
            "won election"
        );
        let last = inner.last_log_index();
        let mut next_index = BTreeMap::new();
        let mut match_index = BTreeMap::new();
        for id in inner.config.peer_ids(self.cfg.node_id) {
            next_index.insert(id, last + 1);
            match_index.insert(id, 0);
        }
        match_index.insert(self.cfg.node_id, last);
        inner.role = Role::Leader;
        inner.leader_hint = Some(self.cfg.node_id);
        inner.leader_state = Some(LeaderState {
            next_index,
            match_index,
        });
    }

    /// Fire one replication round at every peer. Heartbeats carry any suffix
    /// the peer is missing; they are served from their own task so a slow
    /// peer or local maintenance work never blocks them.
    fn broadcast_heartbeats(self: &Arc<Self>) {
        let (peers, term, target) = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return;
            }
            (
                inner.config.peer_ids(self.cfg.node_id),
                inner.current_term,
                inner.last_log_index(),
            )
        };
        for peer in peers {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to(peer, target, term).await;
                node.maybe_advance_commit().await;
            });
        }
    }

    /// Push the log towards `peer` until it has everything up to `target`.
    /// Returns true once the peer's durable match index reaches `target`.
    async fn replicate_to(self: &Arc<Self>, peer: NodeId, target: LogIndex, term: Term) -> bool {
        loop {
            let req = {
                let inner = self.inner.lock().unwrap();
                if inner.role != Role::Leader || inner.current_term != term {
                    return false;
                }
                let Some(ls) = inner.leader_state.as_ref() else {
                    return false;
                };
                let matched = ls.match_index.get(&peer).copied().unwrap_or(0);
                if target > 0 && matched >= target {
                    return true;
                }
                let next = ls
                    .next_index
                    .get(&peer)
                    .copied()
                    .unwrap_or(inner.last_log_index() + 1)
                    .max(1);
                let prev = next - 1;
                let prev_term = if prev == 0 {
                    0
                } else {
                    match inner.term_at(prev) {
                        Some(t) => t,
                        None => return false,
                    }
                };
                AppendEntriesRequest {
                    term,
                    leader_id: self.cfg.node_id,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries: inner.entries_from(next, self.cfg.max_entries_per_append),
                    leader_commit: inner.commit_index,
                }
            };
            let sent_through = req
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or(req.prev_log_index);

            let resp = match tokio::time::timeout(
                self.cfg.rpc_timeout,
                self.transport.append_entries(peer, req),
            )
            .await
            {
                Ok(Ok(resp)) => resp,
                _ => return false,
            };

            let mut inner = self.inner.lock().unwrap();
            if resp.term > inner.current_term {
                self.become_follower_locked(&mut inner, resp.term, None);
                return false;
            }
            if inner.role != Role::Leader || inner.current_term != term {
                return false;
            }
            let Some(ls) = inner.leader_state.as_mut() else {
                return false;
            };
            if resp.success {
                let matched = ls.match_index.entry(peer).or_insert(0);
                *matched = (*matched).max(resp.match_index).max(sent_through);
                let matched = *matched;
                ls.next_index.insert(peer, matched + 1);
                if matched >= target {
                    return true;
                }
                // Entry batch was capped; keep pushing.
            } else {
                let rewind = resp.match_index.min(sent_through).saturating_add(1).max(1);
                ls.next_index.insert(peer, rewind);
            }
        }
    }

    /// Leader-side commit advancement from majority match indexes.
    async fn maybe_advance_commit(self: &Arc<Self>) {
        let advanced = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return;
            }
            let majority = inner.config.majority();
            let Some(ls) = inner.leader_state.as_ref() else {
                return;
            };
            let mut matches: Vec<LogIndex> = inner
                .config
                .voting_members()
                .map(|m| {
                    if m.node_id == self.cfg.node_id {
                        inner.last_log_index()
                    } else {
                        ls.match_index.get(&m.node_id).copied().unwrap_or(0)
                    }
                })
                .collect();
            matches.sort_unstable_by(|a, b| b.cmp(a));
            let Some(&candidate) = matches.get(majority - 1) else {
                return;
            };
            if candidate > inner.commit_index && inner.term_at(candidate) == Some(inner.current_term)
            {
                inner.commit_index = candidate;
                true
            } else {
                false
            }
        };
        if advanced {
            self.commit_notify.notify_waiters();
            self.apply_committed().await;
        }
    }

    /// Apply committed entries in order, single-threaded.
    async fn apply_committed(&self) {
        let _guard = self.apply_lock.lock().await;
        loop {
            let next = {
                let inner = self.inner.lock().unwrap();
                if inner.last_applied >= inner.commit_index {
                    return;
                }
                inner.entry_at(inner.last_applied + 1).cloned()
            };
            let Some(entry) = next else { return };
            if let OpPayload::Application(_) = &entry.operation {
                if let Err(err) = self.state_machine.apply(&entry) {
                    tracing::error!(
                        index = entry.index,
                        error = ?err,
                        "state machine apply failed; will retry"
                    );
                    return;
                }
            }
            let mut inner = self.inner.lock().unwrap();
            inner.last_applied = inner.last_applied.max(entry.index);
        }
    }

    /// Follower-side append handler.
    pub async fn handle_append_entries(
        self: &Arc<Self>,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        enum Step {
            Respond(AppendEntriesResponse),
            Drain,
        }
        loop {
            let step = {
                let mut inner = self.inner.lock().unwrap();
                if req.term < inner.current_term {
                    Step::Respond(AppendEntriesResponse {
                        term: inner.current_term,
                        success: false,
                        match_index: 0,
                    })
                } else {
                    self.become_follower_locked(&mut inner, req.term, Some(req.leader_id));

                    if req.prev_log_index > 0
                        && inner.term_at(req.prev_log_index) != Some(req.prev_log_term)
                    {
                        let hint = inner
                            .last_log_index()
                            .min(req.prev_log_index.saturating_sub(1));
                        Step::Respond(AppendEntriesResponse {
                            term: inner.current_term,
                            success: false,
                            match_index: hint,
                        })
                    } else {
                        // Find the first entry that is new or conflicts.
                        let mut conflict: Option<LogIndex> = None;
                        let mut first_new = req.entries.len();
                        for (i, entry) in req.entries.iter().enumerate() {
                            match inner.term_at(entry.index) {
                                Some(t) if t == entry.term => continue,
                                Some(_) => {
                                    conflict = Some(entry.index);
                                    first_new = i;
                                    break;
                                }
                                None => {
                                    first_new = i;
                                    break;
                                }
                            }
                        }

                        if let Some(conflict_index) = conflict {
                            if conflict_index <= inner.commit_index {
                                // A committed entry can never conflict with the
                                // leader's history; continuing would diverge.
                                tracing::error!(
                                    conflict_index,
                                    commit_index = inner.commit_index,
                                    "conflicting entry at or below the commit point"
                                );
                                panic!(
                                    "log conflict below commit point at index {conflict_index}"
                                );
                            }
                            if self.background_ops.active_count() > 0 {
                                Step::Drain
                            } else {
                                let truncated = inner.last_log_index() - (conflict_index - 1);
                                tracing::warn!(
                                    node_id = self.cfg.node_id,
                                    from_index = conflict_index,
                                    truncated,
                                    "rolling back uncommitted suffix"
                                );
                                inner.log.truncate((conflict_index - 1) as usize);
                                let mut wal = self.wal.lock().unwrap();
                                if let Err(err) = wal.truncate_from(conflict_index) {
                                    tracing::error!(error = ?err, "wal truncate failed");
                                    panic!("wal truncate failed: {err:#}");
                                }
                                drop(wal);
                                Step::Respond(self.append_tail_locked(
                                    &mut inner,
                                    &req,
                                    first_new,
                                ))
                            }
                        } else {
                            Step::Respond(self.append_tail_locked(&mut inner, &req, first_new))
                        }
                    }
                }
            };

            match step {
                Step::Respond(resp) => {
                    if resp.success {
                        self.apply_committed().await;
                    }
                    return resp;
                }
                Step::Drain => {
                    // Index builds and migrations must finish or abort before
                    // rollback truncates the log under them.
                    if let Err(err) = self
                        .background_ops
                        .drain(self.cfg.rollback_drain_timeout)
                        .await
                    {
                        tracing::warn!(error = ?err, "rollback blocked on background operations");
                        let inner = self.inner.lock().unwrap();
                        return AppendEntriesResponse {
                            term: inner.current_term,
                            success: false,
                            match_index: inner.commit_index,
                        };
                    }
                }
            }
        }
    }

    fn append_tail_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        req: &AppendEntriesRequest,
        first_new: usize,
    ) -> AppendEntriesResponse {
        let new_entries = &req.entries[first_new..];
        if !new_entries.is_empty() {
            for entry in new_entries {
                if let OpPayload::Reconfig(config) = &entry.operation {
                    inner.config = config.clone();
                }
            }
            inner.log.extend_from_slice(new_entries);
            let mut wal = self.wal.lock().unwrap();
            if let Err(err) = wal.append_entries(new_entries) {
                tracing::error!(error = ?err, "wal append failed");
                panic!("wal append failed: {err:#}");
            }
        }

        let matched = req.prev_log_index + req.entries.len() as LogIndex;
        if req.leader_commit > inner.commit_index {
            inner.commit_index = req.leader_commit.min(matched.max(inner.commit_index));
        }
        self.commit_notify.notify_waiters();
        AppendEntriesResponse {
            term: inner.current_term,
            success: true,
            match_index: matched,
        }
    }

    /// Vote handler.
    pub async fn handle_request_vote(
        self: &Arc<Self>,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let mut inner = self.inner.lock().unwrap();
        if req.term > inner.current_term {
            self.become_follower_locked(&mut inner, req.term, None);
        }
        if req.term < inner.current_term {
            return RequestVoteResponse {
                term: inner.current_term,
                vote_granted: false,
            };
        }

        let self_can_vote = inner
            .config
            .member(self.cfg.node_id)
            .map(|m| m.is_voting())
            .unwrap_or(false);
        let candidate_electable = inner
            .config
            .member(req.candidate_id)
            .map(|m| m.is_electable())
            .unwrap_or(false);
        let log_up_to_date = (req.last_log_term, req.last_log_index)
            >= (inner.last_log_term(), inner.last_log_index());
        let not_already_voted =
            inner.voted_for.is_none() || inner.voted_for == Some(req.candidate_id);

        let granted = self_can_vote && candidate_electable && log_up_to_date && not_already_voted;
        if granted {
            inner.voted_for = Some(req.candidate_id);
            self.persist_hard_locked(&inner);
            inner.reset_election_deadline(&self.cfg);
        }
        RequestVoteResponse {
            term: inner.current_term,
            vote_granted: granted,
        }
    }
}
