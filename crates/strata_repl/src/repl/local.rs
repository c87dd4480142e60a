//! In-process transport connecting `ReplNode`s directly, with link-level
//! partition controls. This is the transport used by multi-node tests and by
//! single-process deployments; a networked transport plugs in through the
//! same `Transport` trait.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::node::ReplNode;
use super::types::*;

#[derive(Default)]
struct MeshState {
    nodes: HashMap<NodeId, Arc<ReplNode>>,
}

/// Registry of co-located nodes plus the set of severed links.
pub struct LocalMesh {
    state: RwLock<MeshState>,
    /// Directed severed links (from, to). Partitions sever both directions.
    severed: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(MeshState::default()),
            severed: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, node: Arc<ReplNode>) {
        self.state
            .write()
            .unwrap()
            .nodes
            .insert(node.node_id(), node);
    }

    /// Sever both directions between `a` and `b`.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut severed = self.severed.lock().unwrap();
        severed.insert((a, b));
        severed.insert((b, a));
    }

    /// Isolate `node` from every other registered node.
    pub fn isolate(&self, node: NodeId) {
        let others: Vec<NodeId> = {
            let state = self.state.read().unwrap();
            state.nodes.keys().copied().filter(|id| *id != node).collect()
        };
        for other in others {
            self.partition(node, other);
        }
    }

    /// Restore both directions between `a` and `b`.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        let mut severed = self.severed.lock().unwrap();
        severed.remove(&(a, b));
        severed.remove(&(b, a));
    }

    pub fn heal_all(&self) {
        self.severed.lock().unwrap().clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> anyhow::Result<Arc<ReplNode>> {
        if self.severed.lock().unwrap().contains(&(from, to)) {
            anyhow::bail!("link severed: {from} -> {to}");
        }
        self.state
            .read()
            .unwrap()
            .nodes
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such node: {to}"))
    }

    /// Build the transport handle node `from` uses to reach its peers.
    pub fn transport_for(self: &Arc<Self>, from: NodeId) -> Arc<MeshTransport> {
        Arc::new(MeshTransport {
            mesh: Arc::clone(self),
            from,
        })
    }
}

/// Per-node view of the mesh.
pub struct MeshTransport {
    mesh: Arc<LocalMesh>,
    from: NodeId,
}

#[async_trait]
impl Transport for MeshTransport {
    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let node = self.mesh.route(self.from, target)?;
        // The receiving side may itself be partitioned from us by now; the
        // response path shares the link, so one check suffices.
        Ok(node.handle_append_entries(req).await)
    }

    async fn request_vote(
        &self,
        target: NodeId,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        let node = self.mesh.route(self.from, target)?;
        Ok(node.handle_request_vote(req).await)
    }
}
