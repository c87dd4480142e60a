//! Stateless request dispatcher over a cached catalog snapshot.
//!
//! Targeting is computed against the cached `CollectionRoutingInfo`; a
//! `StaleConfig` from any targeted shard invalidates only that namespace,
//! refreshes from the catalog, and retries the full operation exactly once
//! per staleness episode. Multi-shard fan-outs wait for every shard-local
//! result; failures surface as the most severe error observed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use uuid::Uuid;

use crate::catalog::{CatalogStore, CollectionRoutingInfo, KeyRange, ShardId};
use crate::error::StoreError;
use crate::shard::{ShardNode, ShardOp, ShardResponse, StatementId};

/// Key predicate of a client operation.
#[derive(Clone, Debug)]
pub enum KeyQuery {
    Eq(Vec<u8>),
    Range(KeyRange),
    All,
}

impl KeyQuery {
    fn as_range(&self) -> KeyRange {
        match self {
            KeyQuery::Eq(key) => {
                // [key, key + 0x00): the singleton range holding exactly key.
                let mut upper = key.clone();
                upper.push(0);
                KeyRange::new(key.clone(), upper)
            }
            KeyQuery::Range(range) => range.clone(),
            KeyQuery::All => KeyRange::full(),
        }
    }
}

/// Client-facing operation, dispatched as a tagged variant once here.
#[derive(Clone, Debug)]
pub enum ClientOp {
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
        query: KeyQuery,
        page_size: usize,
    },
}

#[derive(Clone, Debug)]
pub enum ClientResponse {
    Ack,
    Doc(Option<Vec<u8>>),
    Docs(Vec<(Vec<u8>, Vec<u8>)>),
}

/// Intersection of two ranges, `None` when disjoint.
fn intersect(a: &KeyRange, b: &KeyRange) -> Option<KeyRange> {
    if !a.overlaps(b) {
        return None;
    }
    let min = a.min.clone().max(b.min.clone());
    let max = match (a.is_unbounded_above(), b.is_unbounded_above()) {
        (true, true) => Vec::new(),
        (true, false) => b.max.clone(),
        (false, true) => a.max.clone(),
        (false, false) => a.max.clone().min(b.max.clone()),
    };
    Some(KeyRange::new(min, max))
}

/// Minimal (shard, fragment) targeting for `query` against a routing
/// snapshot. Fragments are clipped to the owning chunk so each shard scans
/// only what it owns.
pub fn plan_targets(
    info: &CollectionRoutingInfo,
    query: &KeyQuery,
) -> Vec<(ShardId, KeyRange)> {
    let wanted = query.as_range();
    let mut by_shard: HashMap<ShardId, Vec<KeyRange>> = HashMap::new();
    for chunk in info.chunks_overlapping(&wanted) {
        if let Some(fragment) = intersect(&wanted, &chunk.range) {
            by_shard.entry(chunk.shard).or_default().push(fragment);
        }
    }
    let mut out: Vec<(ShardId, KeyRange)> = Vec::new();
    for (shard, mut fragments) in by_shard {
        fragments.sort_by(|a, b| a.min.cmp(&b.min));
        // Adjacent fragments on the same shard coalesce.
        let mut merged: Vec<KeyRange> = Vec::new();
        for fragment in fragments {
            match merged.last_mut() {
                Some(last) if !last.is_unbounded_above() && last.max == fragment.min => {
                    last.max = fragment.max;
                }
                _ => merged.push(fragment),
            }
        }
        for fragment in merged {
            out.push((shard, fragment));
        }
    }
    out.sort_by(|a, b| (a.0, &a.1.min).cmp(&(b.0, &b.1.min)));
    out
}

pub struct Router {
    catalog: Arc<CatalogStore>,
    shards: HashMap<ShardId, Arc<ShardNode>>,
    cache: Mutex<HashMap<Uuid, Arc<CollectionRoutingInfo>>>,
    refreshes: AtomicU64,
}

impl Router {
    pub fn new(catalog: Arc<CatalogStore>, shards: Vec<Arc<ShardNode>>) -> Self {
        Self {
            catalog,
            shards: shards.into_iter().map(|s| (s.shard_id(), s)).collect(),
            cache: Mutex::new(HashMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Number of catalog refreshes this router has performed. Exposed so
    /// operators (and tests) can see cache churn.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// The (shard, fragment) plan for `query`, from the cached snapshot.
    pub fn route(
        &self,
        collection: Uuid,
        query: &KeyQuery,
    ) -> Result<Vec<(ShardId, KeyRange)>, StoreError> {
        let info = self.routing_info(collection)?;
        Ok(plan_targets(&info, query))
    }

    fn routing_info(&self, collection: Uuid) -> Result<Arc<CollectionRoutingInfo>, StoreError> {
        if let Some(info) = self.cache.lock().unwrap().get(&collection) {
            return Ok(info.clone());
        }
        self.refresh(collection)
    }

    fn refresh(&self, collection: Uuid) -> Result<Arc<CollectionRoutingInfo>, StoreError> {
        let info = self.catalog.get_routing_info(collection)?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().unwrap().insert(collection, info.clone());
        Ok(info)
    }

    fn invalidate(&self, collection: Uuid) {
        self.cache.lock().unwrap().remove(&collection);
        tracing::debug!(collection = %collection, "invalidated cached routing info");
    }

    fn shard(&self, id: ShardId) -> Result<Arc<ShardNode>, StoreError> {
        self.shards
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("unknown shard {id}")))
    }

    /// Execute `op` within `max_time`, refreshing-and-retrying once on a
    /// stale cached view.
    pub async fn execute(
        &self,
        collection: Uuid,
        op: ClientOp,
        max_time: Duration,
    ) -> Result<ClientResponse, StoreError> {
        let deadline = tokio::time::Instant::now() + max_time;
        let mut retried = false;
        loop {
            let info = self.routing_info(collection)?;
            match self.dispatch(&info, op.clone(), deadline).await {
                Err(StoreError::StaleConfig {
                    shard,
                    attached,
                    installed,
                }) if !retried => {
                    tracing::info!(
                        collection = %collection,
                        shard,
                        ?attached,
                        ?installed,
                        "stale routing info; refreshing and retrying"
                    );
                    self.invalidate(collection);
                    self.refresh(collection)?;
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn dispatch(
        &self,
        info: &CollectionRoutingInfo,
        op: ClientOp,
        deadline: tokio::time::Instant,
    ) -> Result<ClientResponse, StoreError> {
        match op {
            ClientOp::Put { key, value, session } => {
                self.single_key(info, &key, ShardOp::Put { key: key.clone(), value, session }, deadline)
                    .await?;
                Ok(ClientResponse::Ack)
            }
            ClientOp::Delete { key, session } => {
                self.single_key(info, &key, ShardOp::Delete { key: key.clone(), session }, deadline)
                    .await?;
                Ok(ClientResponse::Ack)
            }
            ClientOp::Get { key } => {
                match self
                    .single_key(info, &key, ShardOp::Get { key: key.clone() }, deadline)
                    .await?
                {
                    ShardResponse::Doc(doc) => Ok(ClientResponse::Doc(doc)),
                    other => Err(StoreError::Internal(anyhow::anyhow!(
                        "unexpected shard response: {other:?}"
                    ))),
                }
            }
            ClientOp::Scan { query, page_size } => {
                self.fan_out_scan(info, &query, page_size, deadline).await
            }
        }
    }

    async fn single_key(
        &self,
        info: &CollectionRoutingInfo,
        key: &[u8],
        op: ShardOp,
        deadline: tokio::time::Instant,
    ) -> Result<ShardResponse, StoreError> {
        let chunk = info
            .chunk_owning(key)
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("no chunk owns the key")))?;
        let shard = self.shard(chunk.shard)?;
        let attached = info.shard_version(chunk.shard);
        match tokio::time::timeout_at(deadline, shard.execute(info.collection, attached, op)).await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::ExceededTimeLimit),
        }
    }

    /// Fan out a scan to every owning shard, drain each shard's cursor, and
    /// join all results. On deadline expiry any open cursor on the targeted
    /// shard is killed before the error is reported.
    async fn fan_out_scan(
        &self,
        info: &CollectionRoutingInfo,
        query: &KeyQuery,
        page_size: usize,
        deadline: tokio::time::Instant,
    ) -> Result<ClientResponse, StoreError> {
        let targets = plan_targets(info, query);
        let mut calls = Vec::new();
        for (shard_id, fragment) in targets {
            let shard = self.shard(shard_id)?;
            let attached = info.shard_version(shard_id);
            let collection = info.collection;
            calls.push(async move {
                scan_one_shard(shard, collection, attached, fragment, page_size, deadline).await
            });
        }

        let mut docs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut worst: Option<StoreError> = None;
        for result in join_all(calls).await {
            match result {
                Ok(mut items) => docs.append(&mut items),
                Err(err) => {
                    worst = Some(match worst.take() {
                        Some(prior) => prior.merge(err),
                        None => err,
                    });
                }
            }
        }
        if let Some(err) = worst {
            return Err(err);
        }
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ClientResponse::Docs(docs))
    }
}

async fn scan_one_shard(
    shard: Arc<ShardNode>,
    collection: Uuid,
    attached: crate::catalog::ChunkVersion,
    fragment: KeyRange,
    page_size: usize,
    deadline: tokio::time::Instant,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let first = shard
        .execute(
            collection,
            attached,
            ShardOp::Scan {
                range: fragment,
                page_size,
            },
        )
        .await?;
    let ShardResponse::Docs { mut items, mut cursor } = first else {
        return Err(StoreError::Internal(anyhow::anyhow!(
            "unexpected shard response to scan"
        )));
    };
    while let Some(id) = cursor {
        if tokio::time::Instant::now() >= deadline {
            shard.kill_cursor(id);
            return Err(StoreError::ExceededTimeLimit);
        }
        let ShardResponse::Docs {
            items: mut more,
            cursor: next,
        } = shard.get_more(id)?
        else {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "unexpected shard response to getMore"
            )));
        };
        items.append(&mut more);
        cursor = next;
    }
    Ok(items)
}
