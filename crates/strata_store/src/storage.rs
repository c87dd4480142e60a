//! fjall-backed document storage for one shard.
//!
//! Documents live in a per-shard partition keyed by the 16-byte collection
//! uuid followed by the shard-key bytes, so range scans within a collection
//! are prefix scans. Retryable-write dedup markers get their own partition.

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use uuid::Uuid;

use crate::catalog::{KeyRange, ShardId};

/// Chunked batch size for range deletions, so one huge range does not turn
/// into one huge write batch.
const DELETE_BATCH: usize = 10_000;

pub struct DocumentStore {
    keyspace: Keyspace,
    docs: PartitionHandle,
    sessions: PartitionHandle,
}

fn doc_key(collection: Uuid, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len());
    out.extend_from_slice(collection.as_bytes());
    out.extend_from_slice(key);
    out
}

/// The encoded bounds of `range` within `collection`'s prefix space.
fn range_bounds(collection: Uuid, range: &KeyRange) -> (Vec<u8>, Vec<u8>) {
    let low = doc_key(collection, &range.min);
    let high = if range.is_unbounded_above() {
        // Exclusive upper bound just past the collection prefix.
        let mut prefix = collection.as_bytes().to_vec();
        for byte in prefix.iter_mut().rev() {
            if *byte < u8::MAX {
                *byte += 1;
                return (low, prefix);
            }
            *byte = 0;
        }
        // A collection uuid of all 0xFF cannot occur (v4 uuids carry fixed
        // version bits), but fall back to an impossible sentinel anyway.
        vec![u8::MAX; 17]
    } else {
        doc_key(collection, &range.max)
    };
    (low, high)
}

impl DocumentStore {
    pub fn open(keyspace: Keyspace, shard: ShardId) -> anyhow::Result<Self> {
        let docs = keyspace
            .open_partition(
                &format!("docs_{shard}"),
                PartitionCreateOptions::default(),
            )
            .context("open docs partition")?;
        let sessions = keyspace
            .open_partition(
                &format!("sessions_{shard}"),
                PartitionCreateOptions::default(),
            )
            .context("open sessions partition")?;
        Ok(Self {
            keyspace,
            docs,
            sessions,
        })
    }

    pub fn put(&self, collection: Uuid, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.docs
            .insert(doc_key(collection, key), value)
            .context("insert document")
    }

    pub fn get(&self, collection: Uuid, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let found = self
            .docs
            .get(doc_key(collection, key))
            .context("get document")?;
        Ok(found.map(|v| v.to_vec()))
    }

    pub fn delete(&self, collection: Uuid, key: &[u8]) -> anyhow::Result<()> {
        self.docs
            .remove(doc_key(collection, key))
            .context("delete document")
    }

    /// One page of documents in `range`, strictly after `after` when given.
    /// Returned keys have the collection prefix stripped.
    pub fn scan_page(
        &self,
        collection: Uuid,
        range: &KeyRange,
        after: Option<&[u8]>,
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (mut low, high) = range_bounds(collection, range);
        let mut skip_first = false;
        if let Some(after) = after {
            low = doc_key(collection, after);
            skip_first = true;
        }
        let mut out = Vec::new();
        for item in self.docs.range(low..high) {
            let (k, v) = item.context("scan document range")?;
            if skip_first {
                skip_first = false;
                if k.len() >= 16 && &k[16..] == after.unwrap_or_default() {
                    continue;
                }
            }
            out.push((k[16..].to_vec(), v.to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count_range(&self, collection: Uuid, range: &KeyRange) -> anyhow::Result<usize> {
        let (low, high) = range_bounds(collection, range);
        let mut count = 0usize;
        for item in self.docs.range(low..high) {
            item.context("count document range")?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete every document in `range`, in bounded batches. Returns the
    /// number removed. Safe to re-run; already-deleted keys are just absent.
    pub fn delete_range(&self, collection: Uuid, range: &KeyRange) -> anyhow::Result<usize> {
        let mut removed = 0usize;
        loop {
            let (low, high) = range_bounds(collection, range);
            let mut keys = Vec::with_capacity(DELETE_BATCH);
            for item in self.docs.range(low..high) {
                let (k, _) = item.context("scan range for deletion")?;
                keys.push(k);
                if keys.len() >= DELETE_BATCH {
                    break;
                }
            }
            if keys.is_empty() {
                break;
            }
            let batch_len = keys.len();
            let mut batch = self.keyspace.batch();
            for key in keys {
                batch.remove(&self.docs, key);
            }
            batch.commit().context("commit range deletion batch")?;
            removed += batch_len;
        }
        if removed > 0 {
            tracing::info!(collection = %collection, removed, "deleted range");
        }
        Ok(removed)
    }

    fn session_key(session_id: Uuid, statement_id: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(session_id.as_bytes());
        out.extend_from_slice(&statement_id.to_be_bytes());
        out
    }

    /// Record a retryable-write statement as executed. Returns false when it
    /// was already recorded, in which case the write must not re-apply.
    pub fn mark_statement_executed(
        &self,
        session_id: Uuid,
        statement_id: u64,
    ) -> anyhow::Result<bool> {
        let key = Self::session_key(session_id, statement_id);
        if self
            .sessions
            .get(&key)
            .context("read session marker")?
            .is_some()
        {
            return Ok(false);
        }
        self.sessions
            .insert(&key, [1u8])
            .context("write session marker")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &std::path::Path) -> DocumentStore {
        let keyspace = fjall::Config::new(dir).open().unwrap();
        DocumentStore::open(keyspace, 1).unwrap()
    }

    #[test]
    fn scan_is_isolated_per_collection_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for key in [b"010", b"050", b"090"] {
            store.put(a, key, b"va").unwrap();
            store.put(b, key, b"vb").unwrap();
        }

        let all = store.scan_page(a, &KeyRange::full(), None, 100).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|(_, v)| v == b"va"));

        let tail = store
            .scan_page(a, &KeyRange::new(b"050".to_vec(), vec![]), None, 100)
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, b"050".to_vec());
    }

    #[test]
    fn paged_scan_resumes_after_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let coll = Uuid::new_v4();
        for i in 0..10u32 {
            store
                .put(coll, format!("{i:03}").as_bytes(), b"v")
                .unwrap();
        }
        let first = store.scan_page(coll, &KeyRange::full(), None, 4).unwrap();
        assert_eq!(first.len(), 4);
        let second = store
            .scan_page(coll, &KeyRange::full(), Some(&first.last().unwrap().0), 100)
            .unwrap();
        assert_eq!(second.len(), 6);
        assert_eq!(second[0].0, b"004".to_vec());
    }

    #[test]
    fn delete_range_removes_only_the_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let coll = Uuid::new_v4();
        for i in 0..100u32 {
            store
                .put(coll, format!("{i:03}").as_bytes(), b"v")
                .unwrap();
        }
        let removed = store
            .delete_range(coll, &KeyRange::new(b"050".to_vec(), vec![]))
            .unwrap();
        assert_eq!(removed, 50);
        assert_eq!(store.count_range(coll, &KeyRange::full()).unwrap(), 50);
        // Re-running is a no-op.
        assert_eq!(
            store
                .delete_range(coll, &KeyRange::new(b"050".to_vec(), vec![]))
                .unwrap(),
            0
        );
    }

    #[test]
    fn statement_markers_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let session = Uuid::new_v4();
        assert!(store.mark_statement_executed(session, 1).unwrap());
        assert!(!store.mark_statement_executed(session, 1).unwrap());
        assert!(store.mark_statement_executed(session, 2).unwrap());
    }
}
