//! Sharded document store built on the `strata_repl` replication engine.
//!
//! The pieces, leaf-first: `storage` (fjall-backed per-shard document
//! partitions), `catalog` (the versioned chunk → shard authority), `shard`
//! (one replicated shard node), `router` (cached routing with stale-version
//! retry) and `migration` (chunk moves with a durable recovery document).

pub mod catalog;
pub mod error;
pub mod migration;
pub mod router;
pub mod shard;
pub mod storage;
