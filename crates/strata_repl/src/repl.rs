//! Per-shard replicated log with leader election and majority commit.

mod background;
mod local;
mod node;
mod types;
mod wal;

pub use background::{BackgroundOps, BackgroundOpGuard, PausePoint};
pub use local::{LocalMesh, MeshTransport};
pub use node::{ReplNode, ReplNodeConfig};
pub use types::*;
pub use wal::{HardState, ReplWal};
