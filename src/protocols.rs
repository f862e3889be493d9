//! Protocol trait for the mesh's remote operations.
//!
//! The overlay logic in [`crate::mesh`] only depends on [`TapestryRpc`]; the QUIC
//! implementation lives in [`crate::rpc`] and tests substitute an in-memory one.
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `hello` | liveness check, returns the callee's identity |
//! | `next_hop` | one routing step plus the callee's recently-failed peers |
//! | `register` / `fetch` | location registrations at a key's root |
//! | `add_node` / `add_node_multicast` | join notification |
//! | `transfer` | hand location registrations to a closer node |
//! | `add_backpointer` / `remove_backpointer` / `get_backpointers` | backpointer upkeep |
//! | `remove_bad_nodes` | prune peers a caller found unreachable |
//! | `notify_leave` | graceful departure with replacement |
//! | `blob_fetch` / `blob_store` | direct payload access on a holder |

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::RemoteNode;
use crate::identity::NodeId;

#[async_trait]
pub trait TapestryRpc: Send + Sync + 'static {
    /// Ask the node at `addr` who it is; `joiner` is only logged by the callee.
    async fn hello(&self, addr: &str, joiner: Option<RemoteNode>) -> Result<RemoteNode>;

    /// One routing step toward `target`, starting at routing level `level`.
    /// Returns the next hop (the callee itself when it is the root) and the
    /// peers the callee recently found unreachable.
    async fn next_hop(
        &self,
        to: &RemoteNode,
        target: NodeId,
        level: usize,
    ) -> Result<(RemoteNode, Vec<RemoteNode>)>;

    /// Register `holder` for `key` at `to`; false if `to` is not the root.
    async fn register(&self, to: &RemoteNode, key: &str, holder: RemoteNode) -> Result<bool>;

    /// Holders registered for `key` at `to`; the flag is false if `to` is not the root.
    async fn fetch(&self, to: &RemoteNode, key: &str) -> Result<(bool, Vec<RemoteNode>)>;

    /// Holders for `key` resolved by `to` on the caller's behalf.
    async fn lookup(&self, to: &RemoteNode, key: &str) -> Result<Vec<RemoteNode>>;

    /// Ask the root `to` to start the join multicast for `joiner`; returns the
    /// neighbour set collected by the multicast.
    async fn add_node(&self, to: &RemoteNode, joiner: RemoteNode) -> Result<Vec<RemoteNode>>;

    async fn add_node_multicast(
        &self,
        to: &RemoteNode,
        joiner: RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>>;

    async fn transfer(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        registrations: HashMap<String, Vec<RemoteNode>>,
    ) -> Result<()>;

    async fn add_backpointer(&self, to: &RemoteNode, from: RemoteNode) -> Result<()>;

    async fn remove_backpointer(&self, to: &RemoteNode, from: RemoteNode) -> Result<()>;

    async fn remove_bad_nodes(&self, to: &RemoteNode, bad: Vec<RemoteNode>) -> Result<()>;

    /// Backpointers of `to` at `level`; the callee also considers `from` for its table.
    async fn get_backpointers(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>>;

    async fn notify_leave(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        replacement: Option<RemoteNode>,
    ) -> Result<()>;

    async fn blob_fetch(&self, to: &RemoteNode, key: &str) -> Result<Option<Vec<u8>>>;

    async fn blob_store(&self, to: &RemoteNode, key: &str, value: Vec<u8>) -> Result<()>;
}
