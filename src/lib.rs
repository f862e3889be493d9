//! # Tapestry - Prefix-Routing Object Location Mesh
//!
//! Tapestry lets a set of cooperating nodes agree, without coordination, on which
//! member is responsible for any identifier, and uses that agreement to locate
//! objects:
//!
//! - **Identifiers**: 40 hexadecimal digits; keys are hashed into the same space
//! - **Routing**: per-level prefix tables with surrogate routing, so every lookup
//!   for a target ends at the same member (its root)
//! - **Object location**: holders register at the key's root; readers ask the root
//!   who holds it, then fetch from a holder
//! - **Membership**: join via any member, graceful leave with replacements, and
//!   pruning of unreachable peers discovered during routing
//! - **Transport**: QUIC with mutual TLS over self-signed Ed25519 certificates
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bind, join, store/get, leave |
//! | `mesh` | Routing, join, object location and leave protocols |
//! | `identity` | Identifiers, distance, remote node records, keypairs |
//! | `routing` | Routing table with surrogate routing, backpointer index |
//! | `nodeset` | Deduplicated node collections ordered by distance |
//! | `store` | Location registrations and local blob storage |
//! | `protocols` | The remote operation trait (`TapestryRpc`) |
//! | `rpc` | QUIC implementation of `TapestryRpc` and the inbound server |
//! | `connections` | Bounded, single-flight connection cache |
//! | `messages` | Wire request/response types |
//! | `crypto` | TLS certificate generation and verification |
//! | `error` | Error kinds surfaced to callers |

mod connections;
mod crypto;
mod error;
mod identity;
mod mesh;
mod messages;
mod node;
mod nodeset;
mod protocols;
mod routing;
mod rpc;
mod store;

pub use error::{classify, TapestryError};
pub use identity::{Keypair, NodeId, RemoteNode, BASE, DIGITS};
pub use mesh::{MeshConfig, MeshSnapshot, TapestryNode, HOP_BUDGET};
pub use node::{Node, NodeConfig};
pub use protocols::TapestryRpc;
pub use rpc::RpcNode;
pub use store::MAX_BLOB_SIZE;
