//! # High-Level Node API
//!
//! A [`Node`] is one mesh member listening on a QUIC endpoint. It wires the mesh
//! logic ([`TapestryNode`]) to the QUIC transport ([`RpcNode`] outbound,
//! [`rpc::handle_connection`] inbound) and exposes the operations an application
//! needs.
//!
//! ## Quick Start
//!
//! ```ignore
//! let seed = Node::bind("127.0.0.1:7000").await?;
//! let node = Node::bind("127.0.0.1:7001").await?;
//! node.join("127.0.0.1:7000").await?;
//!
//! node.store("greeting", b"hello".to_vec()).await?;
//! assert_eq!(seed.get("greeting").await?, b"hello".to_vec());
//!
//! node.leave().await?;
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use quinn::Endpoint;
use tracing::{debug, info, warn};

use crate::crypto::{create_client_config, create_server_config, generate_ed25519_cert};
use crate::identity::{Keypair, NodeId, RemoteNode};
use crate::mesh::{MeshConfig, MeshSnapshot, TapestryNode};
use crate::rpc::{self, RpcNode};

/// How a [`Node`] is brought up.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    /// Mesh identifier; derived from the node's public key when unset.
    pub id: Option<NodeId>,
    /// Address other members should dial. Defaults to the bound address, with an
    /// unspecified IP replaced by loopback.
    pub advertise: Option<SocketAddr>,
    pub mesh: MeshConfig,
}

pub struct Node {
    keypair: Keypair,
    endpoint: Endpoint,
    rpcnode: RpcNode,
    mesh: TapestryNode<RpcNode>,
    listener: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Bind with a fresh keypair and a key-derived identifier.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, NodeConfig::default()).await
    }

    /// Bind with an explicit textual identifier.
    pub async fn bind_with_id(addr: &str, id: &str) -> Result<Self> {
        let id = NodeId::parse(id)?;
        let config = NodeConfig {
            id: Some(id),
            ..NodeConfig::default()
        };
        Self::bind_with_config(addr, config).await
    }

    pub async fn bind_with_config(addr: &str, config: NodeConfig) -> Result<Self> {
        Self::create(addr, Keypair::generate(), config).await
    }

    async fn create(addr: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let (server_certs, server_key) = generate_ed25519_cert(&keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(&keypair)?;

        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;
        let local_addr = endpoint.local_addr()?;

        let advertised = match config.advertise {
            Some(advertise) => advertise,
            None if local_addr.ip().is_unspecified() => {
                let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port());
                warn!(bound = %local_addr, advertised = %loopback, "bound to an unspecified address, advertising loopback");
                loopback
            }
            None => local_addr,
        };

        let id = config.id.unwrap_or_else(|| keypair.node_id());
        let local = RemoteNode::new(id, advertised.to_string());

        let rpcnode = RpcNode::new(endpoint.clone(), client_config);
        let mesh = TapestryNode::new(local, rpcnode.clone(), config.mesh);

        let listener = {
            let endpoint = endpoint.clone();
            let mesh = mesh.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let node = mesh.clone();
                    tokio::spawn(async move {
                        if let Err(e) = rpc::handle_connection(node, incoming).await {
                            debug!(error = ?e, "connection error");
                        }
                    });
                }
            })
        };

        info!("Node {}/{}", advertised, id);

        Ok(Self {
            keypair,
            endpoint,
            rpcnode,
            mesh,
            listener,
        })
    }

    /// The node's mesh identifier as hex digits.
    pub fn identity(&self) -> String {
        self.mesh.id().to_hex()
    }

    pub fn node_id(&self) -> NodeId {
        self.mesh.id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("failed to get local address")
    }

    /// The identifier/address pair other members know this node by.
    pub fn remote_node(&self) -> &RemoteNode {
        self.mesh.local()
    }

    pub fn quic_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mesh(&self) -> &TapestryNode<RpcNode> {
        &self.mesh
    }

    /// Join the mesh through the member listening at `seed`.
    pub async fn join(&self, seed: &str) -> Result<()> {
        self.mesh.join(seed).await
    }

    /// Store `value` here and announce this node as its holder.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.mesh.store(key, value).await
    }

    /// Read `key` from any registered holder.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.mesh.get(key).await
    }

    /// Stop holding `key`. Registrations elsewhere lapse once they expire.
    pub async fn remove(&self, key: &str) -> bool {
        self.mesh.remove(key).await
    }

    /// Announce this node as a holder of `key` without storing a blob.
    pub async fn publish(&self, key: &str) -> Result<RemoteNode> {
        self.mesh.publish(key).await
    }

    /// Current holders of `key`.
    pub async fn fetch(&self, key: &str) -> Result<Vec<RemoteNode>> {
        self.mesh.fetch(key).await
    }

    /// The member currently acting as root for `target`.
    pub async fn find_root(&self, target: NodeId) -> Result<RemoteNode> {
        self.mesh.find_root(self.mesh.local().clone(), target).await
    }

    pub async fn snapshot(&self) -> MeshSnapshot {
        self.mesh.snapshot().await
    }

    /// Leave gracefully, then stop serving.
    pub async fn leave(&self) -> Result<()> {
        let result = self.mesh.leave().await;
        self.shutdown().await;
        result
    }

    /// Stop serving without telling anyone, as if the process had crashed.
    pub async fn kill(&self) {
        self.mesh.stop_maintenance();
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.listener.abort();
        let closed = self.rpcnode.close_connections().await;
        self.endpoint.close(0u32.into(), b"shutdown");
        debug!(node = %self.mesh.local(), closed, "endpoint closed");
    }
}

impl Drop for Node {
    /// A node dropped without `leave` or `kill` stops serving and republishing;
    /// connection tasks end once their peers see the endpoint close.
    fn drop(&mut self) {
        self.listener.abort();
        self.mesh.stop_maintenance();
        self.endpoint.close(0u32.into(), b"dropped");
    }
}
