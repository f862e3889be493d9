//! # RPC Layer
//!
//! QUIC transport for [`TapestryRpc`]. Every call opens one bidirectional stream
//! on a cached connection, writes a length-prefixed bincode [`RpcRequest`] and
//! reads back one length-prefixed [`RpcResponse`].
//!
//! ## Framing
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | bincode payload (len B)   |
//! +----------------+---------------------------+
//! ```
//!
//! Both directions are bounded: requests by [`MAX_REQUEST_SIZE`], responses by
//! [`MAX_RESPONSE_SIZE`]. Inbound reads and request processing each have their own
//! timeout so a slow peer cannot pin a stream forever.
//!
//! ## Connections
//!
//! Outbound connections come from a [`ConnectionManager`] keyed by address.
//! A transport failure invalidates the cached connection and the call is retried
//! once on a fresh one before the error is returned to the mesh layer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tracing::{debug, trace, warn};

use crate::connections::{ConnectionManager, Dialer};
use crate::crypto::{extract_peer_public_key, SERVER_NAME};
use crate::identity::{NodeId, RemoteNode};
use crate::mesh::TapestryNode;
use crate::messages::{self, RpcRequest, RpcResponse, MAX_DESERIALIZE_SIZE};
use crate::protocols::TapestryRpc;

/// Largest response we are willing to read: a full blob plus envelope.
const MAX_RESPONSE_SIZE: usize = MAX_DESERIALIZE_SIZE as usize;

/// Largest request we are willing to read.
const MAX_REQUEST_SIZE: usize = MAX_DESERIALIZE_SIZE as usize;

/// Timeout for one outbound request/response exchange.
const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Dialer
// ============================================================================

/// Dials peers from the node's own endpoint with its client certificate.
pub struct QuicDialer {
    endpoint: Endpoint,
    client_config: ClientConfig,
}

impl QuicDialer {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            endpoint,
            client_config,
        }
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    type Connection = Connection;

    async fn dial(&self, addr: &str) -> Result<Connection> {
        let socket_addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid socket address: {}", addr))?;

        let conn = self
            .endpoint
            .connect_with(self.client_config.clone(), socket_addr, SERVER_NAME)
            .with_context(|| format!("failed to initiate connection to {}", addr))?
            .await
            .with_context(|| format!("failed to establish connection to {}", addr))?;

        trace!(addr = %addr, "dialed peer");
        Ok(conn)
    }

    fn is_alive(&self, connection: &Connection) -> bool {
        connection.close_reason().is_none()
    }
}

// ============================================================================
// RpcNode (client side)
// ============================================================================

/// Outbound half of the QUIC transport. Cheap to clone.
#[derive(Clone)]
pub struct RpcNode {
    connections: Arc<ConnectionManager<QuicDialer>>,
}

impl RpcNode {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            connections: Arc::new(ConnectionManager::new(QuicDialer::new(endpoint, client_config))),
        }
    }

    /// Close every cached outbound connection.
    pub async fn close_connections(&self) -> usize {
        self.connections.close_all().await
    }

    async fn rpc_raw(&self, addr: &str, request: RpcRequest) -> Result<RpcResponse> {
        let kind = request.kind();
        let conn = self.connections.get(addr).await?;

        match self.rpc_inner(&conn, addr, &request).await {
            Ok(response) => Ok(response),
            Err(first) => {
                // The cached connection may have died under us; one fresh try.
                trace!(peer = %addr, op = kind, error = %first, "rpc failed, redialing");
                self.connections.invalidate(addr).await;
                let conn = self.connections.get(addr).await?;
                let result = self.rpc_inner(&conn, addr, &request).await;
                if result.is_err() {
                    self.connections.invalidate(addr).await;
                }
                result
            }
        }
    }

    async fn rpc_inner(&self, conn: &Connection, addr: &str, request: &RpcRequest) -> Result<RpcResponse> {
        tokio::time::timeout(RPC_STREAM_TIMEOUT, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes =
                messages::serialize_request(request).context("failed to serialize request")?;
            let len = request_bytes.len() as u32;
            send.write_all(&len.to_be_bytes()).await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;

            if len > MAX_RESPONSE_SIZE {
                warn!(
                    peer = %addr,
                    size = len,
                    max = MAX_RESPONSE_SIZE,
                    "peer sent oversized response"
                );
                anyhow::bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;

            let response: RpcResponse = messages::deserialize_bounded(&response_bytes)
                .context("failed to deserialize response")?;
            Ok(response)
        })
        .await
        .context("RPC timed out")?
    }

    async fn call(&self, to: &RemoteNode, request: RpcRequest) -> Result<RpcResponse> {
        match self.rpc_raw(&to.addr, request).await? {
            RpcResponse::Error { message } => anyhow::bail!("{} answered with error: {}", to, message),
            response => Ok(response),
        }
    }

    async fn expect_ack(&self, to: &RemoteNode, request: RpcRequest) -> Result<()> {
        let kind = request.kind();
        match self.call(to, request).await? {
            RpcResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to {}: {:?}", kind, other),
        }
    }

    async fn expect_nodes(&self, to: &RemoteNode, request: RpcRequest) -> Result<Vec<RemoteNode>> {
        let kind = request.kind();
        match self.call(to, request).await? {
            RpcResponse::Nodes(nodes) => Ok(nodes),
            other => anyhow::bail!("unexpected response to {}: {:?}", kind, other),
        }
    }
}

#[async_trait]
impl TapestryRpc for RpcNode {
    async fn hello(&self, addr: &str, joiner: Option<RemoteNode>) -> Result<RemoteNode> {
        match self.rpc_raw(addr, RpcRequest::Hello { joiner }).await? {
            RpcResponse::Node(node) => Ok(node),
            RpcResponse::Error { message } => anyhow::bail!("{} answered with error: {}", addr, message),
            other => anyhow::bail!("unexpected response to hello: {:?}", other),
        }
    }

    async fn next_hop(
        &self,
        to: &RemoteNode,
        target: NodeId,
        level: usize,
    ) -> Result<(RemoteNode, Vec<RemoteNode>)> {
        match self.call(to, RpcRequest::NextHop { target, level }).await? {
            RpcResponse::NextHop { next, unreachable } => Ok((next, unreachable)),
            other => anyhow::bail!("unexpected response to next_hop: {:?}", other),
        }
    }

    async fn register(&self, to: &RemoteNode, key: &str, holder: RemoteNode) -> Result<bool> {
        let request = RpcRequest::Register {
            key: key.to_string(),
            holder,
        };
        match self.call(to, request).await? {
            RpcResponse::Registered(accepted) => Ok(accepted),
            other => anyhow::bail!("unexpected response to register: {:?}", other),
        }
    }

    async fn fetch(&self, to: &RemoteNode, key: &str) -> Result<(bool, Vec<RemoteNode>)> {
        match self.call(to, RpcRequest::Fetch { key: key.to_string() }).await? {
            RpcResponse::Holders { is_root, holders } => Ok((is_root, holders)),
            other => anyhow::bail!("unexpected response to fetch: {:?}", other),
        }
    }

    async fn lookup(&self, to: &RemoteNode, key: &str) -> Result<Vec<RemoteNode>> {
        self.expect_nodes(to, RpcRequest::Lookup { key: key.to_string() }).await
    }

    async fn add_node(&self, to: &RemoteNode, joiner: RemoteNode) -> Result<Vec<RemoteNode>> {
        self.expect_nodes(to, RpcRequest::AddNode { joiner }).await
    }

    async fn add_node_multicast(
        &self,
        to: &RemoteNode,
        joiner: RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>> {
        self.expect_nodes(to, RpcRequest::AddNodeMulticast { joiner, level }).await
    }

    async fn transfer(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        registrations: HashMap<String, Vec<RemoteNode>>,
    ) -> Result<()> {
        self.expect_ack(to, RpcRequest::Transfer { from, registrations }).await
    }

    async fn add_backpointer(&self, to: &RemoteNode, from: RemoteNode) -> Result<()> {
        self.expect_ack(to, RpcRequest::AddBackpointer { from }).await
    }

    async fn remove_backpointer(&self, to: &RemoteNode, from: RemoteNode) -> Result<()> {
        self.expect_ack(to, RpcRequest::RemoveBackpointer { from }).await
    }

    async fn remove_bad_nodes(&self, to: &RemoteNode, bad: Vec<RemoteNode>) -> Result<()> {
        self.expect_ack(to, RpcRequest::RemoveBadNodes { bad }).await
    }

    async fn get_backpointers(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>> {
        self.expect_nodes(to, RpcRequest::GetBackpointers { from, level }).await
    }

    async fn notify_leave(
        &self,
        to: &RemoteNode,
        from: RemoteNode,
        replacement: Option<RemoteNode>,
    ) -> Result<()> {
        self.expect_ack(to, RpcRequest::NotifyLeave { from, replacement }).await
    }

    async fn blob_fetch(&self, to: &RemoteNode, key: &str) -> Result<Option<Vec<u8>>> {
        match self.call(to, RpcRequest::BlobFetch { key: key.to_string() }).await? {
            RpcResponse::Blob(value) => Ok(value),
            other => anyhow::bail!("unexpected response to blob_fetch: {:?}", other),
        }
    }

    async fn blob_store(&self, to: &RemoteNode, key: &str, value: Vec<u8>) -> Result<()> {
        let request = RpcRequest::BlobStore {
            key: key.to_string(),
            value,
        };
        self.expect_ack(to, request).await
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Serve one inbound connection until the peer closes it.
pub async fn handle_connection<N: TapestryRpc>(node: TapestryNode<N>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(peer_key) = extract_peer_public_key(&connection) else {
        warn!(remote = %remote, "rejecting connection: no Ed25519 certificate");
        connection.close(0u32.into(), b"certificate required");
        return Err(anyhow::anyhow!("peer presented no usable certificate"));
    };

    debug!(remote = %remote, peer_key = %hex::encode(&peer_key[..8]), "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!(remote = %remote, "connection closed by application");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(quinn::ConnectionError::LocallyClosed) => {
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(node, stream, remote).await {
                debug!(remote = %remote, error = ?e, "stream error");
            }
        });
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let response_bytes = bincode::serialize(response).context("failed to serialize response")?;
    let len = response_bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&response_bytes).await?;
    send.finish()?;
    Ok(())
}

async fn handle_stream<N: TapestryRpc>(
    node: TapestryNode<N>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote_addr: SocketAddr,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(
            remote = %remote_addr,
            size = len,
            max = MAX_REQUEST_SIZE,
            "rejecting oversized request"
        );
        let response = RpcResponse::Error {
            message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
        };
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let request = messages::deserialize_request(&request_bytes).context("failed to deserialize request")?;
    let kind = request.kind();
    trace!(remote = %remote_addr, op = kind, sender = ?request.sender().map(|s| s.id), "inbound request");

    let response = match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, dispatch(&node, request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote_addr, op = kind, "request processing timed out");
            RpcResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    write_response(&mut send, &response).await
}

/// Route a decoded request to the matching mesh handler.
pub async fn dispatch<N: TapestryRpc>(node: &TapestryNode<N>, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Hello { joiner } => RpcResponse::Node(node.handle_hello(joiner).await),
        RpcRequest::NextHop { target, level } => {
            let (next, unreachable) = node.handle_next_hop(target, level).await;
            RpcResponse::NextHop { next, unreachable }
        }
        RpcRequest::Register { key, holder } => {
            RpcResponse::Registered(node.handle_register(&key, holder).await)
        }
        RpcRequest::Fetch { key } => {
            let (is_root, holders) = node.handle_fetch(&key).await;
            RpcResponse::Holders { is_root, holders }
        }
        RpcRequest::Lookup { key } => match node.handle_lookup(&key).await {
            Ok(holders) => RpcResponse::Nodes(holders),
            Err(e) => RpcResponse::Error {
                message: format!("{:#}", e),
            },
        },
        RpcRequest::AddNode { joiner } => RpcResponse::Nodes(node.handle_add_node(joiner).await),
        RpcRequest::AddNodeMulticast { joiner, level } => {
            RpcResponse::Nodes(node.handle_add_node_multicast(joiner, level).await)
        }
        RpcRequest::Transfer { from, registrations } => {
            node.handle_transfer(from, registrations).await;
            RpcResponse::Ack
        }
        RpcRequest::AddBackpointer { from } => {
            node.handle_add_backpointer(from).await;
            RpcResponse::Ack
        }
        RpcRequest::RemoveBackpointer { from } => {
            node.handle_remove_backpointer(from).await;
            RpcResponse::Ack
        }
        RpcRequest::RemoveBadNodes { bad } => {
            node.handle_remove_bad_nodes(bad).await;
            RpcResponse::Ack
        }
        RpcRequest::GetBackpointers { from, level } => {
            RpcResponse::Nodes(node.handle_get_backpointers(from, level).await)
        }
        RpcRequest::NotifyLeave { from, replacement } => {
            node.handle_notify_leave(from, replacement).await;
            RpcResponse::Ack
        }
        RpcRequest::BlobFetch { key } => RpcResponse::Blob(node.handle_blob_fetch(&key).await),
        RpcRequest::BlobStore { key, value } => match node.handle_blob_store(&key, value).await {
            Ok(()) => RpcResponse::Ack,
            Err(e) => RpcResponse::Error {
                message: format!("{:#}", e),
            },
        },
    }
}
