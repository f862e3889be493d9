//! # Wire Protocol Messages
//!
//! Every remote operation of [`crate::protocols::TapestryRpc`] has one request
//! variant and answers with one response variant. Messages are serialized with
//! bincode and framed by [`crate::rpc`]; deserialization always goes through
//! [`deserialize_bounded`] so a peer cannot make us allocate past
//! [`MAX_DESERIALIZE_SIZE`].

use std::collections::HashMap;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{NodeId, RemoteNode};
use crate::store::MAX_BLOB_SIZE;

/// Maximum buffer size for deserialization: a full blob plus framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_BLOB_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_request(request: &RpcRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(request)
}

pub fn deserialize_request(data: &[u8]) -> Result<RpcRequest, bincode::Error> {
    deserialize_bounded(data)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Hello {
        joiner: Option<RemoteNode>,
    },
    NextHop {
        target: NodeId,
        level: usize,
    },
    Register {
        key: String,
        holder: RemoteNode,
    },
    Fetch {
        key: String,
    },
    Lookup {
        key: String,
    },
    AddNode {
        joiner: RemoteNode,
    },
    AddNodeMulticast {
        joiner: RemoteNode,
        level: usize,
    },
    Transfer {
        from: RemoteNode,
        registrations: HashMap<String, Vec<RemoteNode>>,
    },
    AddBackpointer {
        from: RemoteNode,
    },
    RemoveBackpointer {
        from: RemoteNode,
    },
    RemoveBadNodes {
        bad: Vec<RemoteNode>,
    },
    GetBackpointers {
        from: RemoteNode,
        level: usize,
    },
    NotifyLeave {
        from: RemoteNode,
        replacement: Option<RemoteNode>,
    },
    BlobFetch {
        key: String,
    },
    BlobStore {
        key: String,
        value: Vec<u8>,
    },
}

impl RpcRequest {
    /// Short operation name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcRequest::Hello { .. } => "hello",
            RpcRequest::NextHop { .. } => "next_hop",
            RpcRequest::Register { .. } => "register",
            RpcRequest::Fetch { .. } => "fetch",
            RpcRequest::Lookup { .. } => "lookup",
            RpcRequest::AddNode { .. } => "add_node",
            RpcRequest::AddNodeMulticast { .. } => "add_node_multicast",
            RpcRequest::Transfer { .. } => "transfer",
            RpcRequest::AddBackpointer { .. } => "add_backpointer",
            RpcRequest::RemoveBackpointer { .. } => "remove_backpointer",
            RpcRequest::RemoveBadNodes { .. } => "remove_bad_nodes",
            RpcRequest::GetBackpointers { .. } => "get_backpointers",
            RpcRequest::NotifyLeave { .. } => "notify_leave",
            RpcRequest::BlobFetch { .. } => "blob_fetch",
            RpcRequest::BlobStore { .. } => "blob_store",
        }
    }

    /// The mesh member the request claims to come from, when it names one.
    pub fn sender(&self) -> Option<&RemoteNode> {
        match self {
            RpcRequest::Transfer { from, .. }
            | RpcRequest::AddBackpointer { from }
            | RpcRequest::RemoveBackpointer { from }
            | RpcRequest::GetBackpointers { from, .. }
            | RpcRequest::NotifyLeave { from, .. } => Some(from),
            RpcRequest::Hello { joiner } => joiner.as_ref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Ack,
    Node(RemoteNode),
    NextHop {
        next: RemoteNode,
        unreachable: Vec<RemoteNode>,
    },
    Registered(bool),
    Holders {
        is_root: bool,
        holders: Vec<RemoteNode>,
    },
    Nodes(Vec<RemoteNode>),
    Blob(Option<Vec<u8>>),
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> RemoteNode {
        RemoteNode::new(NodeId::parse(s).unwrap(), "127.0.0.1:4433")
    }

    #[test]
    fn bounded_deserialization_accepts_full_blob() {
        let request = RpcRequest::BlobStore {
            key: "f1".into(),
            value: vec![7u8; MAX_BLOB_SIZE],
        };
        let bytes = serialize_request(&request).unwrap();
        match deserialize_request(&bytes).unwrap() {
            RpcRequest::BlobStore { key, value } => {
                assert_eq!(key, "f1");
                assert_eq!(value.len(), MAX_BLOB_SIZE);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let request = RpcRequest::BlobStore {
            key: "big".into(),
            value: vec![0u8; MAX_DESERIALIZE_SIZE as usize + 1],
        };
        let bytes = serialize_request(&request).unwrap();
        assert!(deserialize_request(&bytes).is_err());
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_request(&garbage).is_err());

        let request = RpcRequest::AddBackpointer { from: node("abc") };
        let bytes = serialize_request(&request).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_request(truncated).is_err());
    }

    #[test]
    fn next_hop_response_survives_the_wire() {
        let response = RpcResponse::NextHop {
            next: node("123"),
            unreachable: vec![node("9")],
        };
        let bytes = bincode::serialize(&response).unwrap();
        match deserialize_bounded::<RpcResponse>(&bytes).unwrap() {
            RpcResponse::NextHop { next, unreachable } => {
                assert_eq!(next, node("123"));
                assert_eq!(unreachable, vec![node("9")]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn sender_is_extracted_where_present() {
        assert_eq!(
            RpcRequest::NotifyLeave { from: node("a"), replacement: None }.sender(),
            Some(&node("a"))
        );
        assert!(RpcRequest::Fetch { key: "k".into() }.sender().is_none());
        assert_eq!(RpcRequest::Lookup { key: "k".into() }.kind(), "lookup");
    }
}
