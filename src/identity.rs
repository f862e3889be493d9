//! # Identifier Space and Node Identities
//!
//! This module defines the identity types shared by every layer of the mesh:
//!
//! - [`NodeId`]: fixed-length identifier of [`DIGITS`] hexadecimal digits (base [`BASE`])
//! - [`Distance`]: per-digit XOR distance between two identifiers
//! - [`RemoteNode`]: identifier + network address of a mesh member
//! - [`Keypair`]: Ed25519 keypair backing a node's TLS certificate
//!
//! ## Identifier Model
//!
//! Identifiers are 160-bit values stored packed, two digits per byte. Keys are
//! mapped into the same space by hashing ([`NodeId::for_key`]), so routing toward
//! a key and routing toward a node are the same operation.
//!
//! ## Distance
//!
//! `distance(a, b)` is the XOR of the two identifiers compared lexicographically:
//!
//! - symmetric: `distance(a, b) == distance(b, a)`
//! - `distance(a, a)` is the all-zero minimum, and only `a` reaches it
//! - for a fixed target, distinct identifiers have distinct distances, so ranking
//!   by distance is a total order without a secondary tie-break
//! - a longer shared prefix always yields a smaller distance
//!
//! Digit-wise, the XOR order is exactly the order in which surrogate routing scans
//! the digits of a routing level, which is what makes every node agree on the root.

use std::cmp::Ordering;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::TapestryError;

/// Number of distinct values per identifier digit.
pub const BASE: usize = 16;

/// Number of digits in an identifier (and therefore routing levels).
pub const DIGITS: usize = 40;

/// Packed identifier width: two base-16 digits per byte.
const ID_BYTES: usize = DIGITS / 2;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Parse textual hex digits into an identifier.
    ///
    /// Accepts 1 to [`DIGITS`] hex characters; shorter input is padded on the
    /// right with zero digits, so `"12"` and `"1200"` denote the same identifier.
    pub fn parse(input: &str) -> Result<Self, TapestryError> {
        let invalid = |reason| TapestryError::InvalidIdentifier {
            input: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if input.len() > DIGITS {
            return Err(invalid("identifier has more than 40 digits"));
        }
        if !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("identifier contains a non-hex character"));
        }

        let mut padded = input.to_ascii_lowercase();
        padded.extend(std::iter::repeat_n('0', DIGITS - input.len()));

        let mut bytes = [0u8; ID_BYTES];
        hex::decode_to_slice(&padded, &mut bytes)
            .map_err(|_| invalid("identifier is not valid hex"))?;
        Ok(Self(bytes))
    }

    /// Uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Map an object key into the identifier space.
    pub fn for_key(key: &str) -> Self {
        Self::truncate_hash(blake3::hash(key.as_bytes()))
    }

    /// Derive a node identifier from the public key of its TLS keypair.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self::truncate_hash(blake3::hash(public_key))
    }

    fn truncate_hash(hash: blake3::Hash) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash.as_bytes()[..ID_BYTES]);
        Self(bytes)
    }

    /// Digit at `index` (0 is the most significant).
    #[inline]
    pub fn digit(&self, index: usize) -> u8 {
        let byte = self.0[index / 2];
        if index % 2 == 0 { byte >> 4 } else { byte & 0x0f }
    }

    /// Number of leading digits shared with `other`; `DIGITS` iff equal.
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i * 2 + usize::from(x & 0xf0 == 0);
            }
        }
        DIGITS
    }

    #[inline]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Order `a` and `b` by their distance to `self`.
    #[inline]
    pub fn distance_cmp(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// True when `a` is strictly closer to `self` than `b`.
    #[inline]
    pub fn closer(&self, a: &NodeId, b: &NodeId) -> bool {
        self.distance_cmp(a, b) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First eight digits, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for NodeId {
    type Err = TapestryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// XOR distance between two identifiers, compared digit by digit from the most
/// significant end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

/// A mesh member as seen from another node. Equality and hashing use the
/// identifier only; membership changes replace entries rather than mutate them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: NodeId,
    pub addr: String,
}

impl RemoteNode {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl PartialEq for RemoteNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoteNode {}

impl std::hash::Hash for RemoteNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.addr)
    }
}

/// Ed25519 keypair used for the node's self-signed transport certificate.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Identifier derived from the public key, used when none is configured.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).expect("valid identifier")
    }

    #[test]
    fn parse_pads_short_identifiers_with_zero_digits() {
        assert_eq!(id("12"), id("1200"));
        assert_eq!(id("12").to_hex(), format!("12{}", "0".repeat(38)));
        assert_eq!(id("ABC"), id("abc"));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["", "xyz", "12 4", &"1".repeat(DIGITS + 1)] {
            let err = NodeId::parse(bad).expect_err("must reject");
            assert!(matches!(err, TapestryError::InvalidIdentifier { .. }), "{bad:?}");
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for _ in 0..32 {
            let original = NodeId::random();
            assert_eq!(id(&original.to_string()), original);
        }
    }

    #[test]
    fn digits_unpack_in_order() {
        let node = id("1a2b");
        assert_eq!(node.digit(0), 0x1);
        assert_eq!(node.digit(1), 0xa);
        assert_eq!(node.digit(2), 0x2);
        assert_eq!(node.digit(3), 0xb);
        assert_eq!(node.digit(4), 0x0);
    }

    #[test]
    fn shared_prefix_is_symmetric_and_full_only_for_equal_ids() {
        for _ in 0..64 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.shared_prefix_len(&b), b.shared_prefix_len(&a));
            assert_eq!(a.shared_prefix_len(&a), DIGITS);
            if a != b {
                assert!(a.shared_prefix_len(&b) < DIGITS);
            }
        }
        assert_eq!(id("123").shared_prefix_len(&id("120")), 2);
        assert_eq!(id("123").shared_prefix_len(&id("100")), 1);
        assert_eq!(id("123").shared_prefix_len(&id("200")), 0);
        assert_eq!(id("1").shared_prefix_len(&id("18")), 1);
    }

    #[test]
    fn distance_is_symmetric_and_minimal_at_self() {
        for _ in 0..64 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&a).is_zero());
            if a != b {
                assert!(a.distance(&a) < a.distance(&b));
            }
        }
    }

    #[test]
    fn longer_shared_prefix_is_always_closer() {
        let target = id("123");
        assert!(target.closer(&id("120"), &id("100")));
        assert!(target.closer(&id("100"), &id("200")));
        assert!(target.closer(&id("1f"), &id("2")));
    }

    #[test]
    fn distance_order_is_total_for_a_fixed_target() {
        let target = NodeId::random();
        let a = NodeId::random();
        let b = NodeId::random();
        if a != b {
            assert_ne!(target.distance_cmp(&a, &b), Ordering::Equal);
        }
    }

    #[test]
    fn key_hashing_is_deterministic() {
        assert_eq!(NodeId::for_key("f1"), NodeId::for_key("f1"));
        assert_ne!(NodeId::for_key("f1"), NodeId::for_key("f2"));
    }

    #[test]
    fn remote_node_equality_ignores_address() {
        let a = RemoteNode::new(id("abc"), "127.0.0.1:1");
        let b = RemoteNode::new(id("abc"), "127.0.0.1:2");
        assert_eq!(a, b);
    }

    #[test]
    fn keypair_reconstruction_preserves_node_id() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.node_id(), restored.node_id());
    }
}
