//! # Error Taxonomy
//!
//! Overlay-level failures. Operations return `anyhow::Result` and attach a
//! [`TapestryError`] as context, so callers that care about the category can
//! recover it with `err.downcast_ref::<TapestryError>()`.
//!
//! | Variant | Meaning | Handling |
//! |---------|---------|----------|
//! | `Unreachable` | transport failure reaching a peer | retried against alternates, surfaced when exhausted |
//! | `InvalidIdentifier` | malformed identifier text | fatal to the calling operation |
//! | `NotFound` | no live holder known for a key | only raised by `get`; `fetch` returns an empty set |
//! | `JoinUnreachable` | no reachable seed or root during join | fatal to the join attempt |
//! | `Inconsistent` | lookup exceeded its hop budget | triggers pruning and a retry |
//! | `DuplicateIdentifier` | another member already owns the joiner's identifier | fatal to the join |
//! | `BlobTooLarge` | payload above `MAX_BLOB_SIZE` | rejected before touching the mesh |

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapestryError {
    /// A peer did not answer within the RPC timeout after all attempts.
    Unreachable { addr: String },
    /// Identifier text could not be parsed.
    InvalidIdentifier { input: String, reason: &'static str },
    /// No holder is known for the key, or no holder still has the payload.
    NotFound { key: String },
    /// Neither the seed nor any root candidate answered during join.
    JoinUnreachable { seed: String },
    /// A lookup did not reach a root within the hop budget.
    Inconsistent { target: NodeId, hops: usize },
    /// The surrogate root for our identifier is a different node with the same identifier.
    DuplicateIdentifier { id: NodeId },
    /// Blob payload exceeds the store limit.
    BlobTooLarge { size: usize, max: usize },
}

impl std::fmt::Display for TapestryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TapestryError::Unreachable { addr } => write!(f, "peer {} is unreachable", addr),
            TapestryError::InvalidIdentifier { input, reason } => {
                write!(f, "invalid identifier {:?}: {}", input, reason)
            }
            TapestryError::NotFound { key } => write!(f, "no live holder for key {:?}", key),
            TapestryError::JoinUnreachable { seed } => {
                write!(f, "could not join the mesh through {}", seed)
            }
            TapestryError::Inconsistent { target, hops } => write!(
                f,
                "lookup for {:?} did not converge after {} hops",
                target, hops
            ),
            TapestryError::DuplicateIdentifier { id } => {
                write!(f, "identifier {} is already in use", id)
            }
            TapestryError::BlobTooLarge { size, max } => {
                write!(f, "blob too large: {} bytes (max {})", size, max)
            }
        }
    }
}

impl std::error::Error for TapestryError {}

/// Extract the taxonomy error from an `anyhow` chain, if one is attached.
pub fn classify(err: &anyhow::Error) -> Option<&TapestryError> {
    err.downcast_ref::<TapestryError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_recoverable_from_anyhow_chain() {
        let err = anyhow::anyhow!("connection reset")
            .context(TapestryError::Unreachable { addr: "127.0.0.1:9".into() });
        assert_eq!(
            classify(&err),
            Some(&TapestryError::Unreachable { addr: "127.0.0.1:9".into() })
        );
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn plain_errors_are_unclassified() {
        let err = anyhow::anyhow!("something else");
        assert!(classify(&err).is_none());
    }
}
