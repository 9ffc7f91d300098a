//! # sphinxmix Transport
//!
//! Mix network node and client built on the Sphinx packet format.
//!
//! ## Features
//!
//! - **Sphinx Packets**: fixed-size onion packets, re-encrypted at every hop
//! - **Replay Detection**: every hop accepts a packet's tag at most once
//! - **Mixing Strategies**: threshold batching and continuous-time delays
//! - **Routes**: random draws from the directory, or a fixed cascade
//! - **Reply Blocks**: single-use blocks letting anyone answer a client
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌────────┐   ┌────────┐   ┌────────┐
//! │ Client │──▶│ Mix 1  │──▶│ Mix 2  │──▶│  Exit  │──▶ application
//! └────────┘   └────────┘   └────────┘   └────────┘
//!      ▲                                      │
//!      └──────────── reply block ─────────────┘
//! ```
//!
//! Each mix runs [`hop::unwrap_packet`] on an inbound packet, hands the
//! re-encrypted packet to its [`scheduler::MixScheduler`], and the scheduler
//! releases it towards the next hop after mixing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hop;
pub mod mixnet;
pub mod node;
pub mod packet;
pub mod pki;
pub mod replay;
pub mod route;
pub mod scheduler;
pub mod sphinx;
pub mod transport;

pub use hop::{unwrap_packet, UnwrapResult};
pub use mixnet::{MixClient, MixClientBuilder, MixClientConfig, ReceivedMessage};
pub use node::{ExitDelivery, MixNode, MixNodeBuilder, MixNodeConfig, NodeStats};
pub use packet::{MixPacket, SphinxParams, SECURITY_PARAMETER};
pub use pki::{MemoryPki, MixPki, NodeAddr};
pub use replay::{MemoryReplayCache, ReplayCache};
pub use route::{CascadeRouteFactory, RandomRouteFactory, RouteDescriptor, RouteFactory};
pub use scheduler::{MixScheduler, MixStrategy, Outbound};
pub use sphinx::{MessageTag, PathHop, ReplyBlock, SurbKeys};
pub use transport::{MemoryNetwork, MemoryTransport, MixTransport, UdpTransport};

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sphinxmix_crypto::CryptoError;
use thiserror::Error;

/// Size of a node identifier.
pub const NODE_ID_SIZE: usize = 16;

/// Type tag of a mix node identifier.
pub const MIX_NODE_TAG: u8 = 0xff;

/// Type tag of a client identifier.
pub const CLIENT_TAG: u8 = 0xf0;

/// Number of random bytes following the type tag in a generated identifier.
const NODE_ID_RANDOM_SIZE: usize = 4;

/// Errors that can occur in the mix network layer.
#[derive(Debug, Error)]
pub enum MixError {
    /// Packet length does not match the configured dimensions.
    #[error("Malformed packet: expected {expected} bytes, got {actual}")]
    MalformedPacketError {
        /// Configured packet size.
        expected: usize,
        /// Received packet size.
        actual: usize,
    },

    /// Header MAC mismatch, non-contributory element, or tampered payload.
    #[error("Packet integrity check failed")]
    IntegrityError,

    /// The packet's replay tag was seen before.
    #[error("Replayed packet")]
    ReplayError,

    /// No reply keys are registered for the message tag.
    #[error("Unknown message tag")]
    UnknownTagError,

    /// The directory is too small to build a route.
    #[error("Insufficient route pool: need {needed} nodes, have {available}")]
    InsufficientRoutePoolError {
        /// Nodes required besides the destination.
        needed: usize,
        /// Eligible nodes in the directory.
        available: usize,
    },

    /// A route is longer than the parameters allow.
    #[error("Route too long: {hops} hops, maximum {max}")]
    RouteTooLongError {
        /// Route length.
        hops: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Invalid route configuration.
    #[error("Invalid route: {0}")]
    InvalidRouteError(String),

    /// A message does not fit in the payload.
    #[error("Payload too large: {size} bytes, maximum {max}")]
    PayloadTooLargeError {
        /// Message size.
        size: usize,
        /// Largest message that fits.
        max: usize,
    },

    /// Decrypted routing information carries an unknown marker.
    #[error("Invalid routing information (marker {0:#04x})")]
    InvalidRoutingError(u8),

    /// Decrypted payload has broken padding.
    #[error("Invalid payload padding")]
    InvalidPayloadError,

    /// The directory has no entry for a mix node.
    #[error("Unknown node {0}")]
    UnknownNodeError(NodeId),

    /// The directory has no address for a client.
    #[error("Unknown client {0}")]
    UnknownClientError(NodeId),

    /// An address is registered under another transport.
    #[error("Transport mismatch: expected {expected}, registered {actual}")]
    TransportMismatchError {
        /// Transport asked for.
        expected: String,
        /// Transport the address belongs to.
        actual: String,
    },

    /// Directory operation failed.
    #[error("PKI error: {0}")]
    PkiError(String),

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    /// The component has been shut down.
    #[error("Shut down")]
    Shutdown,
}

/// Result type for mix network operations.
pub type Result<T> = std::result::Result<T, MixError>;

/// What kind of party a [`NodeId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A mix node.
    Mix,
    /// A client.
    Client,
}

/// Identifier of a mix node or client.
///
/// The first byte is a type tag, the rest a short random suffix padded with
/// zeros.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a node ID from bytes.
    pub fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random mix node identifier.
    pub fn random_mix<R: RngCore>(rng: &mut R) -> Self {
        Self::generate(rng, MIX_NODE_TAG)
    }

    /// Generate a random client identifier.
    pub fn random_client<R: RngCore>(rng: &mut R) -> Self {
        Self::generate(rng, CLIENT_TAG)
    }

    fn generate<R: RngCore>(rng: &mut R, tag: u8) -> Self {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = tag;
        rng.fill_bytes(&mut bytes[1..1 + NODE_ID_RANDOM_SIZE]);
        Self(bytes)
    }

    /// Parse a node ID from a slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; NODE_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// The kind of party, if the tag is a known one.
    pub fn kind(&self) -> Option<NodeKind> {
        match self.0[0] {
            MIX_NODE_TAG => Some(NodeKind::Mix),
            CLIENT_TAG => Some(NodeKind::Client),
            _ => None,
        }
    }

    /// Get the bytes of the node ID.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let mut rng = rand::thread_rng();
        let mix = NodeId::random_mix(&mut rng);
        let client = NodeId::random_client(&mut rng);

        assert_eq!(mix.kind(), Some(NodeKind::Mix));
        assert_eq!(client.kind(), Some(NodeKind::Client));
        assert_eq!(&mix.as_bytes()[1 + NODE_ID_RANDOM_SIZE..], &[0u8; 11]);
    }

    #[test]
    fn test_node_id_from_slice() {
        let id = NodeId::new([MIX_NODE_TAG; NODE_ID_SIZE]);
        assert_eq!(NodeId::from_slice(id.as_bytes()), Some(id));
        assert_eq!(NodeId::from_slice(&[0u8; 15]), None);
        assert_eq!(NodeId::new([0u8; NODE_ID_SIZE]).kind(), None);
    }

    #[test]
    fn test_node_id_display() {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = MIX_NODE_TAG;
        bytes[1] = 0x01;
        assert_eq!(NodeId::new(bytes).to_string(), "ff010000000000000000000000000000");
    }
}
