//! # Packet Codec
//!
//! Wire layout of a Sphinx packet: four fixed-length fields concatenated
//! without delimiters.
//!
//! ```text
//! ┌────────┬──────────────────┬────────┬───────────────────┐
//! │ alpha  │ beta             │ gamma  │ delta             │
//! │ 32 B   │ (2r + 1) * k B   │ k B    │ payload + k B     │
//! └────────┴──────────────────┴────────┴───────────────────┘
//! ```
//!
//! with `k` = [`SECURITY_PARAMETER`] and `r` the maximum number of hops.

use serde::{Deserialize, Serialize};
use sphinxmix_crypto::{GroupElement, GROUP_ELEMENT_SIZE, MAC_SIZE};

use crate::{MixError, Result, NODE_ID_SIZE};

/// Security parameter `k` in bytes.
pub const SECURITY_PARAMETER: usize = 16;

/// Zero bytes prepended to every payload and checked at the last hop.
pub const PAYLOAD_TAG_SIZE: usize = SECURITY_PARAMETER;

/// Default maximum route length.
pub const DEFAULT_MAX_HOPS: usize = 5;

/// Default payload size in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 1024;

/// Packet geometry shared by every party of one network.
///
/// Passed explicitly to every constructor; nothing reads a global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphinxParams {
    /// Maximum number of hops in a route.
    pub max_hops: usize,
    /// Payload capacity in bytes (before the payload tag).
    pub payload_size: usize,
}

impl Default for SphinxParams {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }
}

impl SphinxParams {
    /// Create validated parameters.
    pub fn new(max_hops: usize, payload_size: usize) -> Result<Self> {
        let params = Self {
            max_hops,
            payload_size,
        };
        params.validate()?;
        Ok(params)
    }

    /// Reject geometries that cannot carry a routed message.
    pub fn validate(&self) -> Result<()> {
        if self.max_hops == 0 {
            return Err(MixError::ConfigError("max_hops must be at least 1".into()));
        }
        if self.payload_size <= NODE_ID_SIZE {
            return Err(MixError::ConfigError(format!(
                "payload_size must exceed {} bytes",
                NODE_ID_SIZE
            )));
        }
        Ok(())
    }

    /// Size of the group element.
    pub fn alpha_size(&self) -> usize {
        GROUP_ELEMENT_SIZE
    }

    /// Size of the routing information.
    pub fn beta_size(&self) -> usize {
        (2 * self.max_hops + 1) * SECURITY_PARAMETER
    }

    /// Size of the header MAC.
    pub fn gamma_size(&self) -> usize {
        MAC_SIZE
    }

    /// Size of the onion payload.
    pub fn delta_size(&self) -> usize {
        self.payload_size + PAYLOAD_TAG_SIZE
    }

    /// Size of a header (alpha, beta, gamma).
    pub fn header_size(&self) -> usize {
        self.alpha_size() + self.beta_size() + self.gamma_size()
    }

    /// Total wire size of a packet.
    pub fn packet_size(&self) -> usize {
        self.header_size() + self.delta_size()
    }

    /// Largest forward message: the payload also carries the destination
    /// and one padding marker byte.
    pub fn max_forward_message_size(&self) -> usize {
        self.payload_size.saturating_sub(NODE_ID_SIZE + 1)
    }

    /// Largest reply message.
    pub fn max_reply_message_size(&self) -> usize {
        self.payload_size.saturating_sub(1)
    }
}

/// A Sphinx packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixPacket {
    /// Blinded group element.
    pub alpha: GroupElement,
    /// Encrypted routing information.
    pub beta: Vec<u8>,
    /// MAC over beta.
    pub gamma: [u8; MAC_SIZE],
    /// Onion-encrypted payload.
    pub delta: Vec<u8>,
}

/// Concatenate the four fields in wire order.
pub fn encode(alpha: &[u8], beta: &[u8], gamma: &[u8], delta: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(alpha.len() + beta.len() + gamma.len() + delta.len());
    bytes.extend_from_slice(alpha);
    bytes.extend_from_slice(beta);
    bytes.extend_from_slice(gamma);
    bytes.extend_from_slice(delta);
    bytes
}

impl MixPacket {
    /// Serialize to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.alpha, &self.beta, &self.gamma, &self.delta)
    }

    /// Split wire bytes into the four fields. Only the length is checked.
    pub fn from_bytes(params: &SphinxParams, bytes: &[u8]) -> Result<Self> {
        let expected = params.packet_size();
        if bytes.len() != expected {
            return Err(MixError::MalformedPacketError {
                expected,
                actual: bytes.len(),
            });
        }

        let (alpha, rest) = bytes.split_at(params.alpha_size());
        let (beta, rest) = rest.split_at(params.beta_size());
        let (gamma, delta) = rest.split_at(params.gamma_size());

        let alpha: GroupElement = alpha
            .try_into()
            .map_err(|_| MixError::MalformedPacketError { expected, actual: bytes.len() })?;
        let gamma: [u8; MAC_SIZE] = gamma
            .try_into()
            .map_err(|_| MixError::MalformedPacketError { expected, actual: bytes.len() })?;

        Ok(Self {
            alpha,
            beta: beta.to_vec(),
            gamma,
            delta: delta.to_vec(),
        })
    }

    /// Whether every field has the size `params` prescribes.
    pub fn matches(&self, params: &SphinxParams) -> bool {
        self.beta.len() == params.beta_size() && self.delta.len() == params.delta_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(params: &SphinxParams) -> MixPacket {
        MixPacket {
            alpha: [1u8; GROUP_ELEMENT_SIZE],
            beta: vec![2u8; params.beta_size()],
            gamma: [3u8; MAC_SIZE],
            delta: vec![4u8; params.delta_size()],
        }
    }

    #[test]
    fn test_default_dimensions() {
        let params = SphinxParams::default();
        assert_eq!(params.beta_size(), 176);
        assert_eq!(params.delta_size(), 1040);
        assert_eq!(params.packet_size(), 32 + 176 + 16 + 1040);
    }

    #[test]
    fn test_codec_roundtrip() {
        let params = SphinxParams::default();
        let packet = sample(&params);
        let bytes = packet.to_bytes();

        assert_eq!(bytes.len(), params.packet_size());
        assert_eq!(MixPacket::from_bytes(&params, &bytes).unwrap(), packet);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let params = SphinxParams::default();
        let mut bytes = sample(&params).to_bytes();
        bytes.pop();

        match MixPacket::from_bytes(&params, &bytes) {
            Err(MixError::MalformedPacketError { expected, actual }) => {
                assert_eq!(expected, params.packet_size());
                assert_eq!(actual, params.packet_size() - 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        bytes.extend_from_slice(&[0u8; 2]);
        assert!(matches!(
            MixPacket::from_bytes(&params, &bytes),
            Err(MixError::MalformedPacketError { .. })
        ));
    }

    #[test]
    fn test_params_validation() {
        assert!(SphinxParams::new(0, 1024).is_err());
        assert!(SphinxParams::new(5, NODE_ID_SIZE).is_err());
        assert!(SphinxParams::new(1, NODE_ID_SIZE + 1).is_ok());
    }

    #[test]
    fn test_params_from_json() {
        let params: SphinxParams = serde_json::from_str(r#"{"max_hops": 3}"#).unwrap();
        assert_eq!(params.max_hops, 3);
        assert_eq!(params.payload_size, DEFAULT_PAYLOAD_SIZE);
    }
}
