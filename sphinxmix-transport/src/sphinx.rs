//! # Sphinx Packet Construction
//!
//! Client-side construction of Sphinx headers, forward packets and single-use
//! reply blocks.
//!
//! A header commits to the whole route up front. For a path of `nu` hops the
//! sender picks one ephemeral scalar `x`, derives each hop's shared secret by
//! successively blinding the hop's public key, precomputes the filler that
//! keeps beta at a constant length while hops strip their routing layer, and
//! then wraps the routing layers from the last hop back to the first.
//!
//! Payloads are wrapped with the wide-block cipher, the most downstream hop
//! innermost, so each hop peels exactly one layer.

use std::fmt;

use rand::{CryptoRng, RngCore};
use sphinxmix_crypto::{
    xor_in_place, CryptoProvider, GroupElement, PacketKeys, PublicKey, SharedSecret, GROUP_ELEMENT_SIZE,
    MAC_SIZE, SCALAR_SIZE, SPRP_KEY_SIZE,
};

use crate::packet::{MixPacket, SphinxParams, PAYLOAD_TAG_SIZE, SECURITY_PARAMETER};
use crate::{MixError, NodeId, Result, NODE_ID_SIZE};

/// Tag identifying which reply block a reply answers.
pub type MessageTag = [u8; SECURITY_PARAMETER];

/// Routing block value telling the last hop to deliver to an exit recipient.
pub const EXIT_MARKER: [u8; NODE_ID_SIZE] = [0u8; NODE_ID_SIZE];

const PAD_MARKER: u8 = 0x7f;
const PAD_FILL: u8 = 0xff;

/// One hop of a path: identity plus published key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHop {
    /// Node identifier.
    pub id: NodeId,
    /// Node public key.
    pub public_key: PublicKey,
}

/// Header part of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SphinxHeader {
    /// Group element for the first hop.
    pub alpha: GroupElement,
    /// Encrypted routing information.
    pub beta: Vec<u8>,
    /// MAC over beta for the first hop.
    pub gamma: [u8; MAC_SIZE],
}

impl SphinxHeader {
    /// Attach a payload.
    pub fn into_packet(self, delta: Vec<u8>) -> MixPacket {
        MixPacket {
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
            delta,
        }
    }
}

/// A single-use reply block.
///
/// Whoever holds it can send one reply to the client that made it, without
/// learning who or where the client is.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    /// First mix of the reply route.
    pub first_hop: NodeId,
    /// Precomputed header.
    pub header: SphinxHeader,
    /// Key the replier encrypts the payload with.
    pub payload_key: [u8; SPRP_KEY_SIZE],
}

impl fmt::Debug for ReplyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyBlock")
            .field("first_hop", &self.first_hop)
            .finish_non_exhaustive()
    }
}

impl ReplyBlock {
    /// Encoded size for the given parameters.
    pub fn encoded_size(params: &SphinxParams) -> usize {
        NODE_ID_SIZE + params.header_size() + SPRP_KEY_SIZE
    }

    /// Serialize for embedding in a message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            NODE_ID_SIZE + GROUP_ELEMENT_SIZE + self.header.beta.len() + MAC_SIZE + SPRP_KEY_SIZE,
        );
        bytes.extend_from_slice(self.first_hop.as_bytes());
        bytes.extend_from_slice(&self.header.alpha);
        bytes.extend_from_slice(&self.header.beta);
        bytes.extend_from_slice(&self.header.gamma);
        bytes.extend_from_slice(&self.payload_key);
        bytes
    }

    /// Parse a serialized reply block.
    pub fn from_bytes(params: &SphinxParams, bytes: &[u8]) -> Result<Self> {
        let expected = Self::encoded_size(params);
        let malformed = || MixError::MalformedPacketError {
            expected,
            actual: bytes.len(),
        };
        if bytes.len() != expected {
            return Err(malformed());
        }

        let (first_hop, rest) = bytes.split_at(NODE_ID_SIZE);
        let (alpha, rest) = rest.split_at(GROUP_ELEMENT_SIZE);
        let (beta, rest) = rest.split_at(params.beta_size());
        let (gamma, payload_key) = rest.split_at(MAC_SIZE);

        Ok(Self {
            first_hop: NodeId::from_slice(first_hop).ok_or_else(malformed)?,
            header: SphinxHeader {
                alpha: alpha.try_into().map_err(|_| malformed())?,
                beta: beta.to_vec(),
                gamma: gamma.try_into().map_err(|_| malformed())?,
            },
            payload_key: payload_key.try_into().map_err(|_| malformed())?,
        })
    }
}

/// Keys a client keeps to open the reply sent through one of its blocks.
#[derive(Clone)]
pub struct SurbKeys {
    payload_key: [u8; SPRP_KEY_SIZE],
    hop_keys: Vec<[u8; SPRP_KEY_SIZE]>,
}

impl fmt::Debug for SurbKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SurbKeys({} hops)", self.hop_keys.len())
    }
}

/// Build a header for `path`; the last hop finds `destination` and `tag` in
/// its routing block.
///
/// Returns the header and the per-hop keys in path order.
pub fn create_header<R: RngCore + CryptoRng>(
    crypto: &dyn CryptoProvider,
    params: &SphinxParams,
    rng: &mut R,
    path: &[PathHop],
    destination: &[u8; NODE_ID_SIZE],
    tag: &MessageTag,
) -> Result<(SphinxHeader, Vec<PacketKeys>)> {
    params.validate()?;
    let nu = path.len();
    if nu == 0 {
        return Err(MixError::InvalidRouteError("route cannot be empty".into()));
    }
    if nu > params.max_hops {
        return Err(MixError::RouteTooLongError {
            hops: nu,
            max: params.max_hops,
        });
    }

    let k = SECURITY_PARAMETER;
    let beta_len = params.beta_size();
    let stream_len = beta_len + 2 * k;

    let mut x = [0u8; SCALAR_SIZE];
    rng.fill_bytes(&mut x);

    // Shared secrets: s_i = y_i ^ (x * b_0 * ... * b_{i-1})
    let mut blinds: Vec<[u8; SCALAR_SIZE]> = vec![x];
    let alpha = crypto.exp(&crypto.generator(), &x);
    let mut keys = Vec::with_capacity(nu);
    for hop in path {
        let secret = blinds
            .iter()
            .fold(*hop.public_key.as_bytes(), |acc, b| crypto.exp(&acc, b));
        let hop_keys = crypto.derive_keys(&SharedSecret::from_bytes(secret))?;
        blinds.push(hop_keys.blinding_factor);
        keys.push(hop_keys);
    }

    // Filler: what the hops before the last one shift into the tail of beta.
    let mut filler: Vec<u8> = Vec::with_capacity(2 * k * (nu - 1));
    for hop_keys in &keys[..nu - 1] {
        filler.extend_from_slice(&[0u8; 2 * SECURITY_PARAMETER]);
        let stream = crypto.stream(&hop_keys.header_encryption, stream_len);
        let offset = stream_len - filler.len();
        xor_in_place(&mut filler, &stream[offset..]);
    }

    // Innermost routing block: destination, tag, zero padding, then filler.
    let last = &keys[nu - 1];
    let head_len = beta_len - filler.len();
    let mut beta = vec![0u8; head_len];
    beta[..k].copy_from_slice(destination);
    beta[k..2 * k].copy_from_slice(tag);
    let stream = crypto.stream(&last.header_encryption, stream_len);
    xor_in_place(&mut beta, &stream[..head_len]);
    beta.extend_from_slice(&filler);
    let mut gamma = crypto.mac(&last.header_mac, &beta)?;

    for i in (0..nu - 1).rev() {
        let mut wrapped = Vec::with_capacity(beta_len);
        wrapped.extend_from_slice(path[i + 1].id.as_bytes());
        wrapped.extend_from_slice(&gamma);
        wrapped.extend_from_slice(&beta[..beta_len - 2 * k]);
        let stream = crypto.stream(&keys[i].header_encryption, stream_len);
        xor_in_place(&mut wrapped, &stream[..beta_len]);
        beta = wrapped;
        gamma = crypto.mac(&keys[i].header_mac, &beta)?;
    }

    Ok((
        SphinxHeader {
            alpha,
            beta,
            gamma,
        },
        keys,
    ))
}

/// Build a forward packet carrying `message` to `destination` via `path`.
pub fn create_forward_packet<R: RngCore + CryptoRng>(
    crypto: &dyn CryptoProvider,
    params: &SphinxParams,
    rng: &mut R,
    path: &[PathHop],
    destination: &NodeId,
    message: &[u8],
) -> Result<MixPacket> {
    params.validate()?;
    let max = params.max_forward_message_size();
    if message.len() > max {
        return Err(MixError::PayloadTooLargeError {
            size: message.len(),
            max,
        });
    }

    let (header, keys) = create_header(crypto, params, rng, path, &EXIT_MARKER, &[0u8; SECURITY_PARAMETER])?;

    let mut body = Vec::with_capacity(params.delta_size());
    body.extend_from_slice(&[0u8; PAYLOAD_TAG_SIZE]);
    body.extend_from_slice(destination.as_bytes());
    body.extend_from_slice(&pad_body(message, params.payload_size - NODE_ID_SIZE)?);

    for hop_keys in keys.iter().rev() {
        crypto.sprp_encrypt(&hop_keys.payload_encryption, &mut body)?;
    }

    Ok(header.into_packet(body))
}

/// Build a reply block routing back to `client_id` via `path`.
///
/// Returns the block, the fresh message tag the reply will arrive under, and
/// the keys needed to open that reply.
pub fn create_reply_block<R: RngCore + CryptoRng>(
    crypto: &dyn CryptoProvider,
    params: &SphinxParams,
    rng: &mut R,
    path: &[PathHop],
    client_id: &NodeId,
) -> Result<(ReplyBlock, MessageTag, SurbKeys)> {
    let mut tag: MessageTag = [0u8; SECURITY_PARAMETER];
    rng.fill_bytes(&mut tag);

    let (header, keys) = create_header(crypto, params, rng, path, client_id.as_bytes(), &tag)?;

    let mut payload_key = [0u8; SPRP_KEY_SIZE];
    rng.fill_bytes(&mut payload_key);

    let block = ReplyBlock {
        first_hop: path[0].id,
        header,
        payload_key,
    };
    let surb_keys = SurbKeys {
        payload_key,
        hop_keys: keys.iter().map(|k| k.payload_encryption).collect(),
    };
    Ok((block, tag, surb_keys))
}

/// Turn a reply block and a message into a packet for the block's first hop.
pub fn packet_from_reply_block(
    crypto: &dyn CryptoProvider,
    params: &SphinxParams,
    block: &ReplyBlock,
    message: &[u8],
) -> Result<(NodeId, MixPacket)> {
    params.validate()?;
    if block.header.beta.len() != params.beta_size() {
        return Err(MixError::MalformedPacketError {
            expected: params.beta_size(),
            actual: block.header.beta.len(),
        });
    }

    let mut body = Vec::with_capacity(params.delta_size());
    body.extend_from_slice(&[0u8; PAYLOAD_TAG_SIZE]);
    body.extend_from_slice(&pad_body(message, params.payload_size)?);
    crypto.sprp_encrypt(&block.payload_key, &mut body)?;

    Ok((block.first_hop, block.header.clone().into_packet(body)))
}

/// Open a reply payload delivered for a block made with `keys`.
pub fn decrypt_reply(crypto: &dyn CryptoProvider, keys: &SurbKeys, delta: &[u8]) -> Result<Vec<u8>> {
    let mut body = delta.to_vec();
    for hop_key in keys.hop_keys.iter().rev() {
        crypto.sprp_encrypt(hop_key, &mut body)?;
    }
    crypto.sprp_decrypt(&keys.payload_key, &mut body)?;

    if body.len() < PAYLOAD_TAG_SIZE || body[..PAYLOAD_TAG_SIZE].iter().any(|&b| b != 0) {
        return Err(MixError::IntegrityError);
    }
    unpad_body(&body[PAYLOAD_TAG_SIZE..])
}

/// Pad `message` to exactly `size` bytes: message, 0x7f, then 0xff fill.
pub fn pad_body(message: &[u8], size: usize) -> Result<Vec<u8>> {
    if message.len() >= size {
        return Err(MixError::PayloadTooLargeError {
            size: message.len(),
            max: size.saturating_sub(1),
        });
    }
    let mut body = Vec::with_capacity(size);
    body.extend_from_slice(message);
    body.push(PAD_MARKER);
    body.resize(size, PAD_FILL);
    Ok(body)
}

/// Strip the padding added by [`pad_body`].
pub fn unpad_body(body: &[u8]) -> Result<Vec<u8>> {
    match body.iter().rposition(|&b| b != PAD_FILL) {
        Some(end) if body[end] == PAD_MARKER => Ok(body[..end].to_vec()),
        _ => Err(MixError::InvalidPayloadError),
    }
}
